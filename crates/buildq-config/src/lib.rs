//! KDL configuration parsing for the buildq build queue.
//!
//! This crate handles parsing of:
//! - Scheduler settings (buildq.kdl)
//! - Queue snapshots used to simulate scheduling decisions

mod kdl_ext;

pub mod error;
pub mod snapshot;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use snapshot::parse_snapshot;
pub use system::{QueueSettings, SystemConfig, load_system_config, parse_system_config};
