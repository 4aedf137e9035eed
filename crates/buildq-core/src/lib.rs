//! Core domain types and traits for the buildq build queue.
//!
//! This crate contains:
//! - Resource identifiers
//! - Runner, job, project and group descriptors
//! - The `QueueStore` query capability
//! - Feature flags

pub mod error;
pub mod flags;
pub mod id;
pub mod job;
pub mod project;
pub mod runner;
pub mod snapshot;
pub mod store;

pub use error::{Error, Result};
pub use flags::{FeatureFlags, Flag, StaticFlags};
pub use id::{GroupId, JobId, ProjectId, RunnerId, TagId};
pub use job::{JobStatus, PendingBuild, PendingJob};
pub use project::{FeatureAccessLevel, Group, Project};
pub use runner::{AccessLevel, Runner, RunnerScope};
pub use snapshot::{QueueSnapshot, SnapshotJob};
pub use store::{ClaimOutcome, QueueStore};
