//! Build queue selection and job claiming for buildq.
//!
//! Given a polling runner, [`BuildQueue`] narrows the pending jobs down to
//! the ones that runner may execute, orders them, and claims them atomically.
//! [`JobRegistrar`] wraps a single poll with depth limits, temporary locks
//! and instrumentation; [`RunnerPoller`] drives it in a loop.

pub mod config;
pub mod fairness;
pub mod lock;
pub mod metrics;
pub mod protection;
pub mod queue;
pub mod register;
pub mod scope;
pub mod strategy;
pub mod tags;
pub mod worker;

pub use config::{QueueSource, SchedulingConfig};
pub use fairness::FairnessMode;
pub use lock::TemporaryLocks;
pub use metrics::{QueueInstrumentation, QueueOperation};
pub use queue::{BuildQueue, ClaimPartition};
pub use register::{JobRegistrar, RegisterResult};
pub use scope::SharedRunnerEligibility;
pub use strategy::{
    BuildsTableStrategy, PendingBuildsStrategy, QueueCandidate, QueueEntry, QueueStrategy,
    StrategyContext,
};
pub use worker::{PollOutcome, RunnerPoller};
