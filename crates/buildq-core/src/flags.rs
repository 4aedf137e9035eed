//! Feature flags read by the scheduler at decision time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Error, Result, Runner, RunnerId};

/// Toggles consulted at the start of every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    /// Read the queue from the pending-builds projection instead of the
    /// builds relation.
    PendingBuildsQueueSource,
    /// Disaster-recovery switch: order shared-runner queues FIFO.
    DisableFairScheduling,
    /// Use the projection's precomputed shared-runner eligibility.
    DenormalizedSharedRunnersData,
    /// Take a short per-job lock before trying to claim it.
    RegisterJobTemporaryLock,
}

impl Flag {
    pub const ALL: [Flag; 4] = [
        Flag::PendingBuildsQueueSource,
        Flag::DisableFairScheduling,
        Flag::DenormalizedSharedRunnersData,
        Flag::RegisterJobTemporaryLock,
    ];

    /// Name as stored in the flag service.
    pub fn name(&self) -> &'static str {
        match self {
            Flag::PendingBuildsQueueSource => "ci_pending_builds_queue_source",
            Flag::DisableFairScheduling => "ci_queueing_disaster_recovery_disable_fair_scheduling",
            Flag::DenormalizedSharedRunnersData => {
                "ci_queueing_denormalize_shared_runners_information"
            }
            Flag::RegisterJobTemporaryLock => "ci_register_job_temporary_lock",
        }
    }

    /// Value used when the flag has never been set.
    pub fn default_enabled(&self) -> bool {
        match self {
            Flag::PendingBuildsQueueSource => true,
            Flag::DisableFairScheduling => false,
            Flag::DenormalizedSharedRunnersData => true,
            Flag::RegisterJobTemporaryLock => false,
        }
    }
}

impl std::fmt::Display for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Flag::ALL
            .into_iter()
            .find(|flag| flag.name() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown feature flag: {}", s)))
    }
}

/// Source of flag values, scoped to the polling runner.
///
/// Errors are fatal for the poll: the scheduler never substitutes a value of
/// its own for one the flag service failed to return.
#[async_trait]
pub trait FeatureFlags: Send + Sync {
    async fn enabled(&self, flag: Flag, runner: &Runner) -> Result<bool>;
}

/// In-memory flags with optional per-runner overrides.
#[derive(Debug, Clone, Default)]
pub struct StaticFlags {
    global: HashMap<Flag, bool>,
    per_runner: HashMap<(Flag, RunnerId), bool>,
}

impl StaticFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, flag: Flag, enabled: bool) -> Self {
        self.set(flag, enabled);
        self
    }

    pub fn set(&mut self, flag: Flag, enabled: bool) {
        self.global.insert(flag, enabled);
    }

    pub fn set_for_runner(&mut self, flag: Flag, runner: RunnerId, enabled: bool) {
        self.per_runner.insert((flag, runner), enabled);
    }

    pub fn value(&self, flag: Flag, runner: RunnerId) -> bool {
        self.per_runner
            .get(&(flag, runner))
            .or_else(|| self.global.get(&flag))
            .copied()
            .unwrap_or_else(|| flag.default_enabled())
    }
}

#[async_trait]
impl FeatureFlags for StaticFlags {
    async fn enabled(&self, flag: Flag, runner: &Runner) -> Result<bool> {
        Ok(self.value(flag, runner.id))
    }
}
