//! Per-poll scheduling switches.

use buildq_core::{FeatureFlags, Flag, Result, Runner};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::FairnessMode;

/// Relation the queue is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueSource {
    /// The pending-builds projection.
    PendingBuilds,
    /// The builds relation, joined against projects at query time.
    BuildsTable,
}

/// Flag values resolved once at the start of a poll and held fixed for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingConfig {
    pub queue_source: QueueSource,
    pub fairness: FairnessMode,
    /// Trust the projection's `instance_runners_enabled` column instead of
    /// joining projects.
    pub denormalized_shared_runners: bool,
    pub temporary_lock: bool,
}

impl SchedulingConfig {
    /// Read every flag for `runner`. A flag service failure fails the poll.
    pub async fn resolve(flags: &dyn FeatureFlags, runner: &Runner) -> Result<Self> {
        let queue_source = if flags.enabled(Flag::PendingBuildsQueueSource, runner).await? {
            QueueSource::PendingBuilds
        } else {
            QueueSource::BuildsTable
        };
        let fairness = if flags.enabled(Flag::DisableFairScheduling, runner).await? {
            FairnessMode::Fifo
        } else {
            FairnessMode::Fair
        };
        let config = Self {
            queue_source,
            fairness,
            denormalized_shared_runners: flags
                .enabled(Flag::DenormalizedSharedRunnersData, runner)
                .await?,
            temporary_lock: flags
                .enabled(Flag::RegisterJobTemporaryLock, runner)
                .await?,
        };

        debug!(
            runner_id = %runner.id,
            queue_source = ?config.queue_source,
            fairness = ?config.fairness,
            denormalized = config.denormalized_shared_runners,
            temporary_lock = config.temporary_lock,
            "Resolved scheduling config"
        );
        Ok(config)
    }

    pub fn with_queue_source(mut self, queue_source: QueueSource) -> Self {
        self.queue_source = queue_source;
        self
    }

    pub fn with_fairness(mut self, fairness: FairnessMode) -> Self {
        self.fairness = fairness;
        self
    }
}

impl Default for SchedulingConfig {
    /// Every flag at its default value.
    fn default() -> Self {
        Self {
            queue_source: QueueSource::PendingBuilds,
            fairness: FairnessMode::Fair,
            denormalized_shared_runners: true,
            temporary_lock: false,
        }
    }
}
