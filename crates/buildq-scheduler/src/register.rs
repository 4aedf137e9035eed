//! Job registration: one runner poll, end to end.

use buildq_config::QueueSettings;
use buildq_core::{ClaimOutcome, JobId, Result, Runner, RunnerScope};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

use crate::metrics::jobs_running_for_project_label;
use crate::{
    BuildQueue, QueueEntry, QueueInstrumentation, QueueOperation, SchedulingConfig, TemporaryLocks,
};

/// Outcome of a registration.
///
/// `valid == false` with no job means the queue could not be fully examined
/// (a conflict, a temporary lock, or the depth limit) and the runner should
/// poll again soon. `valid == true` with no job means there is nothing for
/// this runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResult {
    pub job: Option<JobId>,
    pub valid: bool,
}

impl RegisterResult {
    fn picked(job: JobId) -> Self {
        Self {
            job: Some(job),
            valid: true,
        }
    }

    fn empty(valid: bool) -> Self {
        Self { job: None, valid }
    }
}

/// Hands at most one job to a polling runner.
pub struct JobRegistrar {
    queue: BuildQueue,
    locks: TemporaryLocks,
    settings: QueueSettings,
}

impl JobRegistrar {
    pub fn new(queue: BuildQueue, settings: QueueSettings) -> Self {
        Self {
            queue,
            locks: TemporaryLocks::new(settings.temporary_lock_ttl),
            settings,
        }
    }

    pub fn queue(&self) -> &BuildQueue {
        &self.queue
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Select candidates for `runner` and claim the first one it can get.
    pub async fn register(&self, runner: &Runner) -> Result<RegisterResult> {
        let mut instrumentation = QueueInstrumentation::start(runner, self.settings.max_duration);
        let config = self.queue.scheduling_config(runner).await?;

        let started = Instant::now();
        let entries = self.queue.queue_for(runner, &config).await?;
        instrumentation.record_retrieve(started.elapsed());
        instrumentation.observe_queue_size(entries.len());

        let started = Instant::now();
        let result = self
            .process_queue(runner, &config, &entries, &mut instrumentation)
            .await;
        instrumentation.record_process(started.elapsed());
        instrumentation.finish();

        result
    }

    async fn process_queue(
        &self,
        runner: &Runner,
        config: &SchedulingConfig,
        entries: &[QueueEntry],
        instrumentation: &mut QueueInstrumentation,
    ) -> Result<RegisterResult> {
        instrumentation.increment(QueueOperation::QueueAttempt);
        let mut valid = true;

        for (depth, entry) in entries.iter().enumerate() {
            if depth >= self.settings.max_queue_depth {
                instrumentation.increment(QueueOperation::QueueDepthLimit);
                debug!(
                    runner_id = %runner.id,
                    max_queue_depth = self.settings.max_queue_depth,
                    "Queue depth limit reached"
                );
                valid = false;
                break;
            }
            instrumentation.increment(QueueOperation::QueueIteration);

            if config.temporary_lock && !self.locks.try_acquire(entry.id) {
                instrumentation.increment(QueueOperation::BuildTemporaryLocked);
                valid = false;
                continue;
            }

            let started = Instant::now();
            let outcome = self.queue.store().claim(entry.id, runner).await?;
            instrumentation.record_build(entry.id, started.elapsed());

            match outcome {
                ClaimOutcome::Claimed => {
                    instrumentation.increment(QueueOperation::BuildCanPick);
                    let label = self.running_label(runner, entry).await?;
                    instrumentation.register_success(entry.id, &label);
                    return Ok(RegisterResult::picked(entry.id));
                }
                ClaimOutcome::AlreadyClaimed => {
                    instrumentation.increment(QueueOperation::QueueConflict);
                    valid = false;
                }
            }
        }

        Ok(RegisterResult::empty(valid))
    }

    /// Other jobs of the claimed job's project running on shared runners.
    async fn running_label(&self, runner: &Runner, entry: &QueueEntry) -> Result<String> {
        let running = if runner.is_shared() {
            let counts = self
                .queue
                .store()
                .running_job_count_by_project(RunnerScope::Instance)
                .await?;
            counts
                .get(&entry.project_id)
                .copied()
                .unwrap_or(0)
                .saturating_sub(1)
        } else {
            0
        };
        Ok(jobs_running_for_project_label(
            runner,
            running,
            self.settings.running_jobs_max_bucket,
        ))
    }
}
