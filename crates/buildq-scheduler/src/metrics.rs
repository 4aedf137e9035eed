//! Queue instrumentation.
//!
//! Counters and timings are emitted as structured tracing events labelled
//! with the runner type and metrics shard.

use buildq_core::{JobId, Runner, RunnerId, RunnerScope};
use derive_more::Display;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Events counted while walking the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum QueueOperation {
    #[display("queue_attempt")]
    QueueAttempt,
    #[display("queue_iteration")]
    QueueIteration,
    #[display("queue_conflict")]
    QueueConflict,
    #[display("queue_depth_limit")]
    QueueDepthLimit,
    #[display("build_temporary_locked")]
    BuildTemporaryLocked,
    #[display("build_can_pick")]
    BuildCanPick,
}

/// Label for the number of other jobs the claimed job's project already runs
/// on shared runners. Only shared runners are bucketed.
pub fn jobs_running_for_project_label(runner: &Runner, running: u64, max_bucket: u64) -> String {
    if !runner.is_shared() {
        "+Inf".to_string()
    } else if running > max_bucket {
        format!("{}+", max_bucket)
    } else {
        running.to_string()
    }
}

/// Timings and counters for a single registration.
pub struct QueueInstrumentation {
    runner_id: RunnerId,
    runner_type: RunnerScope,
    shared_runner: bool,
    shard: String,
    max_duration: Duration,
    started: Instant,
    retrieve: Option<Duration>,
    process: Option<Duration>,
    builds: Vec<(JobId, Duration)>,
}

impl QueueInstrumentation {
    pub fn start(runner: &Runner, max_duration: Duration) -> Self {
        Self {
            runner_id: runner.id,
            runner_type: runner.scope,
            shared_runner: runner.is_shared(),
            shard: runner.metrics_shard().to_string(),
            max_duration,
            started: Instant::now(),
            retrieve: None,
            process: None,
            builds: Vec::new(),
        }
    }

    pub fn shard(&self) -> &str {
        &self.shard
    }

    pub fn increment(&self, operation: QueueOperation) {
        debug!(
            operation = %operation,
            runner_id = %self.runner_id,
            runner_type = %self.runner_type,
            shard = %self.shard,
            "Queue operation"
        );
    }

    pub fn observe_queue_size(&self, size: usize) {
        debug!(
            queue_size = size,
            runner_type = %self.runner_type,
            shard = %self.shard,
            "Queue size"
        );
    }

    pub fn record_retrieve(&mut self, elapsed: Duration) {
        self.retrieve = Some(elapsed);
    }

    pub fn record_process(&mut self, elapsed: Duration) {
        self.process = Some(elapsed);
    }

    pub fn record_build(&mut self, job_id: JobId, elapsed: Duration) {
        self.builds.push((job_id, elapsed));
    }

    pub fn register_success(&self, job_id: JobId, jobs_running_for_project: &str) {
        info!(
            job_id = %job_id,
            runner_id = %self.runner_id,
            runner_type = %self.runner_type,
            shared_runner = self.shared_runner,
            shard = %self.shard,
            jobs_running_for_project,
            "Job registered"
        );
    }

    /// Close out the registration, logging the timings if it took longer
    /// than the configured maximum.
    pub fn finish(self) -> Duration {
        let total = self.started.elapsed();
        if total > self.max_duration {
            warn!(
                runner_id = %self.runner_id,
                runner_type = %self.runner_type,
                shard = %self.shard,
                total_ms = total.as_millis() as u64,
                retrieve_ms = self.retrieve.map(|d| d.as_millis() as u64),
                process_ms = self.process.map(|d| d.as_millis() as u64),
                builds_examined = self.builds.len(),
                slowest_build_ms = self.builds.iter().map(|(_, d)| d.as_millis() as u64).max(),
                "RegisterJob exceeded maximum duration"
            );
        }
        total
    }
}
