//! Poller that registers jobs for a runner in a loop.

use crate::{JobRegistrar, RegisterResult};
use buildq_core::{JobId, Runner};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// What a single poll produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Claimed(JobId),
    /// Nothing for this runner.
    Empty,
    /// The queue could not be fully examined; poll again right away.
    Retry,
    Failed,
}

/// Polls the queue on behalf of one runner.
pub struct RunnerPoller {
    runner: Runner,
    registrar: Arc<JobRegistrar>,
    poll_interval: Duration,
    error_backoff: Duration,
}

impl RunnerPoller {
    pub fn new(runner: Runner, registrar: Arc<JobRegistrar>) -> Self {
        let settings = registrar.settings();
        Self {
            poll_interval: settings.poll_interval,
            error_backoff: settings.error_backoff,
            runner,
            registrar,
        }
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    pub async fn poll_once(&self) -> PollOutcome {
        match self.registrar.register(&self.runner).await {
            Ok(RegisterResult { job: Some(id), .. }) => PollOutcome::Claimed(id),
            Ok(RegisterResult {
                job: None,
                valid: true,
            }) => PollOutcome::Empty,
            Ok(RegisterResult {
                job: None,
                valid: false,
            }) => PollOutcome::Retry,
            Err(e) => {
                warn!(runner_id = %self.runner.id, error = %e, "Failed to register job");
                PollOutcome::Failed
            }
        }
    }

    /// Run the polling loop. Returns the claimed jobs once `max_jobs` have
    /// been claimed; without a limit it never returns.
    pub async fn run(&self, max_jobs: Option<usize>) -> Vec<JobId> {
        info!(runner_id = %self.runner.id, runner_type = %self.runner.scope, "Starting poller");
        let mut claimed = Vec::new();
        let mut retried = false;

        loop {
            if max_jobs.is_some_and(|max| claimed.len() >= max) {
                return claimed;
            }

            let outcome = self.poll_once().await;
            let retrying = outcome == PollOutcome::Retry && !retried;
            retried = retrying;

            match outcome {
                PollOutcome::Claimed(id) => {
                    info!(runner_id = %self.runner.id, job_id = %id, "Claimed job");
                    claimed.push(id);
                }
                PollOutcome::Retry if retrying => {
                    debug!(runner_id = %self.runner.id, "Queue changed during poll, retrying");
                }
                PollOutcome::Retry | PollOutcome::Empty => {
                    // No jobs available, wait before polling again
                    sleep(self.poll_interval).await;
                }
                PollOutcome::Failed => {
                    sleep(self.error_backoff).await;
                }
            }
        }
    }
}
