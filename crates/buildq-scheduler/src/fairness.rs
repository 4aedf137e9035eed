//! Queue ordering.
//!
//! Fair ordering puts jobs from projects with fewer running shared-runner
//! jobs first, falling back to job id. FIFO ordering is plain job id and is
//! what the disaster-recovery switch selects.

use buildq_core::{ProjectId, QueueStore, Result, RunnerScope};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::QueueCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FairnessMode {
    Fair,
    Fifo,
}

pub fn order_fifo<C: QueueCandidate>(candidates: &mut [C]) {
    candidates.sort_by_key(|c| c.build_id());
}

/// Order by `(running jobs of the project, job id)`. Projects missing from
/// `running` count as zero.
pub fn order_fair<C: QueueCandidate>(candidates: &mut [C], running: &HashMap<ProjectId, u64>) {
    candidates.sort_by_key(|c| {
        (
            running.get(&c.project_id()).copied().unwrap_or(0),
            c.build_id(),
        )
    });
}

/// Order candidates for an instance runner. In fair mode the running counts
/// are read once, so the ordering reflects a single snapshot.
pub async fn order_for_shared_runners<C: QueueCandidate>(
    mut candidates: Vec<C>,
    store: &dyn QueueStore,
    mode: FairnessMode,
) -> Result<Vec<C>> {
    match mode {
        FairnessMode::Fifo => order_fifo(&mut candidates),
        FairnessMode::Fair => {
            let running = store
                .running_job_count_by_project(RunnerScope::Instance)
                .await?;
            order_fair(&mut candidates, &running);
        }
    }
    Ok(candidates)
}
