//! The query capability the scheduler needs from persistent storage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::{
    GroupId, JobId, PendingBuild, PendingJob, Project, ProjectId, Result, Runner, RunnerScope,
    TagId,
};

/// Result of trying to claim a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOutcome {
    /// The job moved from pending to running on the calling runner.
    Claimed,
    /// The job was no longer pending (claimed elsewhere, canceled, or gone).
    AlreadyClaimed,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed)
    }
}

/// Read queries plus the single atomic write used to claim a job.
///
/// Every method may block on I/O. Failures are fatal for the current poll
/// and are never retried here.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Pending, unassigned jobs from the builds relation.
    async fn pending_jobs(&self) -> Result<Vec<PendingJob>>;

    /// Every row of the pending-builds projection.
    async fn pending_builds(&self) -> Result<Vec<PendingBuild>>;

    /// Running jobs per project, counting only jobs whose runner has `scope`.
    async fn running_job_count_by_project(
        &self,
        scope: RunnerScope,
    ) -> Result<HashMap<ProjectId, u64>>;

    /// Eligibility settings of the given projects. Unknown ids are skipped.
    async fn projects(&self, ids: &[ProjectId]) -> Result<Vec<Project>>;

    async fn project_eligible_for_shared_runners(&self, project_id: ProjectId) -> Result<bool> {
        Ok(self
            .projects(&[project_id])
            .await?
            .first()
            .is_some_and(Project::allows_shared_runners))
    }

    /// Projects of `group_id` and all of its descendant groups.
    async fn group_hierarchy_projects(&self, group_id: GroupId) -> Result<HashSet<ProjectId>>;

    /// Interned ids of the given tag names. Names never seen are skipped.
    async fn tag_ids(&self, names: &[String]) -> Result<BTreeSet<TagId>>;

    /// Atomically move `job_id` from pending to running on `runner`, if it is
    /// still pending. Also drops the job's projection row either way.
    async fn claim(&self, job_id: JobId, runner: &Runner) -> Result<ClaimOutcome>;
}
