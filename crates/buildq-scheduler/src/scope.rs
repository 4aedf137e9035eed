//! Project-level eligibility per runner scope.

use async_trait::async_trait;
use buildq_core::{GroupId, ProjectId, QueueStore, Result, Runner};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::QueueCandidate;

/// Extra veto on shared-runner eligibility, consulted per project after the
/// store's own checks. Used for things like exhausted CI quotas.
#[async_trait]
pub trait SharedRunnerEligibility: Send + Sync {
    async fn allows(&self, project_id: ProjectId, runner: &Runner) -> Result<bool>;
}

/// Projects among `ids` whose settings allow shared runners.
pub async fn shared_runner_projects(
    store: &dyn QueueStore,
    ids: &[ProjectId],
) -> Result<HashSet<ProjectId>> {
    let projects = store.projects(ids).await?;
    Ok(projects
        .iter()
        .filter(|p| p.allows_shared_runners())
        .map(|p| p.id)
        .collect())
}

/// Projects at or below `group_id` whose settings allow group runners.
pub async fn group_runner_projects(
    store: &dyn QueueStore,
    group_id: GroupId,
) -> Result<HashSet<ProjectId>> {
    let members: Vec<ProjectId> = store
        .group_hierarchy_projects(group_id)
        .await?
        .into_iter()
        .collect();
    let projects = store.projects(&members).await?;
    Ok(projects
        .iter()
        .filter(|p| p.allows_group_runners())
        .map(|p| p.id)
        .collect())
}

/// Projects assigned to a project runner that can still run jobs.
pub async fn project_runner_projects(
    store: &dyn QueueStore,
    runner: &Runner,
) -> Result<HashSet<ProjectId>> {
    let projects = store.projects(&runner.project_ids).await?;
    Ok(projects
        .iter()
        .filter(|p| p.allows_project_runners())
        .map(|p| p.id)
        .collect())
}

/// Distinct projects of `candidates`, in id order.
pub fn project_ids<C: QueueCandidate>(candidates: &[C]) -> Vec<ProjectId> {
    candidates
        .iter()
        .map(|c| c.project_id())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn retain_projects<C: QueueCandidate>(
    candidates: Vec<C>,
    projects: &HashSet<ProjectId>,
) -> Vec<C> {
    candidates
        .into_iter()
        .filter(|c| projects.contains(&c.project_id()))
        .collect()
}

/// Apply an optional eligibility override, asking once per project.
pub async fn apply_override<C: QueueCandidate>(
    candidates: Vec<C>,
    eligibility: Option<&Arc<dyn SharedRunnerEligibility>>,
    runner: &Runner,
) -> Result<Vec<C>> {
    let Some(eligibility) = eligibility else {
        return Ok(candidates);
    };

    let mut allowed = HashSet::new();
    for project_id in project_ids(&candidates) {
        if eligibility.allows(project_id, runner).await? {
            allowed.insert(project_id);
        }
    }
    Ok(retain_projects(candidates, &allowed))
}
