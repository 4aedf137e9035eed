//! Queue strategies.
//!
//! A strategy supplies the initial candidate relation and the scope-specific
//! narrowing for one queue source. Both strategies must produce the same
//! candidates for the same underlying state; they differ only in which
//! relation they read and how eligibility is looked up.

mod builds_table;
mod pending_builds;

pub use builds_table::BuildsTableStrategy;
pub use pending_builds::PendingBuildsStrategy;

use async_trait::async_trait;
use buildq_core::{
    JobId, PendingBuild, PendingJob, ProjectId, QueueStore, Result, Runner, TagId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::{SchedulingConfig, SharedRunnerEligibility, fairness, protection, scope, tags};

/// A row a strategy can filter and order.
pub trait QueueCandidate: Clone + Send + Sync + 'static {
    fn build_id(&self) -> JobId;
    fn project_id(&self) -> ProjectId;
    fn tag_ids(&self) -> &BTreeSet<TagId>;
    fn is_protected(&self) -> bool;
}

impl QueueCandidate for PendingJob {
    fn build_id(&self) -> JobId {
        self.id
    }

    fn project_id(&self) -> ProjectId {
        self.project_id
    }

    fn tag_ids(&self) -> &BTreeSet<TagId> {
        &self.tag_ids
    }

    fn is_protected(&self) -> bool {
        self.protected
    }
}

impl QueueCandidate for PendingBuild {
    fn build_id(&self) -> JobId {
        self.build_id
    }

    fn project_id(&self) -> ProjectId {
        self.project_id
    }

    fn tag_ids(&self) -> &BTreeSet<TagId> {
        &self.tag_ids
    }

    fn is_protected(&self) -> bool {
        self.protected
    }
}

/// A materialized queue position: the job and the project it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: JobId,
    pub project_id: ProjectId,
}

/// Everything a strategy reads during one poll.
#[derive(Clone, Copy)]
pub struct StrategyContext<'a> {
    pub store: &'a dyn QueueStore,
    pub runner: &'a Runner,
    pub config: &'a SchedulingConfig,
    pub eligibility: Option<&'a Arc<dyn SharedRunnerEligibility>>,
}

#[async_trait]
pub trait QueueStrategy: Send + Sync {
    type Candidate: QueueCandidate;

    fn name(&self) -> &'static str;

    fn context(&self) -> &StrategyContext<'_>;

    /// Every pending, unassigned job in this strategy's relation.
    async fn new_builds(&self) -> Result<Vec<Self::Candidate>>;

    /// Jobs an instance runner may take, ordered for fairness.
    async fn builds_for_shared_runner(&self) -> Result<Vec<Self::Candidate>>;

    /// Jobs from projects at or below the runner's group, FIFO.
    async fn builds_for_group_runner(&self) -> Result<Vec<Self::Candidate>>;

    /// Jobs from active projects assigned to the runner, FIFO.
    async fn builds_for_project_runner(&self) -> Result<Vec<Self::Candidate>> {
        let ctx = self.context();
        let eligible = scope::project_runner_projects(ctx.store, ctx.runner).await?;
        let relation = scope::retain_projects(self.new_builds().await?, &eligible);
        Ok(self.order(relation))
    }

    fn builds_for_protected_runner(&self, relation: Vec<Self::Candidate>) -> Vec<Self::Candidate> {
        protection::protected_only(relation)
    }

    fn builds_matching_tag_ids(
        &self,
        relation: Vec<Self::Candidate>,
        tag_ids: &BTreeSet<TagId>,
    ) -> Vec<Self::Candidate> {
        tags::matching_tag_ids(relation, tag_ids)
    }

    fn builds_with_any_tags(&self, relation: Vec<Self::Candidate>) -> Vec<Self::Candidate> {
        tags::with_any_tags(relation)
    }

    /// FIFO ordering for group and project runners.
    fn order(&self, mut relation: Vec<Self::Candidate>) -> Vec<Self::Candidate> {
        fairness::order_fifo(&mut relation);
        relation
    }

    /// Materialize the final ordered relation.
    fn build_ids(&self, relation: &[Self::Candidate]) -> Vec<QueueEntry> {
        relation
            .iter()
            .map(|c| QueueEntry {
                id: c.build_id(),
                project_id: c.project_id(),
            })
            .collect()
    }
}

/// Shared-runner tail common to both strategies: the eligibility override,
/// then fairness ordering.
async fn finish_shared_runner_queue<C: QueueCandidate>(
    ctx: &StrategyContext<'_>,
    relation: Vec<C>,
) -> Result<Vec<C>> {
    let relation = scope::apply_override(relation, ctx.eligibility, ctx.runner).await?;
    fairness::order_for_shared_runners(relation, ctx.store, ctx.config.fairness).await
}
