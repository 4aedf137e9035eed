//! Strategy reading the pending-builds projection.
//!
//! Group eligibility comes from the denormalized namespace traversal ids.
//! Shared-runner eligibility comes from `instance_runners_enabled` when the
//! denormalized flag is on, and from a join against projects otherwise.

use async_trait::async_trait;
use buildq_core::{PendingBuild, Result};

use super::{QueueStrategy, StrategyContext, finish_shared_runner_queue};
use crate::scope;

pub struct PendingBuildsStrategy<'a> {
    ctx: StrategyContext<'a>,
}

impl<'a> PendingBuildsStrategy<'a> {
    pub fn new(ctx: StrategyContext<'a>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl<'a> QueueStrategy for PendingBuildsStrategy<'a> {
    type Candidate = PendingBuild;

    fn name(&self) -> &'static str {
        "pending_builds"
    }

    fn context(&self) -> &StrategyContext<'_> {
        &self.ctx
    }

    async fn new_builds(&self) -> Result<Vec<PendingBuild>> {
        self.ctx.store.pending_builds().await
    }

    async fn builds_for_shared_runner(&self) -> Result<Vec<PendingBuild>> {
        let relation = self.new_builds().await?;
        let relation = if self.ctx.config.denormalized_shared_runners {
            relation
                .into_iter()
                .filter(|b| b.instance_runners_enabled)
                .collect()
        } else {
            let eligible =
                scope::shared_runner_projects(self.ctx.store, &scope::project_ids(&relation))
                    .await?;
            scope::retain_projects(relation, &eligible)
        };
        finish_shared_runner_queue(&self.ctx, relation).await
    }

    async fn builds_for_group_runner(&self) -> Result<Vec<PendingBuild>> {
        let Some(group_id) = self.ctx.runner.group_id else {
            return Ok(Vec::new());
        };
        let relation = self
            .new_builds()
            .await?
            .into_iter()
            .filter(|b| b.in_namespaces(&[group_id]))
            .collect();
        Ok(self.order(relation))
    }
}
