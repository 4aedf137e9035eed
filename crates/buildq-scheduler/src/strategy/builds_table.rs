//! Legacy strategy reading the builds relation and joining project settings
//! at query time.

use async_trait::async_trait;
use buildq_core::{PendingJob, Result};

use super::{QueueStrategy, StrategyContext, finish_shared_runner_queue};
use crate::scope;

pub struct BuildsTableStrategy<'a> {
    ctx: StrategyContext<'a>,
}

impl<'a> BuildsTableStrategy<'a> {
    pub fn new(ctx: StrategyContext<'a>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl<'a> QueueStrategy for BuildsTableStrategy<'a> {
    type Candidate = PendingJob;

    fn name(&self) -> &'static str {
        "builds_table"
    }

    fn context(&self) -> &StrategyContext<'_> {
        &self.ctx
    }

    async fn new_builds(&self) -> Result<Vec<PendingJob>> {
        self.ctx.store.pending_jobs().await
    }

    async fn builds_for_shared_runner(&self) -> Result<Vec<PendingJob>> {
        let relation = self.new_builds().await?;
        let eligible =
            scope::shared_runner_projects(self.ctx.store, &scope::project_ids(&relation)).await?;
        let relation = scope::retain_projects(relation, &eligible);
        finish_shared_runner_queue(&self.ctx, relation).await
    }

    async fn builds_for_group_runner(&self) -> Result<Vec<PendingJob>> {
        let Some(group_id) = self.ctx.runner.group_id else {
            return Ok(Vec::new());
        };
        let eligible = scope::group_runner_projects(self.ctx.store, group_id).await?;
        let relation = scope::retain_projects(self.new_builds().await?, &eligible);
        Ok(self.order(relation))
    }
}
