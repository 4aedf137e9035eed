//! The build queue coordinator.

use buildq_core::{ClaimOutcome, FeatureFlags, JobId, QueueStore, Result, Runner, RunnerScope};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    BuildsTableStrategy, PendingBuildsStrategy, QueueEntry, QueueSource, QueueStrategy,
    SchedulingConfig, SharedRunnerEligibility, StrategyContext,
};

/// How a batch of candidate ids split after a claim attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimPartition {
    /// Ids now running on the calling runner, in candidate order.
    pub claimed: Vec<JobId>,
    /// Every other input id, in candidate order.
    pub unclaimed: Vec<JobId>,
    /// The subset of `unclaimed` that was no longer pending when tried.
    pub conflicts: Vec<JobId>,
}

/// Selects candidates for a runner and claims them.
pub struct BuildQueue {
    store: Arc<dyn QueueStore>,
    flags: Arc<dyn FeatureFlags>,
    eligibility: Option<Arc<dyn SharedRunnerEligibility>>,
}

impl BuildQueue {
    pub fn new(store: Arc<dyn QueueStore>, flags: Arc<dyn FeatureFlags>) -> Self {
        Self {
            store,
            flags,
            eligibility: None,
        }
    }

    /// Install an additional shared-runner eligibility check.
    pub fn with_shared_runner_eligibility(
        mut self,
        eligibility: Arc<dyn SharedRunnerEligibility>,
    ) -> Self {
        self.eligibility = Some(eligibility);
        self
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Resolve this poll's flags for `runner`.
    pub async fn scheduling_config(&self, runner: &Runner) -> Result<SchedulingConfig> {
        SchedulingConfig::resolve(self.flags.as_ref(), runner).await
    }

    /// Ordered ids of every job `runner` may execute right now.
    pub async fn candidates_for(&self, runner: &Runner) -> Result<Vec<JobId>> {
        let config = self.scheduling_config(runner).await?;
        let entries = self.queue_for(runner, &config).await?;
        Ok(entries.into_iter().map(|e| e.id).collect())
    }

    /// Ordered candidates for `runner` under an already resolved config.
    pub async fn queue_for(
        &self,
        runner: &Runner,
        config: &SchedulingConfig,
    ) -> Result<Vec<QueueEntry>> {
        let ctx = StrategyContext {
            store: self.store.as_ref(),
            runner,
            config,
            eligibility: self.eligibility.as_ref(),
        };
        match config.queue_source {
            QueueSource::PendingBuilds => self.select(&PendingBuildsStrategy::new(ctx)).await,
            QueueSource::BuildsTable => self.select(&BuildsTableStrategy::new(ctx)).await,
        }
    }

    async fn select<S: QueueStrategy>(&self, strategy: &S) -> Result<Vec<QueueEntry>> {
        let runner = strategy.context().runner;

        let relation = match runner.scope {
            RunnerScope::Instance => strategy.builds_for_shared_runner().await?,
            RunnerScope::Group => strategy.builds_for_group_runner().await?,
            RunnerScope::Project => strategy.builds_for_project_runner().await?,
        };

        let relation = if runner.is_ref_protected() {
            strategy.builds_for_protected_runner(relation)
        } else {
            relation
        };

        let tag_ids = self.store.tag_ids(&runner.tag_list).await?;
        let relation = strategy.builds_matching_tag_ids(relation, &tag_ids);

        let relation = if runner.run_untagged {
            relation
        } else {
            strategy.builds_with_any_tags(relation)
        };

        let entries = strategy.build_ids(&relation);
        debug!(
            runner_id = %runner.id,
            runner_type = %runner.scope,
            strategy = strategy.name(),
            candidates = entries.len(),
            "Selected queue candidates"
        );
        Ok(entries)
    }

    /// Try to claim up to `limit` of `ids` for `runner`, in order.
    ///
    /// Each claim is an independent compare-and-swap, so concurrent callers
    /// never both win the same job. Losing a race is not an error; the id
    /// lands in `conflicts`. Store failures abort the call.
    pub async fn execute(
        &self,
        runner: &Runner,
        ids: &[JobId],
        limit: usize,
    ) -> Result<ClaimPartition> {
        let mut partition = ClaimPartition::default();

        for &id in ids {
            if partition.claimed.len() >= limit {
                partition.unclaimed.push(id);
                continue;
            }
            match self.store.claim(id, runner).await? {
                ClaimOutcome::Claimed => {
                    info!(job_id = %id, runner_id = %runner.id, "Claimed job");
                    partition.claimed.push(id);
                }
                ClaimOutcome::AlreadyClaimed => {
                    debug!(job_id = %id, runner_id = %runner.id, "Job no longer pending");
                    partition.unclaimed.push(id);
                    partition.conflicts.push(id);
                }
            }
        }

        Ok(partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use buildq_core::{
        AccessLevel, Error, FeatureAccessLevel, Flag, Group, GroupId, PendingBuild, PendingJob,
        Project, ProjectId, RunnerId, StaticFlags, TagId,
    };
    use buildq_db::MemoryStore;
    use std::collections::{BTreeSet, HashMap, HashSet};

    fn ids(raw: &[i64]) -> Vec<JobId> {
        raw.iter().copied().map(JobId::new).collect()
    }

    fn queue(store: &Arc<MemoryStore>, flags: StaticFlags) -> BuildQueue {
        BuildQueue::new(store.clone(), Arc::new(flags))
    }

    fn both_sources() -> [StaticFlags; 2] {
        [
            StaticFlags::new().with(Flag::PendingBuildsQueueSource, true),
            StaticFlags::new().with(Flag::PendingBuildsQueueSource, false),
        ]
    }

    /// Groups 1 > 2, group 3; projects 10 (group 2), 11 (group 3), 12 (none).
    fn store() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store.add_group(Group {
            id: GroupId::new(1),
            parent_id: None,
        });
        store.add_group(Group {
            id: GroupId::new(2),
            parent_id: Some(GroupId::new(1)),
        });
        store.add_group(Group {
            id: GroupId::new(3),
            parent_id: None,
        });
        store.add_project(Project {
            group_id: Some(GroupId::new(2)),
            ..Project::new(ProjectId::new(10))
        });
        store.add_project(Project {
            group_id: Some(GroupId::new(3)),
            ..Project::new(ProjectId::new(11))
        });
        store.add_project(Project::new(ProjectId::new(12)));
        Arc::new(store)
    }

    fn enqueue(store: &MemoryStore, id: i64, project: i64, tags: &[&str], protected: bool) {
        store
            .enqueue(JobId::new(id), ProjectId::new(project), tags, protected)
            .unwrap();
    }

    #[tokio::test]
    async fn test_tagged_job_needs_matching_runner() {
        for flags in both_sources() {
            let store = store();
            enqueue(&store, 1, 10, &["docker"], false);
            let queue = queue(&store, flags);

            let untagged = Runner::instance(RunnerId::new(1));
            assert!(queue.candidates_for(&untagged).await.unwrap().is_empty());

            let docker = Runner::instance(RunnerId::new(2)).with_tags(["docker", "linux"]);
            assert_eq!(queue.candidates_for(&docker).await.unwrap(), ids(&[1]));
        }
    }

    #[tokio::test]
    async fn test_docker_runner_scenario() {
        for flags in both_sources() {
            let store = Arc::new(MemoryStore::new());
            store.add_project(Project::new(ProjectId::new(1)));
            store.add_project(Project::new(ProjectId::new(2)));
            enqueue(&store, 10, 1, &[], false);
            enqueue(&store, 11, 1, &["docker"], false);
            enqueue(&store, 12, 2, &["docker", "windows"], false);
            let queue = queue(&store, flags);

            let runner = Runner::instance(RunnerId::new(1))
                .with_tags(["docker"])
                .with_run_untagged(false);
            assert_eq!(queue.candidates_for(&runner).await.unwrap(), ids(&[11]));
        }
    }

    #[tokio::test]
    async fn test_fair_and_fifo_order_for_busy_project() {
        for fifo in [false, true] {
            for flags in both_sources() {
                let store = Arc::new(MemoryStore::new());
                store.add_project(Project::new(ProjectId::new(1)));
                store.add_project(Project::new(ProjectId::new(2)));
                let busy = Runner::instance(RunnerId::new(99));
                for id in [1, 2] {
                    enqueue(&store, id, 1, &[], false);
                    store.claim(JobId::new(id), &busy).await.unwrap();
                }
                enqueue(&store, 100, 1, &[], false);
                enqueue(&store, 101, 2, &[], false);
                let queue = queue(&store, flags.with(Flag::DisableFairScheduling, fifo));

                let runner = Runner::instance(RunnerId::new(1));
                let expected = if fifo { ids(&[100, 101]) } else { ids(&[101, 100]) };
                assert_eq!(queue.candidates_for(&runner).await.unwrap(), expected);
            }
        }
    }

    #[tokio::test]
    async fn test_untagged_jobs_respect_run_untagged() {
        for flags in both_sources() {
            let store = store();
            enqueue(&store, 1, 10, &[], false);
            enqueue(&store, 2, 10, &["docker"], false);
            let queue = queue(&store, flags);

            let picky = Runner::instance(RunnerId::new(1))
                .with_tags(["docker"])
                .with_run_untagged(false);
            assert_eq!(queue.candidates_for(&picky).await.unwrap(), ids(&[2]));

            let relaxed = Runner::instance(RunnerId::new(2)).with_tags(["docker"]);
            assert_eq!(queue.candidates_for(&relaxed).await.unwrap(), ids(&[1, 2]));
        }
    }

    #[tokio::test]
    async fn test_protected_runner_sees_only_protected_jobs() {
        for flags in both_sources() {
            let store = store();
            enqueue(&store, 1, 10, &[], false);
            enqueue(&store, 2, 10, &[], true);
            let queue = queue(&store, flags);

            let runner =
                Runner::instance(RunnerId::new(1)).with_access_level(AccessLevel::RefProtected);
            assert_eq!(queue.candidates_for(&runner).await.unwrap(), ids(&[2]));

            let open = Runner::instance(RunnerId::new(2));
            assert_eq!(queue.candidates_for(&open).await.unwrap(), ids(&[1, 2]));
        }
    }

    #[tokio::test]
    async fn test_group_runner_serves_subgroups_fifo() {
        for flags in both_sources() {
            let store = store();
            enqueue(&store, 3, 10, &[], false);
            enqueue(&store, 1, 10, &[], false);
            enqueue(&store, 2, 11, &[], false);
            enqueue(&store, 4, 12, &[], false);
            let queue = queue(&store, flags);

            let parent = Runner::group(RunnerId::new(1), GroupId::new(1));
            assert_eq!(queue.candidates_for(&parent).await.unwrap(), ids(&[1, 3]));

            let other = Runner::group(RunnerId::new(2), GroupId::new(3));
            assert_eq!(queue.candidates_for(&other).await.unwrap(), ids(&[2]));
        }
    }

    #[tokio::test]
    async fn test_group_runners_disabled_on_project() {
        for flags in both_sources() {
            let store = store();
            enqueue(&store, 1, 10, &[], false);
            store.add_project(Project {
                group_id: Some(GroupId::new(2)),
                group_runners_enabled: false,
                ..Project::new(ProjectId::new(10))
            });
            let queue = queue(&store, flags);

            let runner = Runner::group(RunnerId::new(1), GroupId::new(1));
            assert!(queue.candidates_for(&runner).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_project_runner_serves_assigned_projects() {
        for flags in both_sources() {
            let store = store();
            enqueue(&store, 1, 10, &[], false);
            enqueue(&store, 2, 11, &[], false);
            enqueue(&store, 3, 12, &[], false);
            let queue = queue(&store, flags);

            let runner = Runner::project(RunnerId::new(1), [ProjectId::new(12), ProjectId::new(10)]);
            assert_eq!(queue.candidates_for(&runner).await.unwrap(), ids(&[1, 3]));
        }
    }

    #[tokio::test]
    async fn test_project_runner_skips_inactive_projects() {
        for flags in both_sources() {
            let store = Arc::new(MemoryStore::new());
            store.add_project(Project {
                pending_delete: true,
                ..Project::new(ProjectId::new(1))
            });
            store.add_project(Project {
                builds_access_level: Some(FeatureAccessLevel::Disabled),
                ..Project::new(ProjectId::new(2))
            });
            store.add_project(Project::new(ProjectId::new(3)));
            enqueue(&store, 1, 1, &[], false);
            enqueue(&store, 2, 2, &[], false);
            enqueue(&store, 3, 3, &[], false);
            let queue = queue(&store, flags);

            let runner = Runner::project(RunnerId::new(1), [1, 2, 3].map(ProjectId::new));
            assert_eq!(queue.candidates_for(&runner).await.unwrap(), ids(&[3]));
        }
    }

    #[tokio::test]
    async fn test_shared_runner_skips_ineligible_projects() {
        for flags in both_sources() {
            let store = store();
            enqueue(&store, 1, 10, &[], false);
            enqueue(&store, 2, 11, &[], false);
            enqueue(&store, 3, 12, &[], false);
            store.add_project(Project {
                group_id: Some(GroupId::new(3)),
                shared_runners_enabled: false,
                ..Project::new(ProjectId::new(11))
            });
            store.add_project(Project {
                pending_delete: true,
                ..Project::new(ProjectId::new(12))
            });
            let queue = queue(&store, flags);

            let runner = Runner::instance(RunnerId::new(1));
            assert_eq!(queue.candidates_for(&runner).await.unwrap(), ids(&[1]));
        }
    }

    #[tokio::test]
    async fn test_shared_runner_queue_is_fair() {
        for flags in both_sources() {
            let store = store();
            let shared = Runner::instance(RunnerId::new(99));
            // project 10 already runs one job on shared runners
            enqueue(&store, 1, 10, &[], false);
            store.claim(JobId::new(1), &shared).await.unwrap();

            enqueue(&store, 2, 10, &[], false);
            enqueue(&store, 3, 10, &[], false);
            enqueue(&store, 4, 11, &[], false);
            enqueue(&store, 5, 12, &[], false);
            let queue = queue(&store, flags);

            let runner = Runner::instance(RunnerId::new(1));
            assert_eq!(
                queue.candidates_for(&runner).await.unwrap(),
                ids(&[4, 5, 2, 3])
            );
        }
    }

    #[tokio::test]
    async fn test_fair_scheduling_can_be_disabled() {
        for flags in both_sources() {
            let store = store();
            let shared = Runner::instance(RunnerId::new(99));
            enqueue(&store, 1, 10, &[], false);
            store.claim(JobId::new(1), &shared).await.unwrap();
            enqueue(&store, 2, 10, &[], false);
            enqueue(&store, 3, 11, &[], false);
            let queue = queue(&store, flags.with(Flag::DisableFairScheduling, true));

            let runner = Runner::instance(RunnerId::new(1));
            assert_eq!(queue.candidates_for(&runner).await.unwrap(), ids(&[2, 3]));
        }
    }

    #[tokio::test]
    async fn test_running_jobs_on_other_scopes_do_not_count() {
        let store = store();
        let project_runner = Runner::project(RunnerId::new(50), [ProjectId::new(10)]);
        enqueue(&store, 1, 10, &[], false);
        store.claim(JobId::new(1), &project_runner).await.unwrap();
        enqueue(&store, 2, 10, &[], false);
        enqueue(&store, 3, 11, &[], false);
        let queue = queue(&store, StaticFlags::new());

        let runner = Runner::instance(RunnerId::new(1));
        assert_eq!(queue.candidates_for(&runner).await.unwrap(), ids(&[2, 3]));
    }

    #[tokio::test]
    async fn test_projection_join_when_not_denormalized() {
        let store = store();
        enqueue(&store, 1, 10, &[], false);
        enqueue(&store, 2, 11, &[], false);
        let flags = StaticFlags::new().with(Flag::DenormalizedSharedRunnersData, false);
        let queue = queue(&store, flags);

        let runner = Runner::instance(RunnerId::new(1));
        assert_eq!(queue.candidates_for(&runner).await.unwrap(), ids(&[1, 2]));
    }

    struct DenyAll;

    #[async_trait]
    impl SharedRunnerEligibility for DenyAll {
        async fn allows(&self, _project_id: ProjectId, _runner: &Runner) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_eligibility_override_only_affects_shared_runners() {
        let store = store();
        enqueue(&store, 1, 10, &[], false);
        let queue = queue(&store, StaticFlags::new()).with_shared_runner_eligibility(Arc::new(DenyAll));

        let shared = Runner::instance(RunnerId::new(1));
        assert!(queue.candidates_for(&shared).await.unwrap().is_empty());

        let group = Runner::group(RunnerId::new(2), GroupId::new(1));
        assert_eq!(queue.candidates_for(&group).await.unwrap(), ids(&[1]));
    }

    #[tokio::test]
    async fn test_execute_partitions_candidates() {
        let store = store();
        for id in 1..=4 {
            enqueue(&store, id, 10, &[], false);
        }
        // job 2 is taken by someone else first
        let other = Runner::instance(RunnerId::new(2));
        store.claim(JobId::new(2), &other).await.unwrap();

        let queue = queue(&store, StaticFlags::new());
        let runner = Runner::instance(RunnerId::new(1));
        let partition = queue.execute(&runner, &ids(&[1, 2, 3, 4]), 2).await.unwrap();

        assert_eq!(partition.claimed, ids(&[1, 3]));
        assert_eq!(partition.unclaimed, ids(&[2, 4]));
        assert_eq!(partition.conflicts, ids(&[2]));
        assert_eq!(store.job_runner(JobId::new(3)), Some(runner.id));
        assert_eq!(store.job_runner(JobId::new(4)), None);
    }

    #[tokio::test]
    async fn test_execute_with_zero_limit_claims_nothing() {
        let store = store();
        enqueue(&store, 1, 10, &[], false);
        let queue = queue(&store, StaticFlags::new());
        let runner = Runner::instance(RunnerId::new(1));

        let partition = queue.execute(&runner, &ids(&[1]), 0).await.unwrap();
        assert!(partition.claimed.is_empty());
        assert_eq!(partition.unclaimed, ids(&[1]));
        assert!(partition.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_claimed_jobs_leave_the_queue() {
        for flags in both_sources() {
            let store = store();
            enqueue(&store, 1, 10, &[], false);
            enqueue(&store, 2, 10, &[], false);
            let queue = queue(&store, flags);
            let runner = Runner::instance(RunnerId::new(1));

            let candidates = queue.candidates_for(&runner).await.unwrap();
            queue.execute(&runner, &candidates, 1).await.unwrap();
            assert_eq!(queue.candidates_for(&runner).await.unwrap(), ids(&[2]));
        }
    }

    /// Store whose tag lookup always fails.
    struct FailingTags(Arc<MemoryStore>);

    #[async_trait]
    impl QueueStore for FailingTags {
        async fn pending_jobs(&self) -> Result<Vec<PendingJob>> {
            self.0.pending_jobs().await
        }

        async fn pending_builds(&self) -> Result<Vec<PendingBuild>> {
            self.0.pending_builds().await
        }

        async fn running_job_count_by_project(
            &self,
            _scope: RunnerScope,
        ) -> Result<HashMap<ProjectId, u64>> {
            Err(Error::Store("connection reset".to_string()))
        }

        async fn projects(&self, ids: &[ProjectId]) -> Result<Vec<Project>> {
            self.0.projects(ids).await
        }

        async fn group_hierarchy_projects(&self, group_id: GroupId) -> Result<HashSet<ProjectId>> {
            self.0.group_hierarchy_projects(group_id).await
        }

        async fn tag_ids(&self, _names: &[String]) -> Result<BTreeSet<TagId>> {
            Err(Error::Store("connection reset".to_string()))
        }

        async fn claim(&self, job_id: JobId, runner: &Runner) -> Result<ClaimOutcome> {
            self.0.claim(job_id, runner).await
        }
    }

    #[tokio::test]
    async fn test_store_failures_propagate() {
        let inner = store();
        enqueue(&inner, 1, 10, &[], false);
        let queue = BuildQueue::new(
            Arc::new(FailingTags(inner)),
            Arc::new(StaticFlags::new()),
        );

        // fairness lookup fails for shared runners
        let shared = Runner::instance(RunnerId::new(1));
        assert!(matches!(
            queue.candidates_for(&shared).await,
            Err(Error::Store(_))
        ));

        // tag lookup fails for everyone else
        let group = Runner::group(RunnerId::new(2), GroupId::new(1));
        assert!(matches!(
            queue.candidates_for(&group).await,
            Err(Error::Store(_))
        ));
    }
}
