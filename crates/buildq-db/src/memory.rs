//! In-process queue store.
//!
//! Keeps the builds relation and the pending-builds projection side by side,
//! the way the PostgreSQL schema does, so both queue sources can be exercised
//! without a database. Claims take the state lock, which makes every claim a
//! single compare-and-swap on the job's status.

use async_trait::async_trait;
use buildq_core::{
    ClaimOutcome, Error, Group, GroupId, JobId, JobStatus, PendingBuild, PendingJob, Project,
    ProjectId, QueueSnapshot, QueueStore, Result, Runner, RunnerId, RunnerScope, SnapshotJob,
    TagId,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Deepest group nesting followed when walking ancestors.
const MAX_GROUP_DEPTH: usize = 20;

#[derive(Debug, Clone)]
struct StoredJob {
    project_id: ProjectId,
    tag_ids: BTreeSet<TagId>,
    protected: bool,
    status: JobStatus,
    runner_id: Option<RunnerId>,
    queued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    groups: HashMap<GroupId, Group>,
    projects: HashMap<ProjectId, Project>,
    runners: HashMap<RunnerId, RunnerScope>,
    tags: BTreeMap<String, TagId>,
    jobs: BTreeMap<JobId, StoredJob>,
    queuing_entries: BTreeMap<JobId, PendingBuild>,
}

impl State {
    fn intern(&mut self, name: &str) -> TagId {
        if let Some(id) = self.tags.get(name) {
            return *id;
        }
        let id = TagId::new(self.tags.len() as i64 + 1);
        self.tags.insert(name.to_string(), id);
        id
    }

    /// Ancestor chain of `group_id`, root first.
    fn traversal_ids(&self, group_id: GroupId) -> Vec<GroupId> {
        let mut chain = vec![group_id];
        let mut current = group_id;
        while let Some(parent) = self.groups.get(&current).and_then(|g| g.parent_id) {
            if chain.len() >= MAX_GROUP_DEPTH || chain.contains(&parent) {
                break;
            }
            chain.push(parent);
            current = parent;
        }
        chain.reverse();
        chain
    }

    fn queuing_entry(&self, id: JobId, job: &StoredJob) -> PendingBuild {
        let project = self.projects.get(&job.project_id);
        let namespace_traversal_ids = project
            .filter(|p| p.allows_group_runners())
            .and_then(|p| p.group_id)
            .map(|g| self.traversal_ids(g))
            .unwrap_or_default();

        PendingBuild {
            build_id: id,
            project_id: job.project_id,
            tag_ids: job.tag_ids.clone(),
            protected: job.protected,
            instance_runners_enabled: project.is_some_and(Project::allows_shared_runners),
            namespace_traversal_ids,
        }
    }

    fn refresh_queuing_entries(&mut self, project_id: ProjectId) {
        let ids: Vec<JobId> = self
            .queuing_entries
            .values()
            .filter(|entry| entry.project_id == project_id)
            .map(|entry| entry.build_id)
            .collect();
        for id in ids {
            if let Some(job) = self.jobs.get(&id) {
                let entry = self.queuing_entry(id, job);
                self.queuing_entries.insert(id, entry);
            }
        }
    }
}

/// Queue store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a snapshot. Runners are registered so that their
    /// scope is known for running-job counts.
    pub fn from_snapshot(snapshot: &QueueSnapshot) -> Result<Self> {
        let store = Self::new();
        for group in &snapshot.groups {
            store.add_group(group.clone());
        }
        for project in &snapshot.projects {
            store.add_project(project.clone());
        }
        for runner in &snapshot.runners {
            store.add_runner(runner);
        }
        for job in &snapshot.jobs {
            store.insert_job(job)?;
        }
        Ok(store)
    }

    /// Insert or replace a group, refreshing the projection rows of every
    /// project at or below it.
    pub fn add_group(&self, group: Group) {
        let mut state = self.state.lock();
        let id = group.id;
        state.groups.insert(id, group);
        let affected: Vec<ProjectId> = state
            .projects
            .values()
            .filter(|p| p.group_id.is_some_and(|g| state.traversal_ids(g).contains(&id)))
            .map(|p| p.id)
            .collect();
        for project_id in affected {
            state.refresh_queuing_entries(project_id);
        }
    }

    /// Insert or replace a project, refreshing the projection rows of its
    /// queued jobs.
    pub fn add_project(&self, project: Project) {
        let mut state = self.state.lock();
        let id = project.id;
        state.projects.insert(id, project);
        state.refresh_queuing_entries(id);
    }

    pub fn add_runner(&self, runner: &Runner) {
        self.state.lock().runners.insert(runner.id, runner.scope);
    }

    /// Insert a job. Pending jobs get a projection row.
    pub fn insert_job(&self, job: &SnapshotJob) -> Result<()> {
        let mut state = self.state.lock();
        if state.jobs.contains_key(&job.id) {
            return Err(Error::InvalidInput(format!("duplicate job {}", job.id)));
        }
        if job.status == JobStatus::Running && job.runner_id.is_none() {
            return Err(Error::InvalidInput(format!(
                "running job {} has no runner",
                job.id
            )));
        }

        let tag_ids = job.tags.iter().map(|t| state.intern(t)).collect();
        let stored = StoredJob {
            project_id: job.project_id,
            tag_ids,
            protected: job.protected,
            status: job.status,
            runner_id: job.runner_id,
            queued_at: (job.status == JobStatus::Pending).then(Utc::now),
        };
        if stored.status == JobStatus::Pending && stored.runner_id.is_none() {
            let entry = state.queuing_entry(job.id, &stored);
            state.queuing_entries.insert(job.id, entry);
        }
        state.jobs.insert(job.id, stored);
        Ok(())
    }

    /// Enqueue a pending job with the given tags.
    pub fn enqueue(
        &self,
        id: JobId,
        project_id: ProjectId,
        tags: &[&str],
        protected: bool,
    ) -> Result<()> {
        self.insert_job(&SnapshotJob {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            protected,
            ..SnapshotJob::pending(id, project_id)
        })
    }

    /// Move a running job to a terminal state.
    pub fn finish(&self, id: JobId, status: JobStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::InvalidInput(format!("{} is not a final status", status)));
        }
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))?;
        job.status = status;
        Ok(())
    }

    /// Change a job's status behind the projection's back, leaving any
    /// queuing entry in place.
    pub fn force_status(&self, id: JobId, status: JobStatus) -> Result<()> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))?;
        job.status = status;
        Ok(())
    }

    pub fn job_status(&self, id: JobId) -> Option<JobStatus> {
        self.state.lock().jobs.get(&id).map(|job| job.status)
    }

    pub fn job_runner(&self, id: JobId) -> Option<RunnerId> {
        self.state.lock().jobs.get(&id).and_then(|job| job.runner_id)
    }

    pub fn has_queuing_entry(&self, id: JobId) -> bool {
        self.state.lock().queuing_entries.contains_key(&id)
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn pending_jobs(&self) -> Result<Vec<PendingJob>> {
        let state = self.state.lock();
        Ok(state
            .jobs
            .iter()
            .filter(|(_, job)| job.status == JobStatus::Pending && job.runner_id.is_none())
            .map(|(id, job)| PendingJob {
                id: *id,
                project_id: job.project_id,
                tag_ids: job.tag_ids.clone(),
                protected: job.protected,
                queued_at: job.queued_at,
            })
            .collect())
    }

    async fn pending_builds(&self) -> Result<Vec<PendingBuild>> {
        Ok(self.state.lock().queuing_entries.values().cloned().collect())
    }

    async fn running_job_count_by_project(
        &self,
        scope: RunnerScope,
    ) -> Result<HashMap<ProjectId, u64>> {
        let state = self.state.lock();
        let mut counts = HashMap::new();
        for job in state.jobs.values() {
            if job.status != JobStatus::Running {
                continue;
            }
            let runner_scope = job.runner_id.and_then(|r| state.runners.get(&r));
            if runner_scope == Some(&scope) {
                *counts.entry(job.project_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn projects(&self, ids: &[ProjectId]) -> Result<Vec<Project>> {
        let state = self.state.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.projects.get(id).cloned())
            .collect())
    }

    async fn group_hierarchy_projects(&self, group_id: GroupId) -> Result<HashSet<ProjectId>> {
        let state = self.state.lock();
        Ok(state
            .projects
            .values()
            .filter(|p| {
                p.group_id
                    .is_some_and(|g| state.traversal_ids(g).contains(&group_id))
            })
            .map(|p| p.id)
            .collect())
    }

    async fn tag_ids(&self, names: &[String]) -> Result<BTreeSet<TagId>> {
        let state = self.state.lock();
        Ok(names
            .iter()
            .filter_map(|name| state.tags.get(name).copied())
            .collect())
    }

    async fn claim(&self, job_id: JobId, runner: &Runner) -> Result<ClaimOutcome> {
        let mut state = self.state.lock();
        state.queuing_entries.remove(&job_id);
        state.runners.entry(runner.id).or_insert(runner.scope);

        match state.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending && job.runner_id.is_none() => {
                job.status = JobStatus::Running;
                job.runner_id = Some(runner.id);
                Ok(ClaimOutcome::Claimed)
            }
            _ => Ok(ClaimOutcome::AlreadyClaimed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildq_core::FeatureAccessLevel;
    use std::sync::Arc;

    fn store_with_hierarchy() -> MemoryStore {
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
        store
    }

    #[tokio::test]
    async fn test_group_hierarchy_includes_descendants() {
        let store = store_with_hierarchy();

        let root = store.group_hierarchy_projects(GroupId::new(1)).await.unwrap();
        assert_eq!(root, HashSet::from([ProjectId::new(10)]));

        let child = store.group_hierarchy_projects(GroupId::new(2)).await.unwrap();
        assert_eq!(child, HashSet::from([ProjectId::new(10)]));

        let other = store.group_hierarchy_projects(GroupId::new(3)).await.unwrap();
        assert_eq!(other, HashSet::from([ProjectId::new(11)]));
    }

    #[tokio::test]
    async fn test_projection_rows_are_denormalized() {
        let store = store_with_hierarchy();
        store
            .enqueue(JobId::new(1), ProjectId::new(10), &["docker"], true)
            .unwrap();

        let rows = store.pending_builds().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].instance_runners_enabled);
        assert!(rows[0].protected);
        assert_eq!(
            rows[0].namespace_traversal_ids,
            vec![GroupId::new(1), GroupId::new(2)]
        );

        let tags = store.tag_ids(&["docker".to_string()]).await.unwrap();
        assert_eq!(rows[0].tag_ids, tags);
    }

    #[tokio::test]
    async fn test_project_update_refreshes_projection() {
        let store = store_with_hierarchy();
        store
            .enqueue(JobId::new(1), ProjectId::new(10), &[], false)
            .unwrap();

        store.add_project(Project {
            group_id: Some(GroupId::new(2)),
            builds_access_level: Some(FeatureAccessLevel::Disabled),
            ..Project::new(ProjectId::new(10))
        });

        let rows = store.pending_builds().await.unwrap();
        assert!(!rows[0].instance_runners_enabled);
        assert!(rows[0].namespace_traversal_ids.is_empty());
    }

    #[tokio::test]
    async fn test_group_move_refreshes_projection() {
        let store = store_with_hierarchy();
        store
            .enqueue(JobId::new(1), ProjectId::new(10), &[], false)
            .unwrap();

        store.add_group(Group {
            id: GroupId::new(2),
            parent_id: Some(GroupId::new(3)),
        });

        let rows = store.pending_builds().await.unwrap();
        assert_eq!(rows[0].namespace_traversal_ids, vec![GroupId::new(3), GroupId::new(2)]);
        let members = store.group_hierarchy_projects(GroupId::new(3)).await.unwrap();
        assert!(members.contains(&ProjectId::new(10)));
        assert!(rows[0].in_namespaces(&[GroupId::new(3)]));
        assert!(!rows[0].in_namespaces(&[GroupId::new(1)]));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = store_with_hierarchy();
        store
            .enqueue(JobId::new(1), ProjectId::new(10), &[], false)
            .unwrap();
        let a = Runner::instance(RunnerId::new(1));
        let b = Runner::instance(RunnerId::new(2));

        assert_eq!(
            store.claim(JobId::new(1), &a).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            store.claim(JobId::new(1), &b).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
        assert_eq!(store.job_runner(JobId::new(1)), Some(RunnerId::new(1)));
        assert!(!store.has_queuing_entry(JobId::new(1)));
        assert!(store.pending_jobs().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_have_one_winner() {
        let store = Arc::new(store_with_hierarchy());
        store
            .enqueue(JobId::new(1), ProjectId::new(10), &[], false)
            .unwrap();

        let handles: Vec<_> = (1..=8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let runner = Runner::instance(RunnerId::new(i));
                    store.claim(JobId::new(1), &runner).await.unwrap()
                })
            })
            .collect();

        let outcomes: Vec<ClaimOutcome> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(outcomes.iter().filter(|o| o.is_claimed()).count(), 1);
    }

    #[tokio::test]
    async fn test_running_counts_by_runner_scope() {
        let store = store_with_hierarchy();
        let shared = Runner::instance(RunnerId::new(1));
        let project = Runner::project(RunnerId::new(2), [ProjectId::new(10)]);
        for id in 1..=3 {
            store
                .enqueue(JobId::new(id), ProjectId::new(10), &[], false)
                .unwrap();
        }
        store.claim(JobId::new(1), &shared).await.unwrap();
        store.claim(JobId::new(2), &shared).await.unwrap();
        store.claim(JobId::new(3), &project).await.unwrap();

        let counts = store
            .running_job_count_by_project(RunnerScope::Instance)
            .await
            .unwrap();
        assert_eq!(counts.get(&ProjectId::new(10)), Some(&2));

        store.finish(JobId::new(1), JobStatus::Success).unwrap();
        let counts = store
            .running_job_count_by_project(RunnerScope::Instance)
            .await
            .unwrap();
        assert_eq!(counts.get(&ProjectId::new(10)), Some(&1));
    }

    #[tokio::test]
    async fn test_stale_queuing_entry_removed_on_claim() {
        let store = store_with_hierarchy();
        store
            .enqueue(JobId::new(1), ProjectId::new(10), &[], false)
            .unwrap();
        store.force_status(JobId::new(1), JobStatus::Running).unwrap();
        assert!(store.has_queuing_entry(JobId::new(1)));

        let runner = Runner::instance(RunnerId::new(1));
        assert_eq!(
            store.claim(JobId::new(1), &runner).await.unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
        assert!(!store.has_queuing_entry(JobId::new(1)));
    }

    #[test]
    fn test_rejects_duplicate_jobs() {
        let store = store_with_hierarchy();
        store
            .enqueue(JobId::new(1), ProjectId::new(10), &[], false)
            .unwrap();
        assert!(
            store
                .enqueue(JobId::new(1), ProjectId::new(10), &[], false)
                .is_err()
        );
    }
}
