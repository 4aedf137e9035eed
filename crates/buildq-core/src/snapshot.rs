//! A self-contained picture of queue state, used to seed in-memory stores.

use serde::{Deserialize, Serialize};

use crate::{Group, JobId, JobStatus, Project, ProjectId, Runner, RunnerId};

/// A job as written in a snapshot, with tag names rather than tag ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotJob {
    pub id: JobId,
    pub project_id: ProjectId,
    pub tags: Vec<String>,
    pub protected: bool,
    pub status: JobStatus,
    /// Runner executing the job, for running jobs.
    pub runner_id: Option<RunnerId>,
}

impl SnapshotJob {
    pub fn pending(id: JobId, project_id: ProjectId) -> Self {
        Self {
            id,
            project_id,
            tags: Vec::new(),
            protected: false,
            status: JobStatus::Pending,
            runner_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub groups: Vec<Group>,
    pub projects: Vec<Project>,
    pub runners: Vec<Runner>,
    pub jobs: Vec<SnapshotJob>,
}

impl QueueSnapshot {
    pub fn runner(&self, id: RunnerId) -> Option<&Runner> {
        self.runners.iter().find(|r| r.id == id)
    }
}
