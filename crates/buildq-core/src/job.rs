//! Job rows as seen by the build queue.
//!
//! The queue reads jobs from one of two relations: the full builds relation
//! ([`PendingJob`]) or the narrower pending-builds projection
//! ([`PendingBuild`]), which carries denormalized eligibility columns.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{Error, GroupId, JobId, ProjectId, TagId};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[display("created")]
    Created,
    #[display("pending")]
    Pending,
    #[display("running")]
    Running,
    #[display("success")]
    Success,
    #[display("failed")]
    Failed,
    #[display("canceled")]
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobStatus::Created),
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(Error::InvalidInput(format!("unknown job status: {}", other))),
        }
    }
}

/// A pending, unassigned job read from the builds relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingJob {
    pub id: JobId,
    pub project_id: ProjectId,
    /// Tags required to run this job.
    pub tag_ids: BTreeSet<TagId>,
    /// Whether the job runs for a protected ref. Unset counts as unprotected.
    pub protected: bool,
    pub queued_at: Option<DateTime<Utc>>,
}

/// A row of the pending-builds projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBuild {
    pub build_id: JobId,
    pub project_id: ProjectId,
    pub tag_ids: BTreeSet<TagId>,
    pub protected: bool,
    /// Precomputed shared-runner eligibility of the owning project.
    pub instance_runners_enabled: bool,
    /// Ancestor chain of the project's group, root first. Empty when the
    /// project does not accept group runners.
    pub namespace_traversal_ids: Vec<GroupId>,
}

impl PendingBuild {
    /// Whether the project sits below any of `group_ids`.
    pub fn in_namespaces(&self, group_ids: &[GroupId]) -> bool {
        self.namespace_traversal_ids
            .iter()
            .any(|id| group_ids.contains(id))
    }
}
