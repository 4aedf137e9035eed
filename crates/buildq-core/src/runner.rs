//! Runner descriptors.
//!
//! Runners are created and updated by the registration subsystem; the
//! scheduling core only reads them.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{Error, GroupId, ProjectId, RunnerId};

/// Prefix of a runner tag that selects the metrics shard label.
pub const METRICS_SHARD_TAG_PREFIX: &str = "metrics_shard::";

/// Shard label used when a runner declares no `metrics_shard::` tag.
pub const DEFAULT_METRICS_SHARD: &str = "default";

/// Which pool of projects a runner serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum RunnerScope {
    /// Shared, instance-wide runner.
    #[display("instance")]
    Instance,
    /// Runner serving every project below a group.
    #[display("group")]
    Group,
    /// Runner assigned to explicit projects.
    #[display("project")]
    Project,
}

impl RunnerScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerScope::Instance => "instance",
            RunnerScope::Group => "group",
            RunnerScope::Project => "project",
        }
    }
}

impl std::str::FromStr for RunnerScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "instance" | "instance_type" | "shared" => Ok(RunnerScope::Instance),
            "group" | "group_type" => Ok(RunnerScope::Group),
            "project" | "project_type" => Ok(RunnerScope::Project),
            other => Err(Error::InvalidInput(format!("unknown runner scope: {}", other))),
        }
    }
}

/// Which refs a runner may build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    #[default]
    NotProtected,
    RefProtected,
}

/// A polling agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: RunnerId,
    pub scope: RunnerScope,
    /// Tags this runner declares it can run.
    pub tag_list: Vec<String>,
    /// Whether jobs without any tag may be offered.
    pub run_untagged: bool,
    pub access_level: AccessLevel,
    /// Projects a project-scoped runner is assigned to.
    pub project_ids: Vec<ProjectId>,
    /// Group a group-scoped runner belongs to.
    pub group_id: Option<GroupId>,
}

impl Runner {
    /// A shared runner with no tags that runs untagged jobs.
    pub fn instance(id: RunnerId) -> Self {
        Self {
            id,
            scope: RunnerScope::Instance,
            tag_list: Vec::new(),
            run_untagged: true,
            access_level: AccessLevel::NotProtected,
            project_ids: Vec::new(),
            group_id: None,
        }
    }

    pub fn group(id: RunnerId, group_id: GroupId) -> Self {
        Self {
            scope: RunnerScope::Group,
            group_id: Some(group_id),
            ..Self::instance(id)
        }
    }

    pub fn project(id: RunnerId, project_ids: impl IntoIterator<Item = ProjectId>) -> Self {
        Self {
            scope: RunnerScope::Project,
            project_ids: project_ids.into_iter().collect(),
            ..Self::instance(id)
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tag_list = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_run_untagged(mut self, run_untagged: bool) -> Self {
        self.run_untagged = run_untagged;
        self
    }

    pub fn with_access_level(mut self, access_level: AccessLevel) -> Self {
        self.access_level = access_level;
        self
    }

    pub fn is_shared(&self) -> bool {
        self.scope == RunnerScope::Instance
    }

    pub fn is_ref_protected(&self) -> bool {
        self.access_level == AccessLevel::RefProtected
    }

    /// Metrics shard taken from the first `metrics_shard::<name>` tag.
    pub fn metrics_shard(&self) -> &str {
        self.tag_list
            .iter()
            .find_map(|tag| tag.strip_prefix(METRICS_SHARD_TAG_PREFIX))
            .filter(|shard| !shard.is_empty())
            .unwrap_or(DEFAULT_METRICS_SHARD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_shard_defaults() {
        let runner = Runner::instance(RunnerId::new(1)).with_tags(["tag1", "tag2"]);
        assert_eq!(runner.metrics_shard(), DEFAULT_METRICS_SHARD);
    }

    #[test]
    fn test_metrics_shard_uses_first_shard_tag() {
        let runner = Runner::instance(RunnerId::new(1)).with_tags([
            "tag1",
            "metrics_shard::shard_tag",
            "metrics_shard::shard_tag_2",
            "tag2",
        ]);
        assert_eq!(runner.metrics_shard(), "shard_tag");
    }

    #[test]
    fn test_scope_parsing() {
        assert_eq!("instance_type".parse::<RunnerScope>().unwrap(), RunnerScope::Instance);
        assert_eq!("group".parse::<RunnerScope>().unwrap(), RunnerScope::Group);
        assert!("cluster".parse::<RunnerScope>().is_err());
    }

    #[test]
    fn test_constructors() {
        let runner = Runner::group(RunnerId::new(3), GroupId::new(9))
            .with_access_level(AccessLevel::RefProtected);
        assert_eq!(runner.scope, RunnerScope::Group);
        assert_eq!(runner.group_id, Some(GroupId::new(9)));
        assert!(runner.is_ref_protected());
        assert!(!runner.is_shared());
    }
}
