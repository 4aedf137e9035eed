//! Projects and groups, as far as runner eligibility is concerned.

use serde::{Deserialize, Serialize};

use crate::{Error, GroupId, ProjectId};

/// Access level of a project feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureAccessLevel {
    Disabled = 0,
    Private = 10,
    Enabled = 20,
    Public = 30,
}

impl FeatureAccessLevel {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(FeatureAccessLevel::Disabled),
            10 => Some(FeatureAccessLevel::Private),
            20 => Some(FeatureAccessLevel::Enabled),
            30 => Some(FeatureAccessLevel::Public),
            _ => None,
        }
    }
}

impl std::str::FromStr for FeatureAccessLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(FeatureAccessLevel::Disabled),
            "private" => Ok(FeatureAccessLevel::Private),
            "enabled" => Ok(FeatureAccessLevel::Enabled),
            "public" => Ok(FeatureAccessLevel::Public),
            other => Err(Error::InvalidInput(format!(
                "unknown feature access level: {}",
                other
            ))),
        }
    }
}

/// Project settings that decide which runners may pick its jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub group_id: Option<GroupId>,
    pub shared_runners_enabled: bool,
    pub group_runners_enabled: bool,
    pub pending_delete: bool,
    /// CI feature access level; `None` means never configured.
    pub builds_access_level: Option<FeatureAccessLevel>,
}

impl Project {
    pub fn new(id: ProjectId) -> Self {
        Self {
            id,
            group_id: None,
            shared_runners_enabled: true,
            group_runners_enabled: true,
            pending_delete: false,
            builds_access_level: None,
        }
    }

    /// Access level unset or anything above `disabled`.
    pub fn builds_enabled(&self) -> bool {
        self.builds_access_level
            .is_none_or(|level| level > FeatureAccessLevel::Disabled)
    }

    /// Shared runners enabled, not pending deletion, CI enabled.
    pub fn allows_shared_runners(&self) -> bool {
        self.shared_runners_enabled && !self.pending_delete && self.builds_enabled()
    }

    /// Group runners enabled, not pending deletion, CI enabled.
    pub fn allows_group_runners(&self) -> bool {
        self.group_runners_enabled && !self.pending_delete && self.builds_enabled()
    }

    /// Not pending deletion, CI enabled. Assignment is checked separately.
    pub fn allows_project_runners(&self) -> bool {
        !self.pending_delete && self.builds_enabled()
    }
}

/// A node of the group hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub parent_id: Option<GroupId>,
}
