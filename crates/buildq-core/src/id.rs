//! Resource identifiers.
//!
//! All identifiers are database-assigned integers. Job ids are monotonically
//! increasing, which makes them usable as the FIFO tie-break and paging cursor.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

macro_rules! int_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
            Display, From,
        )]
        #[display("{_0}")]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

int_id!(
    /// Identifier of a CI job (a build).
    JobId
);
int_id!(
    /// Identifier of a project.
    ProjectId
);
int_id!(
    /// Identifier of a group (namespace).
    GroupId
);
int_id!(
    /// Identifier of a registered runner.
    RunnerId
);
int_id!(
    /// Interned tag name.
    TagId
);
