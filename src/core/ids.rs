// src/core/ids.rs

//! Typed identifiers for the aggregates and value objects in the data model
//! (spec §3). Keeping these as distinct newtypes instead of raw `String`s
//! means a `WorkerId` can never be passed where an `InstanceId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

id_type!(DefinitionId);
id_type!(InstanceId);
id_type!(WorkerId);

/// Port placeholder tags from a `LabletDefinition`'s `port_template` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortKind {
    Console,
    Vnc,
    Ssh,
    Other,
}

/// A single named placeholder in a `port_template`, e.g. `CONSOLE1` tagged `Console`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortPlaceholder {
    pub name: String,
    pub kind: PortKind,
}
