//! Shared identifier wrappers for the Meridian dispatch core.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error returned when parsing a UUID-backed identifier fails.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {label}: {source}")]
pub struct IdParseError {
    label: &'static str,
    source: uuid::Error,
}

macro_rules! define_uuid_id {
    ($name:ident, $label:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                Uuid::parse_str(value)
                    .map(Self)
                    .map_err(|source| IdParseError { label: $label, source })
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
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
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

define_uuid_id!(JobId, "job id");
define_uuid_id!(AssignmentId, "assignment id");
define_uuid_id!(ResponseId, "response id");
define_uuid_id!(BlobId, "blob id");
define_uuid_id!(ValidatorId, "validator id");

/// A worker's on-network identifier. Unlike the other identifiers in this
/// crate, workers are assigned small integer ids by the network layer
/// rather than minting their own UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for WorkerId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<WorkerId> for u64 {
    fn from(value: WorkerId) -> Self {
        value.0
    }
}

impl std::str::FromStr for WorkerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_round_trips_through_display_and_parse() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn job_id_rejects_garbage() {
        assert!(JobId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn worker_id_is_a_transparent_integer() {
        let id = WorkerId::from(42u64);
        assert_eq!(id.as_u64(), 42);
        assert_eq!(id.to_string(), "42");
        assert_eq!("42".parse::<WorkerId>().unwrap(), id);
    }

    #[test]
    fn distinct_ids_of_the_same_kind_differ() {
        assert_ne!(JobId::new(), JobId::new());
    }
}
