//! Task identifiers.
//!
//! A `TaskId` is opaque to the scheduler. Callers may pass any string or
//! integer; generated ids come from an [`IdGenerator`](crate::ports::IdGenerator)
//! and look like `task-01HV...` (ULID: millisecond timestamp + random bits).

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Identifier of a submitted task, unique within one queue by convention.
///
/// Uniqueness is not enforced: submitting twice with the same id creates two
/// independent tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub const PREFIX: &'static str = "task-";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(format!("{}{}", Self::PREFIX, ulid))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for TaskId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<Ulid> for TaskId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}
