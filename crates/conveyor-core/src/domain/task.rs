//! Task-level data: status, options, the typed input handed to operations,
//! and read-only snapshots for observers.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::TaskId;
use crate::error::TaskError;

/// Task status.
///
/// State transitions:
/// - Pending -> Executing -> Completed
/// - Pending -> Executing -> Retrying -> Pending (while attempts < max_retries)
/// - Pending -> Executing -> Failed (retry budget exhausted, or cancelled)
/// - Failed -> Pending (only through `retry_failed_tasks`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a free slot.
    Pending,

    /// An attempt is in flight.
    Executing,

    /// Finished successfully.
    Completed,

    /// Finished unsuccessfully.
    Failed,

    /// Waiting out its backoff delay before going back to Pending.
    Retrying,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Counted as pending in queue statistics.
    pub fn is_waiting(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retrying)
    }
}

/// Effective per-task options, captured at submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    /// Higher runs earlier.
    pub priority: i32,
    pub max_retries: u32,
    pub timeout: Duration,
}

/// Per-task overrides of the queue defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl TaskOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// What an operation receives: its payload plus the id it runs under.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInput<P> {
    pub task_id: TaskId,
    pub data: P,
}

/// Terminal verdict reported to `on_task_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failed,
}

/// Read-only view of a task at one point in time.
#[derive(Debug, Clone)]
pub struct TaskSnapshot<T> {
    pub id: TaskId,
    pub status: TaskStatus,
    pub options: TaskOptions,

    /// Retries consumed so far.
    pub attempts: u32,

    pub result: Option<T>,
    pub error: Option<TaskError>,

    /// Start of the latest attempt.
    pub started_at: Option<Instant>,
    pub ended_at: Option<Instant>,
}

impl<T> TaskSnapshot<T> {
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }
}
