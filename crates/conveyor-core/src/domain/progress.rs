//! Progress and result views published by the scheduler.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::TaskSnapshot;

/// Lite progress shape delivered to `subscribe` listeners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
}

/// Extended progress shape delivered to the `on_progress` callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub executing: usize,
    pub pending: usize,

    /// (completed + failed) / total, rounded, 0 when empty.
    pub percentage: u8,
    pub is_complete: bool,
    pub elapsed_ms: u64,
}

impl ExtendedProgress {
    pub fn lite(&self) -> Progress {
        Progress {
            total: self.total,
            completed: self.completed,
            failed: self.failed,
            running: self.executing,
        }
    }
}

/// Aggregate counters.
///
/// Always satisfies `total == completed + failed + executing + pending`;
/// tasks waiting out a retry backoff count as pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub executing: usize,
    pub pending: usize,
    pub started_at: Option<Instant>,
    pub ended_at: Option<Instant>,
}

/// Control flags plus collection sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub paused: bool,
    pub stopped: bool,
    pub executing: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Summary handed back by `start()` and `on_queue_complete`.
#[derive(Debug, Clone)]
pub struct QueueResults<T> {
    pub stats: QueueStats,
    pub completed: Vec<TaskSnapshot<T>>,
    pub failed: Vec<TaskSnapshot<T>>,
    pub is_success: bool,

    /// completed / total as a rounded percentage.
    pub success_rate: u8,
}

pub(crate) fn percent(part: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((part as f64 / total as f64) * 100.0).round() as u8
}
