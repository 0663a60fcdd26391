//! Domain model (ids, task options/status/snapshots, progress views).

pub mod ids;
pub mod progress;
pub mod task;

pub use ids::TaskId;
pub use progress::{ExtendedProgress, Progress, QueueResults, QueueStats, QueueStatus};
pub use task::{TaskInput, TaskOptions, TaskOutcome, TaskOverrides, TaskSnapshot, TaskStatus};
