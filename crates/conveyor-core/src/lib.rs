//! conveyor-core
//!
//! In-process, concurrency-bounded async task queue with priorities,
//! per-attempt timeouts, linear-backoff retries, request throttling,
//! pause/resume/stop and progress observation.
//!
//! # Modules
//! - **domain**: ids, task status/options/snapshots, progress and result views
//! - **ports**: replaceable collaborators (clock, id generation)
//! - **queue**: configuration, presets, retry policy and the `TaskQueue` scheduler
//! - **telemetry**: event batcher that delivers through a telemetry-preset queue
//! - **error**: task, configuration and queue error types

pub mod domain;
pub mod error;
pub mod ports;
pub mod queue;
pub mod telemetry;

pub use domain::{
    ExtendedProgress, Progress, QueueResults, QueueStats, QueueStatus, TaskId, TaskInput,
    TaskOptions, TaskOutcome, TaskOverrides, TaskSnapshot, TaskStatus,
};
pub use error::{BoxError, ConfigError, QueueError, TaskError};
pub use queue::{
    BatchItem, ConfigUpdate, Operation, Preset, QueueConfig, Subscription, TaskQueue,
    TaskQueueBuilder,
};
pub use tokio_util::sync::CancellationToken;
