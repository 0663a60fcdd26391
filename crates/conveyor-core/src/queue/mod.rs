//! Queue module: configuration, retry policy, task records, scheduler state
//! and the `TaskQueue` handle.

mod builder;
mod config;
mod hooks;
mod operation;
mod record;
mod retry;
mod scheduler;
mod state;

#[cfg(test)]
mod tests;

pub use builder::TaskQueueBuilder;
pub use config::{ConfigUpdate, Preset, QueueConfig};
pub use hooks::{
    ErrorHook, Listener, ProgressHook, QueueCompleteHook, Subscription, TaskCompleteHook,
};
pub use operation::{Operation, OperationFuture};
pub use retry::RetryPolicy;
pub use scheduler::{BatchItem, TaskQueue};
