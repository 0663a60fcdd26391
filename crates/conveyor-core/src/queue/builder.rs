//! TaskQueueBuilder - wiring of config, observers and id generation.
//!
//! Validation happens once in `build()`: a queue that exists always has a
//! usable configuration.

use std::marker::PhantomData;
use std::sync::Arc;

use super::config::{ConfigUpdate, Preset, QueueConfig};
use super::hooks::Hooks;
use super::scheduler::TaskQueue;
use crate::domain::{ExtendedProgress, QueueResults, TaskOutcome, TaskSnapshot};
use crate::error::{ConfigError, TaskError};
use crate::ports::{IdGenerator, SystemClock, UlidGenerator};

/// Builds a [`TaskQueue`].
///
/// # Example
/// ```ignore
/// let queue = TaskQueue::<String>::builder()
///     .preset(Preset::Specification)
///     .update(ConfigUpdate::new().max_retries(5))
///     .on_task_complete(|task, outcome| println!("{} {:?}", task.id, outcome))
///     .build()?;
/// ```
pub struct TaskQueueBuilder<T, P = ()> {
    config: QueueConfig,
    hooks: Hooks<T>,
    ids: Option<Arc<dyn IdGenerator>>,
    _payload: PhantomData<fn() -> P>,
}

impl<T, P> TaskQueueBuilder<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            config: QueueConfig::default(),
            hooks: Hooks::default(),
            ids: None,
            _payload: PhantomData,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Start from a preset profile.
    pub fn preset(mut self, preset: Preset) -> Self {
        self.config = preset.config();
        self
    }

    /// Apply a partial update over the current configuration.
    pub fn update(mut self, update: ConfigUpdate) -> Self {
        self.config = self.config.merged(&update);
        self
    }

    /// Source of ids for tasks submitted without one.
    pub fn id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Some(Arc::new(ids));
        self
    }

    pub fn on_progress(mut self, hook: impl Fn(&ExtendedProgress) + Send + Sync + 'static) -> Self {
        self.hooks.on_progress = Some(Arc::new(hook));
        self
    }

    pub fn on_task_complete(
        mut self,
        hook: impl Fn(&TaskSnapshot<T>, TaskOutcome) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_task_complete = Some(Arc::new(hook));
        self
    }

    /// Fired once each time the queue transitions into the complete state.
    pub fn on_queue_complete(
        mut self,
        hook: impl Fn(&QueueResults<T>) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_queue_complete = Some(Arc::new(hook));
        self
    }

    /// Fired for terminal failures only; attempts that will be retried stay quiet.
    pub fn on_error(
        mut self,
        hook: impl Fn(&TaskSnapshot<T>, &TaskError) + Send + Sync + 'static,
    ) -> Self {
        self.hooks.on_error = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<TaskQueue<T, P>, ConfigError> {
        self.config.validate()?;
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(SystemClock)));
        Ok(TaskQueue::from_parts(self.config, self.hooks, ids))
    }
}

impl<T, P> Default for TaskQueueBuilder<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
