//! TaskQueue - the concurrency-bounded scheduler handle.
//!
//! One driver task per queue pulls pending work into free slots; every
//! attempt runs in its own spawned task. All bookkeeping goes through
//! [`Shared::mutate`], which holds the state lock for a synchronous critical
//! section, publishes the completion signal, then delivers observer events
//! after the lock is released.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use super::builder::TaskQueueBuilder;
use super::config::{ConfigUpdate, Preset, QueueConfig};
use super::hooks::{Event, Hooks, Listeners, Subscription};
use super::operation::Operation;
use super::state::{Attempt, QueueState, RunSignal};
use crate::domain::{
    ExtendedProgress, Progress, QueueResults, QueueStats, QueueStatus, TaskId, TaskInput,
    TaskOverrides, TaskSnapshot,
};
use crate::error::{BoxError, ConfigError, QueueError, TaskError};
use crate::ports::IdGenerator;

/// One entry of [`TaskQueue::submit_batch`].
pub struct BatchItem<T, P = ()> {
    pub id: Option<TaskId>,
    pub operation: Arc<dyn Operation<P, T>>,
    pub payload: P,
    pub overrides: TaskOverrides,
}

impl<T, P> BatchItem<T, P> {
    pub fn new<F, Fut>(operation: F, payload: P) -> Self
    where
        F: Fn(TaskInput<P>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
        P: 'static,
        T: 'static,
    {
        Self {
            id: None,
            operation: Arc::new(operation),
            payload,
            overrides: TaskOverrides::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_overrides(mut self, overrides: TaskOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

struct Shared<T, P> {
    state: Mutex<QueueState<T, P>>,
    hooks: Hooks<T>,
    listeners: Arc<Listeners>,
    ids: Arc<dyn IdGenerator>,
    wake: Notify,
    signal: watch::Sender<RunSignal>,
}

impl<T, P> Shared<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, QueueState<T, P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one critical section against the state.
    fn mutate<R>(&self, f: impl FnOnce(&mut QueueState<T, P>, &mut Vec<Event<T>>) -> R) -> R {
        let mut events = Vec::new();
        let out = {
            let mut state = self.lock();
            let out = f(&mut state, &mut events);
            state.refresh_completion(&mut events);
            let signal = state.signal();
            self.signal.send_if_modified(|current| {
                if *current == signal {
                    return false;
                }
                *current = signal;
                true
            });
            out
        };
        self.hooks.deliver(&self.listeners, events);
        out
    }

    fn read<R>(&self, f: impl FnOnce(&QueueState<T, P>) -> R) -> R {
        f(&self.lock())
    }
}

/// Spawn the driver unless one is running or the queue may not dispatch.
fn arm<T, P>(shared: &Arc<Shared<T, P>>, state: &mut QueueState<T, P>)
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    if state.driver_active || !state.launched || state.paused || state.stopped {
        return;
    }
    let Some(runtime) = state.runtime.clone() else {
        return;
    };
    state.driver_active = true;
    state.driver = Some(runtime.spawn(drive(Arc::clone(shared))));
}

/// Dispatch loop. Exits once the queue is complete, paused or stopped; it is
/// re-armed by whatever makes dispatch possible again.
async fn drive<T, P>(shared: Arc<Shared<T, P>>)
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    tracing::debug!("driver started");
    loop {
        let dispatch = shared.mutate(|state, events| state.dispatch(events));
        for attempt in dispatch.attempts {
            tokio::spawn(execute(Arc::clone(&shared), attempt));
        }
        if !dispatch.keep_going {
            break;
        }
        if dispatch.tick.is_zero() {
            shared.wake.notified().await;
        } else {
            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = tokio::time::sleep(dispatch.tick) => {}
            }
        }
    }
    tracing::debug!("driver stopped");
}

/// Run one attempt under its timeout and cancellation token, then settle it.
async fn execute<T, P>(shared: Arc<Shared<T, P>>, attempt: Attempt<T, P>)
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    let Attempt {
        key,
        generation,
        task_id,
        operation,
        input,
        cancel,
        timeout,
    } = attempt;

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TaskError::Cancelled),
        res = tokio::time::timeout(timeout, operation.run(input, cancel.clone())) => match res {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(TaskError::from(err)),
            Err(_) => {
                // Dropping the future stops polling it; the token tells the
                // operation to release whatever it spawned.
                cancel.cancel();
                tracing::debug!(task_id = %task_id, timeout_ms = timeout.as_millis() as u64, "attempt timed out");
                Err(TaskError::TimedOut {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        },
    };

    let settlement = shared.mutate(|state, events| state.settle(key, generation, outcome, events));

    if let Some(delay) = settlement.retry_after {
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.mutate(|state, events| {
                if state.requeue(key, generation, events) {
                    arm(&shared, state);
                }
            });
            shared.wake.notify_one();
        });
    }

    if let Some(throttle) = settlement.throttle {
        tokio::time::sleep(throttle).await;
        shared.mutate(|state, _| state.release_slot());
    }
    shared.wake.notify_one();
}

/// In-process, concurrency-bounded async task queue.
///
/// `T` is the result type every operation produces, `P` the payload handed to
/// operations. The handle is cheap to clone; clones drive the same queue.
///
/// Submitting never runs anything by itself: call [`launch`](Self::launch) or
/// [`start`](Self::start). After the first launch, later submissions are
/// picked up automatically unless the queue is paused or stopped.
pub struct TaskQueue<T, P = ()> {
    shared: Arc<Shared<T, P>>,
}

impl<T, P> Clone for TaskQueue<T, P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, P> TaskQueue<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    pub fn new(config: QueueConfig) -> Result<Self, ConfigError> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> TaskQueueBuilder<T, P> {
        TaskQueueBuilder::new()
    }

    pub fn from_preset(preset: Preset, update: ConfigUpdate) -> Result<Self, ConfigError> {
        Self::builder().preset(preset).update(update).build()
    }

    /// Queue tuned for database-sensitive bulk writes.
    pub fn specification(update: ConfigUpdate) -> Result<Self, ConfigError> {
        Self::from_preset(Preset::Specification, update)
    }

    /// Queue tuned for best-effort telemetry batches.
    pub fn telemetry(update: ConfigUpdate) -> Result<Self, ConfigError> {
        Self::from_preset(Preset::Telemetry, update)
    }

    pub(crate) fn from_parts(config: QueueConfig, hooks: Hooks<T>, ids: Arc<dyn IdGenerator>) -> Self {
        let (signal, _) = watch::channel(RunSignal::default());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::new(config)),
                hooks,
                listeners: Arc::new(Listeners::default()),
                ids,
                wake: Notify::new(),
                signal,
            }),
        }
    }

    // ---------------------------------------------------------------------
    // Submission
    // ---------------------------------------------------------------------

    /// Submit with a generated id, default payload and queue defaults.
    pub fn submit<F, Fut>(&self, operation: F) -> TaskId
    where
        F: Fn(TaskInput<P>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
        P: Default,
    {
        self.submit_with_options(operation, P::default(), TaskOverrides::default())
    }

    /// Submit under a caller-chosen id.
    ///
    /// Reusing an id creates a new task; the earlier one is left as it is.
    pub fn submit_with_id<F, Fut>(&self, id: impl Into<TaskId>, operation: F) -> TaskId
    where
        F: Fn(TaskInput<P>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
        P: Default,
    {
        let id = id.into();
        self.enqueue(id.clone(), Arc::new(operation), P::default(), TaskOverrides::default());
        id
    }

    pub fn submit_with_options<F, Fut>(&self, operation: F, payload: P, overrides: TaskOverrides) -> TaskId
    where
        F: Fn(TaskInput<P>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
    {
        self.submit_operation(Arc::new(operation), payload, overrides)
    }

    /// Submit an already type-erased operation.
    pub fn submit_operation(
        &self,
        operation: Arc<dyn Operation<P, T>>,
        payload: P,
        overrides: TaskOverrides,
    ) -> TaskId {
        let id = self.shared.ids.generate_task_id();
        self.enqueue(id.clone(), operation, payload, overrides);
        id
    }

    /// Submit several tasks; ids come back in input order.
    pub fn submit_batch(&self, items: impl IntoIterator<Item = BatchItem<T, P>>) -> Vec<TaskId> {
        items
            .into_iter()
            .map(|item| {
                let id = item
                    .id
                    .unwrap_or_else(|| self.shared.ids.generate_task_id());
                self.enqueue(id.clone(), item.operation, item.payload, item.overrides);
                id
            })
            .collect()
    }

    fn enqueue(&self, id: TaskId, operation: Arc<dyn Operation<P, T>>, payload: P, overrides: TaskOverrides) {
        let shared = &self.shared;
        shared.mutate(|state, events| {
            state.submit(id, operation, payload, &overrides, events);
            arm(shared, state);
        });
        shared.wake.notify_one();
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Begin dispatching without waiting for completion.
    ///
    /// Must be called from inside a tokio runtime. Idempotent.
    pub fn launch(&self) -> Result<(), QueueError> {
        self.launch_inner().map(|_| ())
    }

    /// Returns the completion count observed at launch.
    fn launch_inner(&self) -> Result<u64, QueueError> {
        let runtime = Handle::try_current().map_err(|_| QueueError::NoRuntime)?;
        let shared = &self.shared;
        let baseline = shared.mutate(|state, _| {
            if state.stopped {
                return Err(QueueError::Stopped);
            }
            if !state.launched || state.paused {
                tracing::info!(
                    max_concurrent = state.config.max_concurrent,
                    pending = state.stats().pending,
                    "queue started"
                );
            }
            state.paused = false;
            state.launched = true;
            state.runtime = Some(runtime);
            let baseline = state.signal().completions;
            arm(shared, state);
            Ok(baseline)
        })?;
        shared.wake.notify_one();
        Ok(baseline)
    }

    /// Launch and wait until the queue completes.
    ///
    /// Resolves with the results once every task is terminal. Calling it again
    /// while running joins the same run. Waits indefinitely on a queue that
    /// has never had a task.
    pub async fn start(&self) -> Result<QueueResults<T>, QueueError> {
        let mut signal = self.shared.signal.subscribe();
        let baseline = self.launch_inner()?;
        let observed = *signal
            .wait_for(|s| s.stopped || s.complete || s.completions > baseline)
            .await
            .map_err(|_| QueueError::Interrupted)?;
        if observed.stopped {
            return Err(QueueError::Interrupted);
        }
        Ok(self.results())
    }

    /// Stop dispatching new attempts. In-flight attempts run to completion.
    pub fn pause(&self) {
        self.shared.mutate(|state, _| {
            if !state.paused {
                state.paused = true;
                tracing::info!(executing = state.stats().executing, "queue paused");
            }
        });
        self.shared.wake.notify_one();
    }

    pub fn resume(&self) {
        let shared = &self.shared;
        shared.mutate(|state, _| {
            if state.stopped {
                tracing::warn!("resume ignored: queue is stopped");
                return;
            }
            if state.paused {
                state.paused = false;
                tracing::info!(pending = state.stats().pending, "queue resumed");
            }
            arm(shared, state);
        });
        shared.wake.notify_one();
    }

    /// Permanently stop the queue and cancel every in-flight attempt.
    ///
    /// Cancelled attempts settle as failed without retry. A stopped queue
    /// cannot be started again.
    pub fn stop(&self) {
        let tokens = self.shared.mutate(|state, events| {
            if state.stopped {
                return Vec::new();
            }
            tracing::info!(executing = state.stats().executing, "queue stopped");
            state.stop(events)
        });
        for token in tokens {
            token.cancel();
        }
        self.shared.wake.notify_one();
    }

    /// Stop, drop every task and abort the driver.
    pub fn destroy(&self) {
        self.stop();
        let driver = self.shared.mutate(|state, events| {
            state.clear(events);
            state.destroyed = true;
            state.driver_active = false;
            state.driver.take()
        });
        if let Some(driver) = driver {
            driver.abort();
        }
        tracing::info!("queue destroyed");
    }

    /// Remove every task and reset statistics.
    ///
    /// Attempts already in flight keep running; their outcomes are discarded.
    pub fn clear(&self) {
        self.shared.mutate(|state, events| {
            tracing::info!(total = state.stats().total, "queue cleared");
            state.clear(events);
        });
        self.shared.wake.notify_one();
    }

    /// Move every failed task back to pending with a fresh retry budget.
    pub fn retry_failed_tasks(&self) -> usize {
        let shared = &self.shared;
        let moved = shared.mutate(|state, events| {
            let moved = state.retry_failed(events);
            if moved > 0 {
                tracing::info!(count = moved, "retrying failed tasks");
                arm(shared, state);
            }
            moved
        });
        shared.wake.notify_one();
        moved
    }

    /// Merge `update` into the configuration.
    ///
    /// Applies to tasks submitted afterwards; queued tasks keep the options
    /// they were submitted with. Concurrency and throttle changes take effect
    /// at the next dispatch.
    pub fn update_config(&self, update: ConfigUpdate) -> Result<(), ConfigError> {
        self.shared.mutate(|state, _| {
            let next = state.config.merged(&update);
            next.validate()?;
            tracing::info!(?next, "queue config updated");
            state.config = next;
            Ok(())
        })?;
        self.shared.wake.notify_one();
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Observation
    // ---------------------------------------------------------------------

    /// Register a progress listener.
    pub fn subscribe(&self, listener: impl Fn(&Progress) + Send + Sync + 'static) -> Subscription {
        self.shared.listeners.add(Arc::new(listener))
    }

    pub fn config(&self) -> QueueConfig {
        self.shared.read(|state| state.config.clone())
    }

    pub fn progress(&self) -> Progress {
        self.shared.read(QueueState::lite_progress)
    }

    pub fn extended_progress(&self) -> ExtendedProgress {
        self.shared.read(QueueState::progress)
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.read(QueueState::stats)
    }

    pub fn status(&self) -> QueueStatus {
        self.shared.read(QueueState::status)
    }

    pub fn results(&self) -> QueueResults<T> {
        self.shared.read(QueueState::results)
    }

    pub fn task(&self, id: &TaskId) -> Option<TaskSnapshot<T>> {
        self.shared.read(|state| state.task(id))
    }

    pub fn failed_ids(&self) -> Vec<TaskId> {
        self.shared.read(QueueState::failed_ids)
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.read(|state| state.destroyed)
    }

    #[cfg(test)]
    pub(crate) fn check_accounting(&self) {
        self.shared.read(QueueState::check_accounting);
    }
}
