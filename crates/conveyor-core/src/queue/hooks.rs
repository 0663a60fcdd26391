//! Observer plumbing: configured callbacks and progress subscribers.
//!
//! Observers run outside the scheduler lock and every call is wrapped in
//! `catch_unwind`, so a panicking observer is logged and skipped.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::domain::{ExtendedProgress, Progress, QueueResults, TaskOutcome, TaskSnapshot};
use crate::error::TaskError;

pub type ProgressHook = Arc<dyn Fn(&ExtendedProgress) + Send + Sync>;
pub type TaskCompleteHook<T> = Arc<dyn Fn(&TaskSnapshot<T>, TaskOutcome) + Send + Sync>;
pub type QueueCompleteHook<T> = Arc<dyn Fn(&QueueResults<T>) + Send + Sync>;
pub type ErrorHook<T> = Arc<dyn Fn(&TaskSnapshot<T>, &TaskError) + Send + Sync>;
pub type Listener = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Something observers must hear about, produced under the lock and
/// delivered after it is released.
pub(crate) enum Event<T> {
    Progress(ExtendedProgress),
    TaskDone {
        snapshot: TaskSnapshot<T>,
        outcome: TaskOutcome,
        error: Option<TaskError>,
    },
    QueueDone(QueueResults<T>),
}

pub(crate) struct Hooks<T> {
    pub on_progress: Option<ProgressHook>,
    pub on_task_complete: Option<TaskCompleteHook<T>>,
    pub on_queue_complete: Option<QueueCompleteHook<T>>,
    pub on_error: Option<ErrorHook<T>>,
}

impl<T> Default for Hooks<T> {
    fn default() -> Self {
        Self {
            on_progress: None,
            on_task_complete: None,
            on_queue_complete: None,
            on_error: None,
        }
    }
}

impl<T> Hooks<T> {
    pub fn deliver(&self, listeners: &Listeners, events: Vec<Event<T>>) {
        for event in events {
            match event {
                Event::Progress(progress) => {
                    if let Some(hook) = &self.on_progress {
                        isolate("on_progress", || hook(&progress));
                    }
                    listeners.publish(&progress.lite());
                }
                Event::TaskDone {
                    snapshot,
                    outcome,
                    error,
                } => {
                    if let Some(hook) = &self.on_task_complete {
                        isolate("on_task_complete", || hook(&snapshot, outcome));
                    }
                    if let (Some(hook), Some(error)) = (&self.on_error, &error) {
                        isolate("on_error", || hook(&snapshot, error));
                    }
                }
                Event::QueueDone(results) => {
                    if let Some(hook) = &self.on_queue_complete {
                        isolate("on_queue_complete", || hook(&results));
                    }
                }
            }
        }
    }
}

/// Registry of `subscribe` listeners.
#[derive(Default)]
pub(crate) struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Listener)>>,
}

impl Listeners {
    pub fn add(self: &Arc<Self>, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        Subscription {
            id,
            listeners: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(entry_id, _)| *entry_id != id);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn publish(&self, progress: &Progress) {
        // Snapshot so listeners may (un)subscribe from inside the callback.
        let current: Vec<Listener> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in current {
            isolate("subscriber", || listener(progress));
        }
    }
}

/// Handle returned by `subscribe`. Dropping it keeps the listener registered.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(self.id);
        }
    }
}

fn isolate(hook: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!(hook, "observer panicked; ignored");
    }
}
