//! TelemetryClient - buffering front end over a telemetry task queue.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::event::{EventBatch, EventKind, Props, TelemetryEvent, TelemetryUser};
use super::{TelemetrySettings, Transport};
use crate::domain::{TaskId, TaskInput, TaskOverrides};
use crate::error::{ConfigError, QueueError};
use crate::ports::{Clock, SystemClock};
use crate::queue::{ConfigUpdate, TaskQueue};

/// Explicitly constructed telemetry client.
///
/// Tracking never blocks: events are sampled, stamped and buffered, and a full
/// buffer is handed to the queue as one batch. Delivery is best effort with
/// the telemetry preset's retries and timeout.
pub struct TelemetryClient<S> {
    transport: Arc<S>,
    clock: Arc<dyn Clock>,
    settings: Mutex<TelemetrySettings>,
    buffer: Mutex<Vec<TelemetryEvent>>,
    queue: TaskQueue<(), EventBatch>,
}

impl<S: Transport + 'static> TelemetryClient<S> {
    pub fn new(settings: TelemetrySettings, transport: S) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self {
            transport: Arc::new(transport),
            clock: Arc::new(SystemClock),
            settings: Mutex::new(settings),
            buffer: Mutex::new(Vec::new()),
            queue: TaskQueue::telemetry(ConfigUpdate::new())?,
        })
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Swap the delivery queue, e.g. for one with different retry settings.
    pub fn with_queue(mut self, queue: TaskQueue<(), EventBatch>) -> Self {
        self.queue = queue;
        self
    }

    pub fn track_page_view(&self, name: impl Into<String>, props: Props) {
        self.push(EventKind::Page, name.into(), props);
    }

    pub fn track_event(&self, name: impl Into<String>, props: Props) {
        self.push(EventKind::Event, name.into(), props);
    }

    pub fn track_error(
        &self,
        name: impl Into<String>,
        message: impl Into<String>,
        stack: Option<String>,
        fatal: bool,
    ) {
        let mut props = Props::new();
        props.insert("message".into(), Value::String(message.into()));
        if let Some(stack) = stack {
            props.insert("stack".into(), Value::String(stack));
        }
        props.insert("fatal".into(), Value::Bool(fatal));
        self.push(EventKind::Error, name.into(), props);
    }

    pub fn track_perf(&self, name: impl Into<String>, props: Props) {
        self.push(EventKind::Perf, name.into(), props);
    }

    /// `status` and `durationMs` are set first; entries in `props` win on
    /// conflict.
    pub fn track_api(&self, name: impl Into<String>, status: u16, duration_ms: u64, props: Props) {
        let mut merged = Props::new();
        merged.insert("status".into(), json!(status));
        merged.insert("durationMs".into(), json!(duration_ms));
        merged.extend(props);
        self.push(EventKind::Api, name.into(), merged);
    }

    pub fn set_user(&self, user: Option<TelemetryUser>) {
        lock(&self.settings).user = user;
    }

    pub fn settings(&self) -> TelemetrySettings {
        lock(&self.settings).clone()
    }

    /// Events waiting for the next flush.
    pub fn buffered(&self) -> usize {
        lock(&self.buffer).len()
    }

    pub fn queue(&self) -> &TaskQueue<(), EventBatch> {
        &self.queue
    }

    fn push(&self, kind: EventKind, name: String, props: Props) {
        let (event, batch_size) = {
            let settings = lock(&self.settings);
            if !sampled(settings.sample_rate) {
                return;
            }
            let event = TelemetryEvent {
                kind,
                name,
                ts: self.clock.now(),
                props,
                user: settings.user.clone(),
                session_id: None,
                app: settings.app.clone(),
                release: settings.release.clone(),
            };
            (event, settings.batch_size)
        };

        let full = {
            let mut buffer = lock(&self.buffer);
            buffer.push(event);
            buffer.len() >= batch_size
        };
        if full {
            if let Err(err) = self.flush() {
                tracing::warn!(error = %err, "telemetry auto-flush failed");
            }
        }
    }

    /// Hand everything buffered to the queue as one batch and launch it.
    ///
    /// Does not wait for delivery. Returns `None` when the buffer was empty.
    pub fn flush(&self) -> Result<Option<TaskId>, QueueError> {
        let events = std::mem::take(&mut *lock(&self.buffer));
        if events.is_empty() {
            return Ok(None);
        }
        let endpoint = lock(&self.settings).endpoint.clone();
        let count = events.len();

        let transport = Arc::clone(&self.transport);
        let id = self.queue.submit_with_options(
            move |input: TaskInput<EventBatch>, cancel: CancellationToken| {
                let transport = Arc::clone(&transport);
                let endpoint = endpoint.clone();
                async move { transport.send(&endpoint, &input.data, cancel).await }
            },
            EventBatch { events },
            TaskOverrides::default(),
        );
        tracing::debug!(task_id = %id, events = count, "telemetry batch queued");

        self.queue.launch()?;
        Ok(Some(id))
    }
}

fn sampled(rate: f64) -> bool {
    rate >= 1.0 || rand::random::<f64>() < rate
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
