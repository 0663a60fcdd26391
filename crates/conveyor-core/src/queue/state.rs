//! Scheduler-owned collections and every transition between them.
//!
//! A task key lives in exactly one of `pending`, `delayed` (waiting out a
//! retry backoff, counted as pending), `executing`, `completed` or `failed`.
//! Records themselves sit in `records`; the collections hold keys only.
//!
//! Nothing in here awaits. The scheduler calls these methods inside one short
//! critical section and does all suspension outside it.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::QueueConfig;
use super::hooks::Event;
use super::operation::Operation;
use super::record::{TaskKey, TaskRecord};
use super::retry::RetryPolicy;
use crate::domain::progress::percent;
use crate::domain::{
    ExtendedProgress, Progress, QueueResults, QueueStats, QueueStatus, TaskId, TaskInput,
    TaskOutcome, TaskOverrides, TaskSnapshot,
};
use crate::error::TaskError;

/// Everything an attempt needs once it leaves the lock.
pub(crate) struct Attempt<T, P> {
    pub key: TaskKey,
    pub generation: u64,
    pub task_id: TaskId,
    pub operation: Arc<dyn Operation<P, T>>,
    pub input: TaskInput<P>,
    pub cancel: CancellationToken,
    pub timeout: Duration,
}

pub(crate) struct Dispatch<T, P> {
    pub attempts: Vec<Attempt<T, P>>,
    pub keep_going: bool,
    pub tick: Duration,
}

/// Follow-up work for a settled attempt.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Settlement {
    /// Re-enqueue after this backoff.
    pub retry_after: Option<Duration>,
    /// Keep the slot reserved for this long.
    pub throttle: Option<Duration>,
}

/// Pushed to `start()` waiters through a watch channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RunSignal {
    pub completions: u64,
    pub complete: bool,
    pub stopped: bool,
}

pub(crate) struct QueueState<T, P> {
    pub config: QueueConfig,

    records: HashMap<TaskKey, TaskRecord<T, P>>,
    pending: VecDeque<TaskKey>,
    delayed: HashSet<TaskKey>,
    executing: HashSet<TaskKey>,
    completed: Vec<TaskKey>,
    failed: Vec<TaskKey>,
    next_key: u64,

    /// Bumped by `clear`; attempts from an older generation are ignored.
    pub generation: u64,

    /// Slots held by the post-attempt throttle.
    cooling: usize,

    pub paused: bool,
    pub stopped: bool,
    pub launched: bool,
    pub destroyed: bool,

    pub driver_active: bool,
    pub driver: Option<JoinHandle<()>>,
    pub runtime: Option<Handle>,

    started_at: Option<Instant>,
    ended_at: Option<Instant>,
    was_complete: bool,
    completions: u64,
}

impl<T, P> QueueState<T, P>
where
    T: Clone,
    P: Clone,
{
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
            pending: VecDeque::new(),
            delayed: HashSet::new(),
            executing: HashSet::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            next_key: 0,
            generation: 0,
            cooling: 0,
            paused: false,
            stopped: false,
            launched: false,
            destroyed: false,
            driver_active: false,
            driver: None,
            runtime: None,
            started_at: None,
            ended_at: None,
            was_complete: false,
            completions: 0,
        }
    }

    // ---------------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------------

    pub fn submit(
        &mut self,
        id: TaskId,
        operation: Arc<dyn Operation<P, T>>,
        payload: P,
        overrides: &TaskOverrides,
        events: &mut Vec<Event<T>>,
    ) {
        let options = self.config.task_options(overrides);
        let key = TaskKey(self.next_key);
        self.next_key += 1;

        tracing::debug!(task_id = %id, priority = options.priority, "task submitted");
        self.records
            .insert(key, TaskRecord::new(id, operation, payload, options));
        self.enqueue(key);
        events.push(Event::Progress(self.progress()));
    }

    /// Append then stable-sort by priority, highest first.
    fn enqueue(&mut self, key: TaskKey) {
        self.pending.push_back(key);
        let records = &self.records;
        self.pending
            .make_contiguous()
            .sort_by_key(|k| Reverse(records.get(k).map_or(0, |r| r.options.priority)));
    }

    /// Move as many pending tasks into execution as the free slots allow.
    pub fn dispatch(&mut self, events: &mut Vec<Event<T>>) -> Dispatch<T, P> {
        let mut attempts = Vec::new();

        while !self.paused
            && !self.stopped
            && self.executing.len() + self.cooling < self.config.max_concurrent
        {
            let Some(key) = self.pending.pop_front() else {
                break;
            };
            let Some(record) = self.records.get_mut(&key) else {
                continue;
            };

            let (input, cancel) = record.start_attempt();
            tracing::debug!(
                task_id = %record.id,
                priority = record.options.priority,
                retries_used = record.attempts,
                "dispatching task"
            );
            attempts.push(Attempt {
                key,
                generation: self.generation,
                task_id: record.id.clone(),
                operation: Arc::clone(&record.operation),
                input,
                cancel,
                timeout: record.options.timeout,
            });
            self.executing.insert(key);
            if self.started_at.is_none() {
                self.started_at = Some(Instant::now());
            }
            events.push(Event::Progress(self.progress()));
        }

        let keep_going = !self.is_complete() && !self.paused && !self.stopped;
        if !keep_going {
            self.driver_active = false;
            self.driver = None;
        }
        Dispatch {
            attempts,
            keep_going,
            tick: self.config.request_interval(),
        }
    }

    /// Record the outcome of an attempt and apply the retry policy.
    pub fn settle(
        &mut self,
        key: TaskKey,
        generation: u64,
        outcome: Result<T, TaskError>,
        events: &mut Vec<Event<T>>,
    ) -> Settlement {
        if generation != self.generation || !self.executing.remove(&key) {
            return Settlement::default();
        }
        let Some(record) = self.records.get_mut(&key) else {
            return Settlement::default();
        };

        let policy = RetryPolicy::new(self.config.retry_delay());
        let mut settlement = Settlement::default();

        match outcome {
            Ok(value) => {
                record.mark_completed(value);
                let snapshot = record.snapshot();
                tracing::debug!(
                    task_id = %snapshot.id,
                    duration_ms = snapshot.duration().unwrap_or_default().as_millis() as u64,
                    "task completed"
                );
                self.completed.push(key);
                events.push(Event::TaskDone {
                    snapshot,
                    outcome: TaskOutcome::Success,
                    error: None,
                });
            }
            Err(error)
                if policy.should_retry(record.attempts, record.options.max_retries, &error) =>
            {
                record.schedule_retry(error.clone());
                let delay = policy.next_delay(record.attempts);
                tracing::warn!(
                    task_id = %record.id,
                    attempt = record.attempts,
                    max_retries = record.options.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "task attempt failed; retry scheduled"
                );
                self.delayed.insert(key);
                settlement.retry_after = Some(delay);
            }
            Err(error) => {
                record.mark_failed(error.clone());
                let snapshot = record.snapshot();
                tracing::warn!(
                    task_id = %snapshot.id,
                    retries_used = snapshot.attempts,
                    %error,
                    "task failed"
                );
                self.failed.push(key);
                events.push(Event::TaskDone {
                    snapshot,
                    outcome: TaskOutcome::Failed,
                    error: Some(error),
                });
            }
        }

        let interval = self.config.request_interval();
        if !interval.is_zero() {
            self.cooling += 1;
            settlement.throttle = Some(interval);
        }
        events.push(Event::Progress(self.progress()));
        settlement
    }

    /// Backoff elapsed: put the task back at the head of the line.
    pub fn requeue(&mut self, key: TaskKey, generation: u64, events: &mut Vec<Event<T>>) -> bool {
        if generation != self.generation || !self.delayed.remove(&key) {
            return false;
        }
        if let Some(record) = self.records.get_mut(&key) {
            record.requeue();
        }
        self.pending.push_front(key);
        events.push(Event::Progress(self.progress()));
        true
    }

    pub fn release_slot(&mut self) {
        self.cooling = self.cooling.saturating_sub(1);
    }

    /// Flag the queue stopped and collect the tokens of in-flight attempts.
    pub fn stop(&mut self, events: &mut Vec<Event<T>>) -> Vec<CancellationToken> {
        self.stopped = true;
        self.paused = true;
        let tokens = self
            .executing
            .iter()
            .filter_map(|key| self.records.get(key))
            .filter_map(|record| record.cancel.clone())
            .collect();
        events.push(Event::Progress(self.progress()));
        tokens
    }

    pub fn clear(&mut self, events: &mut Vec<Event<T>>) {
        self.records.clear();
        self.pending.clear();
        self.delayed.clear();
        self.executing.clear();
        self.completed.clear();
        self.failed.clear();
        self.generation += 1;
        self.started_at = None;
        self.ended_at = None;
        events.push(Event::Progress(self.progress()));
    }

    /// Failed -> Pending for every failed task. Returns how many moved.
    pub fn retry_failed(&mut self, events: &mut Vec<Event<T>>) -> usize {
        let failed = std::mem::take(&mut self.failed);
        let mut moved = 0;
        for key in failed {
            if let Some(record) = self.records.get_mut(&key) {
                record.reset();
                self.enqueue(key);
                moved += 1;
            }
        }
        events.push(Event::Progress(self.progress()));
        moved
    }

    /// Detect a transition into the Complete condition.
    pub fn refresh_completion(&mut self, events: &mut Vec<Event<T>>) {
        let complete = self.is_complete();
        if complete && !self.was_complete {
            let now = Instant::now();
            self.ended_at = Some(now);
            self.completions += 1;
            tracing::info!(
                total = self.records.len(),
                completed = self.completed.len(),
                failed = self.failed.len(),
                elapsed_ms = self
                    .started_at
                    .map(|s| now.saturating_duration_since(s).as_millis() as u64)
                    .unwrap_or(0),
                "queue complete"
            );
            events.push(Event::QueueDone(self.results()));
        }
        self.was_complete = complete;
    }

    // ---------------------------------------------------------------------
    // Views
    // ---------------------------------------------------------------------

    /// Nothing waiting, nothing in flight, at least one task ever seen, and
    /// not stopped. A stopped run is interrupted, never complete.
    pub fn is_complete(&self) -> bool {
        !self.stopped
            && self.pending.is_empty()
            && self.delayed.is_empty()
            && self.executing.is_empty()
            && !self.records.is_empty()
    }

    pub fn signal(&self) -> RunSignal {
        RunSignal {
            completions: self.completions,
            complete: self.was_complete,
            stopped: self.stopped,
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            total: self.records.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
            executing: self.executing.len(),
            pending: self.pending.len() + self.delayed.len(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }

    pub fn progress(&self) -> ExtendedProgress {
        let stats = self.stats();
        ExtendedProgress {
            total: stats.total,
            completed: stats.completed,
            failed: stats.failed,
            executing: stats.executing,
            pending: stats.pending,
            percentage: percent(stats.completed + stats.failed, stats.total),
            is_complete: self.is_complete(),
            elapsed_ms: self
                .started_at
                .map(|s| s.elapsed().as_millis() as u64)
                .unwrap_or(0),
        }
    }

    pub fn lite_progress(&self) -> Progress {
        self.progress().lite()
    }

    pub fn status(&self) -> QueueStatus {
        let stats = self.stats();
        QueueStatus {
            paused: self.paused,
            stopped: self.stopped,
            executing: stats.executing,
            pending: stats.pending,
            completed: stats.completed,
            failed: stats.failed,
        }
    }

    pub fn results(&self) -> QueueResults<T> {
        let stats = self.stats();
        QueueResults {
            stats,
            completed: self.snapshots(&self.completed),
            failed: self.snapshots(&self.failed),
            is_success: self.failed.is_empty(),
            success_rate: percent(stats.completed, stats.total),
        }
    }

    fn snapshots(&self, keys: &[TaskKey]) -> Vec<TaskSnapshot<T>> {
        keys.iter()
            .filter_map(|key| self.records.get(key))
            .map(TaskRecord::snapshot)
            .collect()
    }

    pub fn failed_ids(&self) -> Vec<TaskId> {
        self.failed
            .iter()
            .filter_map(|key| self.records.get(key))
            .map(|record| record.id.clone())
            .collect()
    }

    /// Most recent submission carrying `id`.
    pub fn task(&self, id: &TaskId) -> Option<TaskSnapshot<T>> {
        self.records
            .iter()
            .filter(|(_, record)| &record.id == id)
            .max_by_key(|(key, _)| **key)
            .map(|(_, record)| record.snapshot())
    }

    /// Every record sits in exactly one collection.
    #[cfg(test)]
    pub fn check_accounting(&self) {
        let mut seen = HashSet::new();
        let all = self
            .pending
            .iter()
            .chain(self.delayed.iter())
            .chain(self.executing.iter())
            .chain(self.completed.iter())
            .chain(self.failed.iter());
        for key in all {
            assert!(seen.insert(*key), "task {key:?} is in two collections");
            assert!(self.records.contains_key(key), "task {key:?} has no record");
        }
        assert_eq!(seen.len(), self.records.len(), "a record is in no collection");
        assert!(self.executing.len() <= self.config.max_concurrent);
    }
}
