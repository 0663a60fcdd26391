//! Task record: operation + payload + lifecycle metadata.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::operation::Operation;
use crate::domain::{TaskId, TaskInput, TaskOptions, TaskSnapshot, TaskStatus};
use crate::error::TaskError;

/// Private per-submission key. Caller ids may repeat; keys never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TaskKey(pub u64);

/// Single source of truth for one submitted task.
///
/// The state collections hold `TaskKey`s only; every transition goes through
/// the methods here.
pub(crate) struct TaskRecord<T, P> {
    pub id: TaskId,
    pub operation: Arc<dyn Operation<P, T>>,
    pub payload: P,
    pub options: TaskOptions,
    pub status: TaskStatus,

    /// Retries consumed.
    pub attempts: u32,

    pub result: Option<T>,
    pub error: Option<TaskError>,
    pub started_at: Option<Instant>,
    pub ended_at: Option<Instant>,

    /// Token of the attempt in flight, if any.
    pub cancel: Option<CancellationToken>,
}

impl<T, P: Clone> TaskRecord<T, P> {
    pub fn new(
        id: TaskId,
        operation: Arc<dyn Operation<P, T>>,
        payload: P,
        options: TaskOptions,
    ) -> Self {
        Self {
            id,
            operation,
            payload,
            options,
            status: TaskStatus::Pending,
            attempts: 0,
            result: None,
            error: None,
            started_at: None,
            ended_at: None,
            cancel: None,
        }
    }

    /// Mark executing and hand out a fresh token plus the input to run with.
    pub fn start_attempt(&mut self) -> (TaskInput<P>, CancellationToken) {
        let token = CancellationToken::new();
        self.status = TaskStatus::Executing;
        self.started_at = Some(Instant::now());
        self.cancel = Some(token.clone());
        let input = TaskInput {
            task_id: self.id.clone(),
            data: self.payload.clone(),
        };
        (input, token)
    }

    pub fn mark_completed(&mut self, result: T) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.ended_at = Some(Instant::now());
        self.cancel = None;
    }

    pub fn mark_failed(&mut self, error: TaskError) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.ended_at = Some(Instant::now());
        self.cancel = None;
    }

    /// Consume one retry and wait in Retrying.
    pub fn schedule_retry(&mut self, error: TaskError) {
        self.status = TaskStatus::Retrying;
        self.attempts += 1;
        self.error = Some(error);
        self.cancel = None;
    }

    /// Retrying -> Pending.
    pub fn requeue(&mut self) {
        self.status = TaskStatus::Pending;
    }

    /// Failed -> Pending with a fresh retry budget.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.attempts = 0;
        self.error = None;
        self.result = None;
        self.started_at = None;
        self.ended_at = None;
        self.cancel = None;
    }
}

impl<T: Clone, P> TaskRecord<T, P> {
    pub fn snapshot(&self) -> TaskSnapshot<T> {
        TaskSnapshot {
            id: self.id.clone(),
            status: self.status,
            options: self.options.clone(),
            attempts: self.attempts,
            result: self.result.clone(),
            error: self.error.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}
