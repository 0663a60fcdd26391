//! Operation trait - the opaque async work a task runs.

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::domain::TaskInput;
use crate::error::BoxError;

pub type OperationFuture<T> = Pin<Box<dyn Future<Output = Result<T, BoxError>> + Send + 'static>>;

/// A side-effecting async operation.
///
/// Called once per attempt with a fresh `CancellationToken`. Cancellation is
/// cooperative: the scheduler stops waiting when the token fires, and the
/// operation is expected to wind down its own side effects.
///
/// Any `Fn(TaskInput<P>, CancellationToken) -> impl Future` closure is an
/// operation.
pub trait Operation<P, T>: Send + Sync {
    fn run(&self, input: TaskInput<P>, cancel: CancellationToken) -> OperationFuture<T>;
}

impl<P, T, F, Fut> Operation<P, T> for F
where
    F: Fn(TaskInput<P>, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, BoxError>> + Send + 'static,
{
    fn run(&self, input: TaskInput<P>, cancel: CancellationToken) -> OperationFuture<T> {
        Box::pin(self(input, cancel))
    }
}
