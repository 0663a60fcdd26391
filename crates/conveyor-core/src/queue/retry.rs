//! Retry policy: decides whether a failed attempt is retried and how long to
//! wait first.

use std::time::Duration;

use crate::error::TaskError;

/// Linear backoff.
///
/// With `base_delay = 100ms`:
/// - retry 1: 100ms
/// - retry 2: 200ms
/// - retry 3: 300ms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    /// `retries_used` is the count before this failure. Cancellation is never
    /// retried.
    pub fn should_retry(&self, retries_used: u32, max_retries: u32, error: &TaskError) -> bool {
        !matches!(error, TaskError::Cancelled) && retries_used < max_retries
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn next_delay(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(retry.max(1))
    }
}
