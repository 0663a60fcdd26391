use thiserror::Error;

/// Error type returned by task operations.
///
/// The scheduler never inspects it beyond its `Display` text.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why a single task attempt did not succeed.
///
/// Recorded on the task and handed to observers; never propagated out of the
/// scheduler as an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The operation itself returned an error.
    #[error("task failed: {message}")]
    Failed { message: String },

    /// The operation did not settle within its budget.
    #[error("task timeout: {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    /// The queue was stopped while the attempt was in flight.
    #[error("task cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::TimedOut { .. })
    }
}

impl From<BoxError> for TaskError {
    fn from(err: BoxError) -> Self {
        Self::failed(err.to_string())
    }
}

/// Invalid queue or telemetry configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("max_concurrent must be at least 1")]
    ZeroConcurrency,

    #[error("timeout_ms must be greater than 0")]
    ZeroTimeout,

    #[error("sample_rate must be within 0.0..=1.0, got {0}")]
    InvalidSampleRate(f64),

    #[error("batch_size must be at least 1")]
    ZeroBatchSize,
}

/// Queue-level misuse. Per-task failures never surface here.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue stopped; construct a new instance")]
    Stopped,

    #[error("queue was stopped before it completed")]
    Interrupted,

    #[error("no tokio runtime available to drive the queue")]
    NoRuntime,

    #[error(transparent)]
    Config(#[from] ConfigError),
}
