//! Queue configuration, partial updates and the preset profiles.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{TaskOptions, TaskOverrides};
use crate::error::ConfigError;

/// Queue-level configuration.
///
/// Durations are kept as millisecond integers so the struct reads and writes
/// cleanly as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Hard cap on simultaneously executing tasks.
    pub max_concurrent: usize,

    /// Pause after each attempt settles before its slot is reused, and the
    /// scheduling tick period.
    pub request_interval_ms: u64,

    /// Default retry budget per task.
    pub max_retries: u32,

    /// Base unit of the linear backoff.
    pub retry_delay_ms: u64,

    /// Default wall-clock budget per attempt.
    pub timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            request_interval_ms: 200,
            max_retries: 2,
            retry_delay_ms: 1000,
            timeout_ms: 15_000,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Merge `update` over `self`, returning the result without validating it.
    pub fn merged(&self, update: &ConfigUpdate) -> Self {
        Self {
            max_concurrent: update.max_concurrent.unwrap_or(self.max_concurrent),
            request_interval_ms: update
                .request_interval_ms
                .unwrap_or(self.request_interval_ms),
            max_retries: update.max_retries.unwrap_or(self.max_retries),
            retry_delay_ms: update.retry_delay_ms.unwrap_or(self.retry_delay_ms),
            timeout_ms: update.timeout_ms.unwrap_or(self.timeout_ms),
        }
    }

    /// Effective options for a task submitted now.
    pub fn task_options(&self, overrides: &TaskOverrides) -> TaskOptions {
        TaskOptions {
            priority: overrides.priority.unwrap_or(0),
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
            timeout: Duration::from_millis(
                overrides
                    .timeout_ms
                    .filter(|ms| *ms > 0)
                    .unwrap_or(self.timeout_ms),
            ),
        }
    }
}

/// Partial configuration; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub max_concurrent: Option<usize>,
    pub request_interval_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

impl ConfigUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrent(mut self, value: usize) -> Self {
        self.max_concurrent = Some(value);
        self
    }

    pub fn request_interval_ms(mut self, value: u64) -> Self {
        self.request_interval_ms = Some(value);
        self
    }

    pub fn max_retries(mut self, value: u32) -> Self {
        self.max_retries = Some(value);
        self
    }

    pub fn retry_delay_ms(mut self, value: u64) -> Self {
        self.retry_delay_ms = Some(value);
        self
    }

    pub fn timeout_ms(mut self, value: u64) -> Self {
        self.timeout_ms = Some(value);
        self
    }
}

/// Named parameterizations of the one scheduler design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// Balanced defaults.
    Standard,
    /// Lightweight tasks, throughput first.
    HighConcurrency,
    /// Heavy tasks, run one at a time.
    LowConcurrency,
    /// Database-sensitive bulk writes: low concurrency, several retries,
    /// long timeout.
    Specification,
    /// Best-effort batch reporting with a shorter timeout.
    Telemetry,
}

impl Preset {
    pub fn config(self) -> QueueConfig {
        let (max_concurrent, request_interval_ms, max_retries, retry_delay_ms, timeout_ms) =
            match self {
                Preset::Standard => (3, 100, 3, 1000, 30_000),
                Preset::HighConcurrency => (10, 50, 2, 500, 10_000),
                Preset::LowConcurrency => (1, 500, 5, 2000, 60_000),
                Preset::Specification => (2, 200, 3, 1500, 15_000),
                Preset::Telemetry => (2, 200, 3, 1500, 10_000),
            };
        QueueConfig {
            max_concurrent,
            request_interval_ms,
            max_retries,
            retry_delay_ms,
            timeout_ms,
        }
    }
}
