//! Telemetry batcher: samples, stamps and buffers events, then ships them in
//! batches through a dedicated telemetry-preset [`TaskQueue`](crate::TaskQueue).

mod client;
mod event;

pub use client::TelemetryClient;
pub use event::{EventBatch, EventKind, Props, TelemetryEvent, TelemetryUser};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, ConfigError};

/// Transport port: delivers one batch to the collector.
///
/// Errors are retried by the queue according to the telemetry preset.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        endpoint: &str,
        batch: &EventBatch,
        cancel: CancellationToken,
    ) -> Result<(), BoxError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub app: String,
    pub release: String,
    pub endpoint: String,
    pub user: Option<TelemetryUser>,

    /// Probability that an event is kept, within `0.0..=1.0`.
    pub sample_rate: f64,

    /// Buffer length that triggers an automatic flush.
    pub batch_size: usize,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            app: "app".to_owned(),
            release: "dev".to_owned(),
            endpoint: "/api/telemetry/batch".to_owned(),
            user: None,
            sample_rate: 1.0,
            batch_size: 20,
        }
    }
}

impl TelemetrySettings {
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }
}
