//! Telemetry event payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form event properties. Values must be JSON.
pub type Props = Map<String, Value>;

/// Event category, serialized lowercase as `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Page view or route change.
    Page,
    /// Ordinary interaction.
    Event,
    Error,
    /// Performance metric.
    Perf,
    /// Outbound API call summary.
    Api,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl TelemetryUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            role: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub name: String,

    /// Unix milliseconds on the wire.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ts: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub props: Props,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<TelemetryUser>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    pub app: String,
    pub release: String,
}

/// One delivery unit: everything buffered at flush time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<TelemetryEvent>,
}

impl EventBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
