//! Event and subscription priority types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Priority of an event handler.
///
/// Handlers for one event run in descending priority order; handlers with
/// equal priority run in the order they subscribed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for EventPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventPriority::Low => write!(f, "LOW"),
            EventPriority::Normal => write!(f, "NORMAL"),
            EventPriority::High => write!(f, "HIGH"),
            EventPriority::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// An event published on the [`EventBus`](super::EventBus).
///
/// `event_type` is a dotted name such as `clone.completed`. Events are
/// built with the `with_*` methods and become immutable once published:
/// the bus shares them behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event.
    pub event_id: String,
    /// Dotted event type.
    pub event_type: String,
    /// Component that produced the event (e.g. `clone:<id>`, `clone_queue`).
    pub source: String,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Free-form payload. Consumers must tolerate unknown fields.
    pub payload: Map<String, Value>,
}

impl Event {
    /// Creates an event with an empty payload.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source: source.into(),
            timestamp: Utc::now(),
            payload: Map::new(),
        }
    }

    /// Replaces the payload.
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Adds a single payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Returns a payload field as a string, if present and a string.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Returns a payload field as an unsigned integer, if present and numeric.
    pub fn field_u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }
}
