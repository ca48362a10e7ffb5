use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::context::ContextSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    /// Bypasses every other flush condition.
    Critical,
}

/// Static description of the host device, attached to every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub platform: String,
    pub os_version: String,
    pub app_version: String,
    pub model: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            os_version: "unknown".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            model: "unknown".to_string(),
        }
    }
}

/// A single behavioral record. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub event_name: String,
    pub user_id: String,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub device_info: DeviceInfo,
    pub context: ContextSnapshot,
    pub payload: Value,
    pub priority: Priority,
}

impl Event {
    /// Reads a string field from the payload, if present.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Session {
    pub fn begin(start_time: DateTime<Utc>) -> Self {
        Self {
            session_id: SessionId::generate(),
            start_time,
            end_time: None,
        }
    }
}

/// Persisted form of one session's pending events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEnvelope {
    pub session_id: SessionId,
    pub start_time: DateTime<Utc>,
    /// Set once the session is retired. A live or recovered envelope has none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub events: Vec<Event>,
}

impl SessionEnvelope {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// When the session ended: its retirement time, or the latest event
    /// timestamp for a session that was never retired.
    pub fn ended_at(&self) -> DateTime<Utc> {
        self.end_time.unwrap_or_else(|| self.last_activity())
    }

    /// Latest event timestamp, falling back to the session start.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.events
            .iter()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or(self.start_time)
    }

    /// First user id seen in the session.
    pub fn user_id(&self) -> Option<&str> {
        self.events.first().map(|e| e.user_id.as_str())
    }
}
