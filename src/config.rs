use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::telemetry::event::DeviceInfo;

pub const DEFAULT_CAPACITY: usize = 50;
pub const DEFAULT_EVICT_BATCH: usize = 10;
pub const DEFAULT_SIZE_THRESHOLD: usize = 10;
pub const DEFAULT_QUICK_THRESHOLD_MS: u64 = 10_000;
pub const DEFAULT_MAX_BACKLOG: usize = 5;
pub const DEFAULT_ENDPOINT: &str = "http://localhost:8080";

/// How a finalized session reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Events are shipped as JSON arrays to the ingest endpoint.
    RawEvents,
    /// Each finalized session is reduced to one summary row.
    SessionSummary,
}

impl FromStr for DeliveryMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" | "raw_events" | "events" => Ok(DeliveryMode::RawEvents),
            "summary" | "session_summary" => Ok(DeliveryMode::SessionSummary),
            other => Err(ConfigError::InvalidValue {
                key: "PULSE_MODE".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Maximum number of pending events held for the live session.
    pub capacity: usize,
    /// Oldest entries dropped in one step when the queue is full.
    pub evict_batch: usize,
    /// Queue length that triggers a flush while on WIFI.
    pub size_threshold: usize,
    /// Paired durations below this count as "quick".
    pub quick_threshold: Duration,
    /// Retired/recovered sessions kept while awaiting acknowledgment.
    pub max_backlog: usize,
    pub mode: DeliveryMode,
    pub endpoint: String,
    pub ingest_path: String,
    pub summary_path: String,
    pub request_timeout: Option<Duration>,
    pub key_prefix: String,
    pub device: DeviceInfo,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            evict_batch: DEFAULT_EVICT_BATCH,
            size_threshold: DEFAULT_SIZE_THRESHOLD,
            quick_threshold: Duration::from_millis(DEFAULT_QUICK_THRESHOLD_MS),
            max_backlog: DEFAULT_MAX_BACKLOG,
            mode: DeliveryMode::RawEvents,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            ingest_path: "/telemetry/ingest".to_string(),
            summary_path: "/telemetry/summary".to_string(),
            request_timeout: None,
            key_prefix: "pulse.".to_string(),
            device: DeviceInfo::default(),
        }
    }
}

impl TelemetryConfig {
    /// Reads `PULSE_*` overrides on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("PULSE_ENDPOINT") {
            config.endpoint = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = lookup("PULSE_CAPACITY") {
            config.capacity = parse_number("PULSE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("PULSE_EVICT_BATCH") {
            config.evict_batch = parse_number("PULSE_EVICT_BATCH", &v)?;
        }
        if let Some(v) = lookup("PULSE_SIZE_THRESHOLD") {
            config.size_threshold = parse_number("PULSE_SIZE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("PULSE_QUICK_THRESHOLD_MS") {
            config.quick_threshold = Duration::from_millis(parse_number("PULSE_QUICK_THRESHOLD_MS", &v)?);
        }
        if let Some(v) = lookup("PULSE_MAX_BACKLOG") {
            config.max_backlog = parse_number("PULSE_MAX_BACKLOG", &v)?;
        }
        if let Some(v) = lookup("PULSE_MODE") {
            config.mode = v.parse()?;
        }
        if let Some(v) = lookup("PULSE_KEY_PREFIX") {
            config.key_prefix = v;
        }
        if let Some(v) = lookup("PULSE_TIMEOUT_MS") {
            config.request_timeout = Some(Duration::from_millis(parse_number("PULSE_TIMEOUT_MS", &v)?));
        }
        if let Some(v) = lookup("PULSE_APP_VERSION") {
            config.device.app_version = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Constraint("capacity must be at least 1".to_string()));
        }
        if self.evict_batch == 0 || self.evict_batch > self.capacity {
            return Err(ConfigError::Constraint(format!(
                "evict_batch must be within 1..={} (got {})",
                self.capacity, self.evict_batch
            )));
        }
        if self.size_threshold == 0 {
            return Err(ConfigError::Constraint("size_threshold must be at least 1".to_string()));
        }
        if self.endpoint.is_empty() {
            return Err(ConfigError::Constraint("endpoint must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn ingest_url(&self) -> String {
        format!("{}{}", self.endpoint, self.ingest_path)
    }

    pub fn summary_url(&self) -> String {
        format!("{}{}", self.endpoint, self.summary_path)
    }

    pub fn envelope_key(&self) -> String {
        format!("{}session", self.key_prefix)
    }

    pub fn last_session_key(&self) -> String {
        format!("{}last_session_id", self.key_prefix)
    }

    pub fn backlog_key(&self) -> String {
        format!("{}backlog", self.key_prefix)
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
