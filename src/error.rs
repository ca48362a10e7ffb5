use thiserror::Error;

/// Failures of the durable key-value collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("envelope serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Failures of a single delivery attempt. Never surfaced to producers.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("ingestion endpoint rejected batch with status {status}")]
    Rejected { status: u16 },

    #[error("delivery failed: {0}")]
    Other(String),
}

/// A single sensor read that could not be completed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SensorError {
    #[error("sensor unavailable: {0}")]
    Unavailable(String),

    #[error("sensor returned an invalid reading: {0}")]
    InvalidReading(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("{0}")]
    Constraint(String),

    #[error("telemetry must be started inside a tokio runtime: {0}")]
    NoRuntime(String),
}
