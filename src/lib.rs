pub mod config;
pub mod error;
pub mod telemetry;

// Convenience re-exports
pub use config::{DeliveryMode, TelemetryConfig};
pub use telemetry::recorder::EventRecorder;
