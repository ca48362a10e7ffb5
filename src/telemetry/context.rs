use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SensorError;

pub const UNKNOWN_BATTERY: f32 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkType {
    Wifi,
    Cellular,
    Ethernet,
    None,
    Unknown,
}

/// Foreground/background state as reported by the host lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppState {
    Active,
    Inactive,
    Background,
    Unknown,
}

impl AppState {
    /// True for the transitions that trigger an opportunistic flush.
    pub fn is_leaving_foreground(self) -> bool {
        matches!(self, AppState::Inactive | AppState::Background)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub network_type: NetworkType,
    /// 0.0..=1.0, or -1.0 when unreadable.
    pub battery_level: f32,
    pub is_charging: bool,
    pub app_state: AppState,
}

impl Default for ContextSnapshot {
    fn default() -> Self {
        Self {
            network_type: NetworkType::Unknown,
            battery_level: UNKNOWN_BATTERY,
            is_charging: false,
            app_state: AppState::Unknown,
        }
    }
}

/// Raw device signal reads. Each read may fail independently.
pub trait DeviceSensors: Send + Sync {
    fn network_type(&self) -> Result<NetworkType, SensorError>;
    fn battery_level(&self) -> Result<f32, SensorError>;
    fn is_charging(&self) -> Result<bool, SensorError>;
    fn app_state(&self) -> Result<AppState, SensorError>;
}

/// Sensors with fixed readings, for hosts that cannot query the device.
#[derive(Debug, Clone, Copy)]
pub struct StaticSensors {
    pub network: NetworkType,
    pub battery: f32,
    pub charging: bool,
    pub app_state: AppState,
}

impl Default for StaticSensors {
    fn default() -> Self {
        Self {
            network: NetworkType::Unknown,
            battery: UNKNOWN_BATTERY,
            charging: false,
            app_state: AppState::Active,
        }
    }
}

impl DeviceSensors for StaticSensors {
    fn network_type(&self) -> Result<NetworkType, SensorError> {
        Ok(self.network)
    }

    fn battery_level(&self) -> Result<f32, SensorError> {
        Ok(self.battery)
    }

    fn is_charging(&self) -> Result<bool, SensorError> {
        Ok(self.charging)
    }

    fn app_state(&self) -> Result<AppState, SensorError> {
        Ok(self.app_state)
    }
}

/// Assembles a [`ContextSnapshot`] and never fails.
///
/// Every read is collapsed to its default here and nowhere else, so a broken
/// sensor can't stall or crash the host.
#[derive(Clone)]
pub struct ContextSnapshotProvider {
    sensors: Arc<dyn DeviceSensors>,
}

impl ContextSnapshotProvider {
    pub fn new(sensors: Arc<dyn DeviceSensors>) -> Self {
        Self { sensors }
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let fallback = ContextSnapshot::default();

        let network_type = self.sensors.network_type().unwrap_or_else(|e| {
            debug!(error = %e, "network read failed");
            fallback.network_type
        });

        let battery_level = self
            .sensors
            .battery_level()
            .and_then(validate_battery)
            .unwrap_or_else(|e| {
                debug!(error = %e, "battery read failed");
                fallback.battery_level
            });

        let is_charging = self.sensors.is_charging().unwrap_or_else(|e| {
            debug!(error = %e, "charging read failed");
            fallback.is_charging
        });

        let app_state = self.sensors.app_state().unwrap_or_else(|e| {
            debug!(error = %e, "app state read failed");
            fallback.app_state
        });

        ContextSnapshot {
            network_type,
            battery_level,
            is_charging,
            app_state,
        }
    }
}

fn validate_battery(level: f32) -> Result<f32, SensorError> {
    if level.is_finite() && (0.0..=1.0).contains(&level) {
        Ok(level)
    } else {
        Err(SensorError::InvalidReading(format!("battery level {level}")))
    }
}
