//! Shared mock collaborators for pulse integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pulse::error::{DeliveryError, SensorError, StorageError};
use pulse::telemetry::clock::ManualClock;
use pulse::telemetry::context::{AppState, DeviceSensors, NetworkType, StaticSensors};
use pulse::telemetry::storage::{KeyValueStore, MemoryStore};
use pulse::telemetry::transport::{EventTransport, StaticAuth};
use pulse::telemetry::{BehavioralSummary, Collaborators, Event, EventRecorder};
use pulse::TelemetryConfig;
use tokio::sync::Notify;

pub const TOKEN: &str = "test-token";

#[derive(Debug, Clone)]
pub enum Call {
    Batch { token: String, events: Vec<Event> },
    Summary { token: String, summary: BehavioralSummary },
}

/// Transport that records every request. Can be told to fail, or to park
/// inside a request until released.
#[derive(Default)]
pub struct RecordingTransport {
    pub calls: Mutex<Vec<Call>>,
    fail: AtomicBool,
    gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Next requests signal `entered` and wait for `release`.
    pub fn gate(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some((entered.clone(), release.clone()));
        (entered, release)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn batches(&self) -> Vec<Vec<Event>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Batch { events, .. } => Some(events),
                Call::Summary { .. } => None,
            })
            .collect()
    }

    pub fn summaries(&self) -> Vec<BehavioralSummary> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Summary { summary, .. } => Some(summary),
                Call::Batch { .. } => None,
            })
            .collect()
    }

    async fn pass_gate(&self) {
        let gate = self.gate.lock().unwrap().clone();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
    }

    fn outcome(&self) -> Result<(), DeliveryError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(DeliveryError::Rejected { status: 503 })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EventTransport for RecordingTransport {
    async fn send_batch(&self, token: &str, events: &[Event]) -> Result<(), DeliveryError> {
        self.pass_gate().await;
        self.calls.lock().unwrap().push(Call::Batch { token: token.to_string(), events: events.to_vec() });
        self.outcome()
    }

    async fn send_summary(&self, token: &str, summary: &BehavioralSummary) -> Result<(), DeliveryError> {
        self.pass_gate().await;
        self.calls.lock().unwrap().push(Call::Summary { token: token.to_string(), summary: summary.clone() });
        self.outcome()
    }
}

/// Every read fails.
pub struct BrokenSensors;

impl DeviceSensors for BrokenSensors {
    fn network_type(&self) -> Result<NetworkType, SensorError> {
        Err(SensorError::Unavailable("no connectivity manager".to_string()))
    }

    fn battery_level(&self) -> Result<f32, SensorError> {
        Err(SensorError::Unavailable("no battery service".to_string()))
    }

    fn is_charging(&self) -> Result<bool, SensorError> {
        Err(SensorError::Unavailable("no battery service".to_string()))
    }

    fn app_state(&self) -> Result<AppState, SensorError> {
        Err(SensorError::Unavailable("lifecycle not attached".to_string()))
    }
}

/// Store whose writes can be switched off.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_writes: AtomicBool,
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("disk full".to_string()));
        }
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.inner.remove(key).await
    }
}

/// Store whose backlog writes can be held back or failed. Everything else
/// passes straight through to `inner`, which doubles as the on-disk state a
/// crashed process leaves behind.
#[derive(Default)]
pub struct BacklogGate {
    pub inner: Arc<MemoryStore>,
    pub hold: AtomicBool,
    pub fail: AtomicBool,
    pub release: Notify,
}

#[async_trait]
impl KeyValueStore for BacklogGate {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        if key.ends_with("backlog") {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("backlog volume offline".to_string()));
            }
            if self.hold.load(Ordering::SeqCst) {
                self.release.notified().await;
            }
        }
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.inner.remove(key).await
    }
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

pub fn sensors(network: NetworkType) -> StaticSensors {
    StaticSensors { network, battery: 0.8, charging: false, app_state: AppState::Active }
}

pub struct Harness {
    pub recorder: EventRecorder,
    pub transport: Arc<RecordingTransport>,
    pub store: Arc<MemoryStore>,
    pub auth: Arc<StaticAuth>,
    pub clock: Arc<ManualClock>,
}

pub async fn harness(config: TelemetryConfig, network: NetworkType) -> Harness {
    harness_with_store(config, network, Arc::new(MemoryStore::new())).await
}

pub async fn harness_with_store(config: TelemetryConfig, network: NetworkType, store: Arc<MemoryStore>) -> Harness {
    let transport = RecordingTransport::new();
    let auth = Arc::new(StaticAuth::new(Some(TOKEN.to_string())));
    let clock = Arc::new(ManualClock::new(epoch()));

    let collaborators = Collaborators::new(store.clone(), transport.clone(), auth.clone())
        .with_sensors(Arc::new(sensors(network)))
        .with_clock(clock.clone());

    let recorder = EventRecorder::start(config, collaborators).await.unwrap();
    Harness { recorder, transport, store, auth, clock }
}
