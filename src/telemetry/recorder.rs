use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::aggregator::{AggregationRules, BehavioralAggregator};
use super::clock::{Clock, SystemClock};
use super::context::{AppState, ContextSnapshotProvider, DeviceSensors, StaticSensors};
use super::delivery::{evaluate_policy, DeliveryController, FlushOutcome, FlushTrigger};
use super::event::{Event, EventId, Priority, Session, SessionId};
use super::session::{LifecycleAction, SessionLifecycleManager};
use super::storage::KeyValueStore;
use super::transport::{AuthProvider, EventTransport};
use crate::config::TelemetryConfig;
use crate::error::ConfigError;

/// Everything the pipeline talks to outside the process.
pub struct Collaborators {
    pub store: Arc<dyn KeyValueStore>,
    pub transport: Arc<dyn EventTransport>,
    pub auth: Arc<dyn AuthProvider>,
    pub sensors: Arc<dyn DeviceSensors>,
    pub clock: Arc<dyn Clock>,
    pub rules: AggregationRules,
}

impl Collaborators {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn EventTransport>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            store,
            transport,
            auth,
            sensors: Arc::new(StaticSensors::default()),
            clock: Arc::new(SystemClock),
            rules: AggregationRules::default(),
        }
    }

    pub fn with_sensors(mut self, sensors: Arc<dyn DeviceSensors>) -> Self {
        self.sensors = sensors;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_rules(mut self, rules: AggregationRules) -> Self {
        self.rules = rules;
        self
    }
}

/// Result of a single `record` call. `log_event` throws this away.
#[derive(Debug)]
pub enum RecordOutcome {
    /// No user id; nothing happened.
    Dropped,
    Queued {
        event_id: EventId,
        evicted: usize,
        persisted: JoinHandle<()>,
        flush: Option<JoinHandle<FlushOutcome>>,
    },
}

struct Inner {
    config: TelemetryConfig,
    context: ContextSnapshotProvider,
    sessions: SessionLifecycleManager,
    delivery: DeliveryController,
    clock: Arc<dyn Clock>,
    recovery: Mutex<Option<JoinHandle<FlushOutcome>>>,
}

/// The single entry point producers log through.
///
/// Construct once with [`EventRecorder::start`] and clone it into every
/// producer; clones share one queue, one session and one in-flight flag.
#[derive(Clone)]
pub struct EventRecorder {
    inner: Arc<Inner>,
}

impl EventRecorder {
    /// Recovers any unflushed data from a previous run, schedules its
    /// delivery, then opens a fresh session.
    ///
    /// Must be awaited on a tokio runtime. That runtime runs every later
    /// persistence and flush task, whichever thread the producer is on.
    pub async fn start(config: TelemetryConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| ConfigError::NoRuntime(e.to_string()))?;

        let (sessions, recovered) =
            SessionLifecycleManager::initialize(&config, collaborators.store, collaborators.clock.clone(), runtime)
                .await;

        let aggregator = BehavioralAggregator::new(collaborators.rules, config.quick_threshold);
        let delivery = DeliveryController::new(collaborators.transport, collaborators.auth, aggregator, config.mode);

        let recorder = Self {
            inner: Arc::new(Inner {
                context: ContextSnapshotProvider::new(collaborators.sensors),
                sessions,
                delivery,
                clock: collaborators.clock,
                recovery: Mutex::new(None),
                config,
            }),
        };

        if recovered {
            let handle = recorder.spawn_flush(FlushTrigger::Recovery);
            *recorder.inner.recovery.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }

        Ok(recorder)
    }

    /// Fire-and-forget producer API. Anonymous events are dropped.
    pub fn log_event(&self, event_name: &str, user_id: Option<&str>, payload: Value, priority: Priority) {
        let _ = self.record(event_name, user_id, payload, priority);
    }

    /// Same as [`log_event`](Self::log_event), returning the detached tasks.
    pub fn record(&self, event_name: &str, user_id: Option<&str>, payload: Value, priority: Priority) -> RecordOutcome {
        let Some(user_id) = user_id.filter(|u| !u.is_empty()) else {
            debug!(event_name, "dropping anonymous telemetry event");
            return RecordOutcome::Dropped;
        };

        let inner = &self.inner;
        let context = inner.context.snapshot();
        let timestamp = inner.clock.now();
        let (event_id, evicted, queue_len) = inner.sessions.append_with(|session| Event {
            event_id: EventId::new(),
            event_name: event_name.to_string(),
            user_id: user_id.to_string(),
            session_id: session.session_id.clone(),
            timestamp,
            device_info: inner.config.device.clone(),
            context,
            payload,
            priority,
        });
        let persisted = inner.sessions.persist();

        let flush = evaluate_policy(
            priority,
            context.network_type,
            queue_len,
            inner.config.size_threshold,
            inner.delivery.mode(),
        )
        .map(|trigger| self.spawn_flush(trigger));

        RecordOutcome::Queued { event_id, evicted, persisted, flush }
    }

    /// Feeds an app lifecycle transition. Leaving the foreground flushes
    /// without blocking the transition.
    pub fn on_app_state_change(&self, state: AppState) -> Option<JoinHandle<FlushOutcome>> {
        match self.inner.sessions.on_app_state_change(state, self.inner.delivery.mode()) {
            LifecycleAction::Flush => Some(self.spawn_flush(FlushTrigger::Lifecycle(state))),
            LifecycleAction::Ignore => None,
        }
    }

    /// Finalizes the current session and starts a new, empty one.
    pub fn close_session(&self) -> JoinHandle<FlushOutcome> {
        let (new_session_id, _) = self.inner.sessions.start_new_session();
        debug!(new_session_id = %new_session_id, "session closed on request");
        self.spawn_flush(FlushTrigger::SessionClosed)
    }

    /// Detached flush; the outcome is only logged unless the handle is awaited.
    pub fn flush(&self) -> JoinHandle<FlushOutcome> {
        self.spawn_flush(FlushTrigger::Manual)
    }

    /// Waits for the startup recovery flush, if one was scheduled.
    pub async fn recovery_finished(&self) -> Option<FlushOutcome> {
        let handle = self.inner.recovery.lock().unwrap_or_else(|e| e.into_inner()).take()?;
        match handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(error = %e, "recovery flush task failed");
                None
            }
        }
    }

    /// Final best-effort delivery before the host exits. The live envelope
    /// stays persisted if this fails, so the next start recovers it.
    pub async fn shutdown(&self) -> FlushOutcome {
        let _ = self.recovery_finished().await;
        let outcome = self.inner.delivery.flush(&self.inner.sessions, FlushTrigger::Manual).await;
        if let Err(e) = self.inner.sessions.persist().await {
            warn!(error = %e, "final persistence task failed");
        }
        outcome
    }

    pub fn session(&self) -> Session {
        self.inner.sessions.current_session()
    }

    pub fn session_id(&self) -> SessionId {
        self.session().session_id
    }

    pub fn pending_events(&self) -> Vec<Event> {
        self.inner.sessions.snapshot_live().1
    }

    pub fn backlog_len(&self) -> usize {
        self.inner.sessions.backlog_len()
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.delivery.is_in_flight()
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.inner.config
    }

    fn spawn_flush(&self, trigger: FlushTrigger) -> JoinHandle<FlushOutcome> {
        let inner = self.inner.clone();
        self.inner
            .sessions
            .runtime()
            .spawn(async move { inner.delivery.flush(&inner.sessions, trigger).await })
    }
}
