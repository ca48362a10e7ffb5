use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::aggregator::BehavioralAggregator;
use super::context::{AppState, NetworkType};
use super::event::{EventId, Priority, SessionEnvelope};
use super::session::SessionLifecycleManager;
use super::transport::{AuthProvider, EventTransport};
use crate::config::DeliveryMode;
use crate::error::DeliveryError;

/// Why a flush was requested. Carried into logs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Critical,
    WifiThreshold,
    Lifecycle(AppState),
    Recovery,
    SessionClosed,
    Manual,
}

/// Flush policy evaluated after every append.
///
/// Critical events bypass everything; otherwise only a WIFI connection with
/// a full enough queue qualifies. Lifecycle triggers are raised separately.
pub fn evaluate_policy(
    priority: Priority,
    network: NetworkType,
    queue_len: usize,
    size_threshold: usize,
    mode: DeliveryMode,
) -> Option<FlushTrigger> {
    if priority == Priority::Critical {
        return Some(FlushTrigger::Critical);
    }
    // Summary mode never forwards the live queue, so size is irrelevant.
    if mode == DeliveryMode::RawEvents && network == NetworkType::Wifi && queue_len >= size_threshold {
        return Some(FlushTrigger::WifiThreshold);
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Delivered { events: usize, summaries: usize },
    /// Nothing was pending.
    Empty,
    /// No bearer token; nothing was touched.
    NoAuth,
    /// Another flush was running; this request did nothing.
    AlreadyInFlight,
    /// The queue is unchanged except for sessions acknowledged before the failure.
    Failed { reason: String },
}

/// Clears the in-flight flag however the flush ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DeliveryController {
    transport: Arc<dyn EventTransport>,
    auth: Arc<dyn AuthProvider>,
    aggregator: BehavioralAggregator,
    mode: DeliveryMode,
    in_flight: AtomicBool,
}

impl DeliveryController {
    pub fn new(
        transport: Arc<dyn EventTransport>,
        auth: Arc<dyn AuthProvider>,
        aggregator: BehavioralAggregator,
        mode: DeliveryMode,
    ) -> Self {
        Self {
            transport,
            auth,
            aggregator,
            mode,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// One delivery round: backlog sessions first (oldest first, one request
    /// each), then the live batch in raw mode.
    ///
    /// The live batch is a copy; on success exactly those event ids are
    /// removed, so events appended during the request survive.
    pub async fn flush(&self, sessions: &SessionLifecycleManager, trigger: FlushTrigger) -> FlushOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(?trigger, "flush already in flight, ignoring request");
            return FlushOutcome::AlreadyInFlight;
        }
        let _guard = InFlightGuard(&self.in_flight);

        let Some(token) = self.auth.bearer_token().await else {
            debug!(?trigger, "no auth token, flush aborted");
            return FlushOutcome::NoAuth;
        };

        let mut delivered_events = 0;
        let mut delivered_summaries = 0;

        while let Some(envelope) = sessions.next_backlog() {
            match self.deliver_envelope(&token, &envelope).await {
                Ok((events, summaries)) => {
                    sessions.ack_backlog(&envelope.session_id);
                    delivered_events += events;
                    delivered_summaries += summaries;
                }
                Err(e) => {
                    warn!(?trigger, session_id = %envelope.session_id, error = %e, "backlog delivery failed");
                    return FlushOutcome::Failed { reason: e.to_string() };
                }
            }
        }

        if self.mode == DeliveryMode::RawEvents {
            let (session_id, batch) = sessions.snapshot_live();
            if !batch.is_empty() {
                match self.transport.send_batch(&token, &batch).await {
                    Ok(()) => {
                        let ids: HashSet<EventId> = batch.iter().map(|e| e.event_id).collect();
                        let removed = sessions.remove_delivered(&session_id, &ids);
                        debug!(session_id = %session_id, batch = batch.len(), removed, "live batch acknowledged");
                        delivered_events += batch.len();
                    }
                    Err(e) => {
                        warn!(?trigger, session_id = %session_id, batch = batch.len(), error = %e, "telemetry flush failed, queue retained");
                        return FlushOutcome::Failed { reason: e.to_string() };
                    }
                }
            }
        }

        if delivered_events == 0 && delivered_summaries == 0 {
            return FlushOutcome::Empty;
        }

        info!(?trigger, events = delivered_events, summaries = delivered_summaries, "telemetry flushed");
        FlushOutcome::Delivered { events: delivered_events, summaries: delivered_summaries }
    }

    /// Ships one retired session: raw events in a single batch, or one
    /// summary row in summary mode.
    async fn deliver_envelope(&self, token: &str, envelope: &SessionEnvelope) -> Result<(usize, usize), DeliveryError> {
        match self.mode {
            DeliveryMode::RawEvents => {
                self.transport.send_batch(token, &envelope.events).await?;
                Ok((envelope.events.len(), 0))
            }
            DeliveryMode::SessionSummary => match self.aggregator.summarize(envelope) {
                Some(summary) => {
                    self.transport.send_summary(token, &summary).await?;
                    Ok((0, 1))
                }
                None => Ok((0, 0)),
            },
        }
    }
}
