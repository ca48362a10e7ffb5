use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::context::AppState;
use super::event::{Event, EventId, Session, SessionEnvelope, SessionId};
use super::queue::{DurableEventQueue, EnvelopeSnapshot};
use super::storage::{DurableSlot, KeyValueStore};
use crate::config::{DeliveryMode, TelemetryConfig};

/// What the host should do after a lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Ignore,
    Flush,
}

/// Retired or recovered sessions waiting for acknowledgment, oldest first.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backlog {
    sessions: VecDeque<SessionEnvelope>,
    #[serde(skip)]
    generation: u64,
}

impl Backlog {
    /// Queues a session, dropping the oldest when over `max`.
    fn push(&mut self, envelope: SessionEnvelope, max: usize) {
        if envelope.is_empty() {
            return;
        }
        self.sessions.push_back(envelope);
        while self.sessions.len() > max.max(1) {
            if let Some(dropped) = self.sessions.pop_front() {
                warn!(
                    session_id = %dropped.session_id,
                    events = dropped.events.len(),
                    "telemetry backlog full, dropped oldest session"
                );
            }
        }
    }

    fn front(&self) -> Option<&SessionEnvelope> {
        self.sessions.front()
    }

    fn ack(&mut self, session_id: &SessionId) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|s| &s.session_id != session_id);
        before != self.sessions.len()
    }

    /// Drops acknowledged events from a retired session, and the session
    /// itself once it is empty.
    fn remove_events(&mut self, session_id: &SessionId, delivered: &HashSet<EventId>) -> usize {
        let mut removed = 0;
        for envelope in self.sessions.iter_mut().filter(|s| &s.session_id == session_id) {
            let before = envelope.events.len();
            envelope.events.retain(|e| !delivered.contains(&e.event_id));
            removed += before - envelope.events.len();
        }
        self.sessions.retain(|s| !s.is_empty());
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn snapshot(&mut self) -> Backlog {
        self.generation += 1;
        self.clone()
    }
}

/// One step of a persistence request.
enum WriteOp {
    Backlog(Backlog),
    Envelope(EnvelopeSnapshot),
    LastSession(String),
}

struct WriteRequest {
    ops: Vec<WriteOp>,
    done: oneshot::Sender<()>,
}

/// Applies persistence requests one at a time, in submission order.
///
/// The envelope key is only overwritten while the latest backlog is on
/// disk. Until then the previous envelope stays behind as the recovery copy
/// of whatever was retired.
struct PersistenceWriter {
    envelope_slot: DurableSlot,
    backlog_slot: DurableSlot,
    store: Arc<dyn KeyValueStore>,
    last_session_key: String,
    unsaved_backlog: Option<Backlog>,
}

impl PersistenceWriter {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<WriteRequest>) {
        while let Some(request) = requests.recv().await {
            for op in request.ops {
                self.apply(op).await;
            }
            let _ = request.done.send(());
        }
        debug!("telemetry persistence writer stopped");
    }

    async fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::Backlog(doc) => {
                let newer = self.unsaved_backlog.as_ref().map_or(true, |b| b.generation < doc.generation);
                if newer {
                    self.unsaved_backlog = Some(doc);
                }
                self.save_backlog().await;
            }
            WriteOp::Envelope(snapshot) => {
                if !self.save_backlog().await {
                    warn!(
                        session_id = %snapshot.envelope.session_id,
                        "backlog not on disk yet, keeping previous envelope"
                    );
                    return;
                }
                match self.envelope_slot.write(snapshot.generation, &snapshot.envelope).await {
                    Ok(true) => {}
                    Ok(false) => debug!(generation = snapshot.generation, "skipped superseded envelope write"),
                    Err(e) => warn!(error = %e, "failed to persist telemetry envelope"),
                }
            }
            WriteOp::LastSession(id) => {
                if let Err(e) = self.store.set(&self.last_session_key, id).await {
                    warn!(error = %e, "failed to record last session id");
                }
            }
        }
    }

    /// Retries the pending backlog, if any. True once nothing is pending.
    async fn save_backlog(&mut self) -> bool {
        let Some(doc) = self.unsaved_backlog.take() else {
            return true;
        };
        match self.backlog_slot.write(doc.generation, &doc).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, sessions = doc.len(), "failed to persist telemetry backlog");
                self.unsaved_backlog = Some(doc);
                false
            }
        }
    }
}

/// Owns the current session, its live queue and the backlog of sessions that
/// still need delivering. The only place a session id changes.
///
/// Every detached task goes through the runtime handle captured at startup,
/// so producers may call in from threads outside the runtime.
pub struct SessionLifecycleManager {
    queue: Mutex<DurableEventQueue>,
    backlog: Mutex<Backlog>,
    writer: mpsc::UnboundedSender<WriteRequest>,
    runtime: Handle,
    max_backlog: usize,
    clock: Arc<dyn Clock>,
}

impl SessionLifecycleManager {
    /// Cold start: recover whatever the previous run left behind into the
    /// backlog, then begin a fresh, empty session.
    ///
    /// Returns the manager and whether anything was recovered.
    pub async fn initialize(
        config: &TelemetryConfig,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        runtime: Handle,
    ) -> (Self, bool) {
        let envelope_slot = DurableSlot::new(store.clone(), config.envelope_key());
        let backlog_slot = DurableSlot::new(store.clone(), config.backlog_key());

        let mut backlog = match backlog_slot.read::<Backlog>().await {
            Ok(found) => found.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "failed to load telemetry backlog");
                Backlog::default()
            }
        };

        let orphan = match envelope_slot.read::<SessionEnvelope>().await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "failed to load persisted session envelope");
                None
            }
        };

        match store.get(&config.last_session_key()).await {
            Ok(Some(last)) => debug!(last_session_id = %last, "previous session id found"),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "failed to read last session id"),
        }

        let mut pushed_orphan = false;
        if let Some(envelope) = orphan {
            if !envelope.is_empty() {
                info!(
                    session_id = %envelope.session_id,
                    events = envelope.events.len(),
                    "recovered unflushed session from previous run"
                );
                backlog.push(envelope, config.max_backlog);
                pushed_orphan = true;
            }
        }
        let recovered = !backlog.is_empty();

        let (writer, requests) = mpsc::unbounded_channel();
        runtime.spawn(
            PersistenceWriter {
                envelope_slot,
                backlog_slot,
                store,
                last_session_key: config.last_session_key(),
                unsaved_backlog: None,
            }
            .run(requests),
        );

        let placeholder = Session::begin(clock.now());
        let manager = Self {
            queue: Mutex::new(DurableEventQueue::new(placeholder, config.capacity, config.evict_batch)),
            backlog: Mutex::new(backlog),
            writer,
            runtime,
            max_backlog: config.max_backlog,
            clock,
        };

        if pushed_orphan {
            if let Err(e) = manager.persist_backlog().await {
                warn!(error = %e, "backlog persistence task failed");
            }
        }
        let (_, persisted) = manager.start_new_session();
        if let Err(e) = persisted.await {
            warn!(error = %e, "initial session persistence task failed");
        }

        (manager, recovered)
    }

    /// Begins a new session with an empty queue. A non-empty previous session
    /// is retired into the backlog rather than dropped. The handle resolves
    /// once the rotation has been through the writer.
    pub fn start_new_session(&self) -> (SessionId, JoinHandle<()>) {
        let session = Session::begin(self.clock.now());
        let session_id = session.session_id.clone();

        let written = {
            let mut queue = lock(&self.queue);
            let retired = queue.reset(session);
            let mut backlog = lock(&self.backlog);

            let mut ops = Vec::with_capacity(3);
            if !retired.is_empty() {
                debug!(session_id = %retired.session_id, events = retired.events.len(), "retiring session");
                backlog.push(retired, self.max_backlog);
                ops.push(WriteOp::Backlog(backlog.snapshot()));
            }
            ops.push(WriteOp::Envelope(queue.envelope()));
            ops.push(WriteOp::LastSession(session_id.to_string()));
            self.enqueue(ops)
        };

        info!(session_id = %session_id, "telemetry session started");
        (session_id, self.completion(written))
    }

    /// Maps a lifecycle transition to a delivery action. In summary mode
    /// backgrounding also finalizes the session; inactive only flushes.
    pub fn on_app_state_change(&self, state: AppState, mode: DeliveryMode) -> LifecycleAction {
        if !state.is_leaving_foreground() {
            return LifecycleAction::Ignore;
        }
        if mode == DeliveryMode::SessionSummary && state == AppState::Background {
            self.start_new_session();
        }
        LifecycleAction::Flush
    }

    /// Builds and appends an event under the queue lock, so it is stamped
    /// with the session it actually lands in. Returns
    /// `(event_id, evicted, queue_len)`.
    pub fn append_with<F>(&self, build: F) -> (EventId, usize, usize)
    where
        F: FnOnce(&Session) -> Event,
    {
        let mut queue = lock(&self.queue);
        let event = build(queue.session());
        let event_id = event.event_id;
        let evicted = queue.append(event);
        (event_id, evicted, queue.len())
    }

    /// Queues a write of the live envelope. Failures are logged only; the
    /// next write carries the full queue again.
    pub fn persist(&self) -> JoinHandle<()> {
        let written = {
            let mut queue = lock(&self.queue);
            self.enqueue(vec![WriteOp::Envelope(queue.envelope())])
        };
        self.completion(written)
    }

    fn persist_backlog(&self) -> JoinHandle<()> {
        let written = {
            let mut backlog = lock(&self.backlog);
            self.enqueue(vec![WriteOp::Backlog(backlog.snapshot())])
        };
        self.completion(written)
    }

    /// Hands a request to the writer. Callers hold the lock the snapshot was
    /// taken under, so requests reach the writer in generation order.
    fn enqueue(&self, ops: Vec<WriteOp>) -> oneshot::Receiver<()> {
        let (done, written) = oneshot::channel();
        if self.writer.send(WriteRequest { ops, done }).is_err() {
            warn!("telemetry persistence writer stopped, write dropped");
        }
        written
    }

    fn completion(&self, written: oneshot::Receiver<()>) -> JoinHandle<()> {
        self.runtime.spawn(async move {
            let _ = written.await;
        })
    }

    /// The runtime every detached telemetry task is spawned on.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn current_session(&self) -> Session {
        lock(&self.queue).session().clone()
    }

    /// Copy of the live batch together with the session it belongs to.
    pub fn snapshot_live(&self) -> (SessionId, Vec<Event>) {
        let queue = lock(&self.queue);
        (queue.session().session_id.clone(), queue.snapshot())
    }

    /// Drops acknowledged events by identity and persists the remainder.
    ///
    /// If the session was retired while its batch was in flight, the events
    /// are removed from its backlog entry instead.
    pub fn remove_delivered(&self, session_id: &SessionId, delivered: &HashSet<EventId>) -> usize {
        let live = {
            let mut queue = lock(&self.queue);
            if &queue.session().session_id == session_id {
                Some(queue.remove_delivered(delivered))
            } else {
                None
            }
        };
        match live {
            Some(removed) => {
                self.persist();
                removed
            }
            None => {
                let removed = lock(&self.backlog).remove_events(session_id, delivered);
                if removed > 0 {
                    self.persist_backlog();
                }
                removed
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn next_backlog(&self) -> Option<SessionEnvelope> {
        lock(&self.backlog).front().cloned()
    }

    pub fn ack_backlog(&self, session_id: &SessionId) {
        if lock(&self.backlog).ack(session_id) {
            self.persist_backlog();
        }
    }

    pub fn backlog_len(&self) -> usize {
        lock(&self.backlog).len()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
