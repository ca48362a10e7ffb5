use std::collections::{HashSet, VecDeque};

use tracing::warn;

use super::event::{Event, EventId, Session, SessionEnvelope};

/// A persistence request captured under the queue lock.
#[derive(Debug, Clone)]
pub struct EnvelopeSnapshot {
    pub generation: u64,
    pub envelope: SessionEnvelope,
}

/// Bounded FIFO of pending events for the live session.
///
/// Overflow evicts a whole batch of the oldest entries at once; it never
/// rejects an append.
#[derive(Debug)]
pub struct DurableEventQueue {
    session: Session,
    buffer: VecDeque<Event>,
    capacity: usize,
    evict_batch: usize,
    generation: u64,
}

impl DurableEventQueue {
    pub fn new(session: Session, capacity: usize, evict_batch: usize) -> Self {
        Self {
            session,
            buffer: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            evict_batch: evict_batch.max(1),
            generation: 0,
        }
    }

    /// Appends in call order. Returns how many old events were evicted.
    pub fn append(&mut self, event: Event) -> usize {
        let mut evicted = 0;
        if self.buffer.len() >= self.capacity {
            evicted = self.evict_batch.min(self.buffer.len());
            self.buffer.drain(..evicted);
            warn!(
                session_id = %self.session.session_id,
                evicted,
                capacity = self.capacity,
                "telemetry buffer full, dropped oldest events"
            );
        }
        self.buffer.push_back(event);
        evicted
    }

    /// Copy of the pending events, oldest first.
    pub fn snapshot(&self) -> Vec<Event> {
        self.buffer.iter().cloned().collect()
    }

    /// Removes exactly the acknowledged events, keeping the rest in order.
    pub fn remove_delivered(&mut self, delivered: &HashSet<EventId>) -> usize {
        let before = self.buffer.len();
        self.buffer.retain(|e| !delivered.contains(&e.event_id));
        before - self.buffer.len()
    }

    /// Swaps in a fresh session and empties the buffer. The retired session
    /// ends where the new one starts; its envelope is returned.
    pub fn reset(&mut self, session: Session) -> SessionEnvelope {
        self.session.end_time = Some(session.start_time);
        let retired = SessionEnvelope {
            session_id: self.session.session_id.clone(),
            start_time: self.session.start_time,
            end_time: self.session.end_time,
            events: self.buffer.drain(..).collect(),
        };
        self.session = session;
        retired
    }

    /// Captures the current envelope with the next persistence generation.
    pub fn envelope(&mut self) -> EnvelopeSnapshot {
        self.generation += 1;
        EnvelopeSnapshot {
            generation: self.generation,
            envelope: SessionEnvelope {
                session_id: self.session.session_id.clone(),
                start_time: self.session.start_time,
                end_time: None,
                events: self.snapshot(),
            },
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
