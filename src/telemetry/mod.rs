//! Client-side behavioral telemetry.
//!
//! # DELIVERY INVARIANT
//! An event leaves local storage only after the ingestion endpoint has
//! acknowledged a batch containing it, and it is removed by `event_id`,
//! never by position. Delivery is at-least-once; duplicates are possible.
//!
//! # HOST INVARIANT
//! Nothing in here may fail, block or panic a producer. Sensor, storage and
//! network failures are logged and absorbed.

pub mod aggregator;
pub mod clock;
pub mod context;
pub mod delivery;
pub mod event;
pub mod queue;
pub mod recorder;
pub mod session;
pub mod storage;
pub mod transport;

pub use aggregator::{AggregationRules, BehavioralAggregator, BehavioralSummary};
pub use context::{AppState, ContextSnapshot, NetworkType};
pub use delivery::FlushOutcome;
pub use event::{Event, Priority, SessionId};
pub use recorder::{Collaborators, EventRecorder, RecordOutcome};
