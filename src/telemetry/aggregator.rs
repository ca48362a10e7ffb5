use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::event::{Event, SessionEnvelope, SessionId};

/// One aggregated record standing in for a whole session's raw events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralSummary {
    /// Stable per session so the server can drop repeated inserts.
    pub summary_id: String,
    pub session_id: SessionId,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: u64,
    pub per_category_counts: BTreeMap<String, u64>,
    /// Milliseconds per category.
    pub per_category_durations: BTreeMap<String, u64>,
}

impl BehavioralSummary {
    pub fn count(&self, counter: &str) -> u64 {
        self.per_category_counts.get(counter).copied().unwrap_or(0)
    }

    pub fn duration_ms(&self, category: &str) -> u64 {
        self.per_category_durations.get(category).copied().unwrap_or(0)
    }

    /// Whole seconds, rounded to nearest.
    pub fn seconds_in(&self, category: &str) -> u64 {
        (self.duration_ms(category) + 500) / 1000
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategorySource {
    /// Category read from a payload field, or `fallback` when absent.
    Field { name: String, fallback: String },
    Fixed(String),
}

/// Pairs a start event with its end event through a correlation field.
#[derive(Debug, Clone)]
pub struct PairingRule {
    pub start_event: String,
    pub end_event: String,
    pub key_field: String,
    pub category: CategorySource,
    /// Bumped once per accepted start.
    pub started_counter: String,
    /// Bumped when a completed pair is shorter than the quick threshold.
    pub quick_counter: String,
}

#[derive(Debug, Clone)]
pub struct CountRule {
    pub event_name: String,
    pub counter: String,
}

#[derive(Debug, Clone)]
pub struct AggregationRules {
    pub pairs: Vec<PairingRule>,
    pub counts: Vec<CountRule>,
}

impl Default for AggregationRules {
    fn default() -> Self {
        Self {
            pairs: vec![
                PairingRule {
                    start_event: "lesson_view_start".to_string(),
                    end_event: "lesson_view_end".to_string(),
                    key_field: "lessonId".to_string(),
                    category: CategorySource::Field {
                        name: "subjectId".to_string(),
                        fallback: "uncategorized".to_string(),
                    },
                    started_counter: "lessons_viewed".to_string(),
                    quick_counter: "quick_close".to_string(),
                },
                PairingRule {
                    start_event: "focus_task_start".to_string(),
                    end_event: "focus_task_end".to_string(),
                    key_field: "taskId".to_string(),
                    category: CategorySource::Fixed("focus".to_string()),
                    started_counter: "focus_tasks_started".to_string(),
                    quick_counter: "quick_focus".to_string(),
                },
            ],
            counts: vec![
                CountRule { event_name: "panel_opened".to_string(), counter: "panels_opened".to_string() },
                CountRule { event_name: "artifact_generated".to_string(), counter: "artifacts_generated".to_string() },
            ],
        }
    }
}

/// Correlation identifier of a start/end pair. Events without the key
/// field pair with each other through the explicit `Unkeyed` sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    Id(String),
    Unkeyed,
}

impl CorrelationKey {
    fn from_event(event: &Event, field: &str) -> Self {
        match event.payload_str(field) {
            Some(id) if !id.is_empty() => CorrelationKey::Id(id.to_string()),
            _ => CorrelationKey::Unkeyed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    rule: usize,
    key: CorrelationKey,
}

#[derive(Debug, Clone)]
struct PendingStart {
    started_at: DateTime<Utc>,
    category: String,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Tallies {
    pub counts: BTreeMap<String, u64>,
    pub durations_ms: BTreeMap<String, u64>,
    /// Starts that never saw their end.
    pub abandoned: usize,
}

/// Start/end pairing state machine over one session's ordered events.
#[derive(Debug)]
pub struct PairingReducer<'a> {
    rules: &'a AggregationRules,
    quick_threshold: Duration,
    pending: HashMap<PendingKey, PendingStart>,
    tallies: Tallies,
}

impl<'a> PairingReducer<'a> {
    pub fn new(rules: &'a AggregationRules, quick_threshold: Duration) -> Self {
        Self {
            rules,
            quick_threshold,
            pending: HashMap::new(),
            tallies: Tallies::default(),
        }
    }

    pub fn observe(&mut self, event: &Event) {
        let rules = self.rules;
        for (idx, rule) in rules.pairs.iter().enumerate() {
            if event.event_name == rule.start_event {
                self.on_start(idx, rule, event);
            } else if event.event_name == rule.end_event {
                self.on_end(idx, rule, event);
            }
        }

        for rule in &rules.counts {
            if event.event_name == rule.event_name {
                *self.tallies.counts.entry(rule.counter.clone()).or_insert(0) += 1;
            }
        }
    }

    fn on_start(&mut self, idx: usize, rule: &PairingRule, event: &Event) {
        let key = PendingKey { rule: idx, key: CorrelationKey::from_event(event, &rule.key_field) };
        if self.pending.contains_key(&key) {
            return;
        }
        let category = match &rule.category {
            CategorySource::Field { name, fallback } => event
                .payload_str(name)
                .filter(|c| !c.is_empty())
                .unwrap_or(fallback)
                .to_string(),
            CategorySource::Fixed(name) => name.clone(),
        };
        self.pending.insert(key, PendingStart { started_at: event.timestamp, category });
        *self.tallies.counts.entry(rule.started_counter.clone()).or_insert(0) += 1;
    }

    fn on_end(&mut self, idx: usize, rule: &PairingRule, event: &Event) {
        let key = PendingKey { rule: idx, key: CorrelationKey::from_event(event, &rule.key_field) };
        // An end without a pending start is noise.
        let Some(start) = self.pending.remove(&key) else {
            return;
        };

        let elapsed_ms = (event.timestamp - start.started_at).num_milliseconds().max(0) as u64;
        *self.tallies.durations_ms.entry(start.category).or_insert(0) += elapsed_ms;

        if u128::from(elapsed_ms) < self.quick_threshold.as_millis() {
            *self.tallies.counts.entry(rule.quick_counter.clone()).or_insert(0) += 1;
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Closes the reduction. Starts still pending are dropped without
    /// contributing any duration.
    pub fn finish(&mut self) -> Tallies {
        let mut tallies = std::mem::take(&mut self.tallies);
        tallies.abandoned = self.pending.len();
        self.pending.clear();
        tallies
    }
}

/// Reduces a finalized session into exactly one [`BehavioralSummary`].
#[derive(Debug, Clone)]
pub struct BehavioralAggregator {
    rules: AggregationRules,
    quick_threshold: Duration,
}

impl BehavioralAggregator {
    pub fn new(rules: AggregationRules, quick_threshold: Duration) -> Self {
        Self { rules, quick_threshold }
    }

    pub fn rules(&self) -> &AggregationRules {
        &self.rules
    }

    /// Returns `None` for a session with no events; there is nothing to
    /// attribute a summary to.
    pub fn summarize(&self, envelope: &SessionEnvelope) -> Option<BehavioralSummary> {
        let user_id = envelope.user_id()?.to_string();

        let mut reducer = PairingReducer::new(&self.rules, self.quick_threshold);
        for event in &envelope.events {
            reducer.observe(event);
        }
        let tallies = reducer.finish();
        if tallies.abandoned > 0 {
            debug!(session_id = %envelope.session_id, abandoned = tallies.abandoned, "discarding unmatched starts");
        }

        let end_time = envelope.ended_at();
        let duration_seconds = (end_time - envelope.start_time).num_seconds().max(0) as u64;

        Some(BehavioralSummary {
            summary_id: format!("summary-{}", envelope.session_id),
            session_id: envelope.session_id.clone(),
            user_id,
            start_time: envelope.start_time,
            end_time,
            duration_seconds,
            per_category_counts: tallies.counts,
            per_category_durations: tallies.durations_ms,
        })
    }
}
