//! Collaborator contracts the engine calls into: a tower store and an event
//! sink. Persistence is the host's business; the in-memory implementations
//! here back the `check` tool and tests, and hosts can wrap them.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::analyzer::AnomalyEvent;
use crate::analysis::trust::{TrustLevel, TrustPolicy};
use crate::observation::TowerIdentity;

/// Default number of events an in-memory log keeps before dropping the oldest.
pub const DEFAULT_EVENT_CAPACITY: usize = 10_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store is unavailable: {0}")]
    Unavailable(String),
    #[error("Store lock was poisoned")]
    Poisoned,
    #[error("No event with id {0}")]
    NoSuchEvent(EventId),
}

/// What we know about a tower from past sightings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TowerRecord {
    pub times_observed: u64,
    pub first_seen_at: DateTime<Local>,
    pub last_seen_at: DateTime<Local>,
    pub trust_score: f64,
}

impl TowerRecord {
    pub fn first_sighting(at: DateTime<Local>, policy: &TrustPolicy) -> Self {
        let mut record = TowerRecord {
            times_observed: 1,
            first_seen_at: at,
            last_seen_at: at,
            trust_score: 0.0,
        };
        record.trust_score = policy.score(record.times_observed, at, at);
        record
    }

    /// Count another sighting and recompute the trust score.
    pub fn observed_again(&mut self, at: DateTime<Local>, policy: &TrustPolicy) {
        self.times_observed = self.times_observed.saturating_add(1);
        self.last_seen_at = self.last_seen_at.max(at);
        self.trust_score = policy.score(self.times_observed, self.first_seen_at, at);
    }

    /// Trust score as of `now`, which may be later than the last update.
    pub fn trust_at(&self, policy: &TrustPolicy, now: DateTime<Local>) -> f64 {
        policy.score(self.times_observed, self.first_seen_at, now)
    }

    pub fn trust_level(&self, policy: &TrustPolicy) -> TrustLevel {
        policy.level(self.trust_score)
    }
}

/// Read/write access to persisted tower records.
pub trait TowerStore {
    fn is_tower_known(&self, tower: &TowerIdentity) -> Result<bool, StoreError>;

    fn get_tower_record(&self, tower: &TowerIdentity) -> Result<Option<TowerRecord>, StoreError>;

    /// Count a sighting, inserting a fresh record for a first sighting.
    fn record_tower_observation(
        &mut self,
        tower: &TowerIdentity,
        at: DateTime<Local>,
    ) -> Result<TowerRecord, StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTowerStore {
    towers: HashMap<TowerIdentity, TowerRecord>,
    policy: TrustPolicy,
}

impl MemoryTowerStore {
    pub fn new(policy: TrustPolicy) -> Self {
        Self {
            towers: HashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    /// Seed a record, e.g. when loading from disk.
    pub fn insert(&mut self, tower: TowerIdentity, record: TowerRecord) {
        self.towers.insert(tower, record);
    }

    pub fn records(&self) -> impl Iterator<Item = (&TowerIdentity, &TowerRecord)> {
        self.towers.iter()
    }

    pub fn len(&self) -> usize {
        self.towers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.towers.is_empty()
    }
}

impl TowerStore for MemoryTowerStore {
    fn is_tower_known(&self, tower: &TowerIdentity) -> Result<bool, StoreError> {
        Ok(self.towers.contains_key(tower))
    }

    fn get_tower_record(&self, tower: &TowerIdentity) -> Result<Option<TowerRecord>, StoreError> {
        Ok(self.towers.get(tower).cloned())
    }

    fn record_tower_observation(
        &mut self,
        tower: &TowerIdentity,
        at: DateTime<Local>,
    ) -> Result<TowerRecord, StoreError> {
        let policy = self.policy;
        let record = self
            .towers
            .entry(*tower)
            .and_modify(|record| record.observed_again(at, &policy))
            .or_insert_with(|| TowerRecord::first_sighting(at, &policy));
        Ok(record.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An event as the sink holds it: the immutable event plus its dismissal
/// state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub id: EventId,
    pub event: AnomalyEvent,
    pub dismissed: bool,
}

/// Durable home for emitted events.
pub trait EventSink {
    fn record(&mut self, event: &AnomalyEvent) -> Result<EventId, StoreError>;

    /// Dismiss an event. Returns whether this call changed anything; dismissal
    /// can't be undone.
    fn dismiss(&mut self, id: EventId) -> Result<bool, StoreError>;

    /// Events that occurred at or after `start`, oldest first.
    fn events_since(&self, start: DateTime<Local>) -> Result<Vec<RecordedEvent>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct MemoryEventLog {
    events: VecDeque<RecordedEvent>,
    next_id: u64,
    capacity: usize,
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl MemoryEventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            next_id: 1,
            capacity: capacity.max(1),
        }
    }

    /// Re-insert an event with a known id, e.g. when replaying from disk.
    pub fn restore(&mut self, recorded: RecordedEvent) {
        self.next_id = self.next_id.max(recorded.id.0.saturating_add(1));
        self.events.push_back(recorded);
        self.evict();
    }

    pub fn get(&self, id: EventId) -> Option<&RecordedEvent> {
        self.events.iter().find(|recorded| recorded.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecordedEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn evict(&mut self) {
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
    }
}

impl EventSink for MemoryEventLog {
    fn record(&mut self, event: &AnomalyEvent) -> Result<EventId, StoreError> {
        let id = EventId(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        self.events.push_back(RecordedEvent {
            id,
            event: event.clone(),
            dismissed: false,
        });
        self.evict();
        Ok(id)
    }

    fn dismiss(&mut self, id: EventId) -> Result<bool, StoreError> {
        let recorded = self
            .events
            .iter_mut()
            .find(|recorded| recorded.id == id)
            .ok_or(StoreError::NoSuchEvent(id))?;
        let changed = !recorded.dismissed;
        recorded.dismissed = true;
        Ok(changed)
    }

    fn events_since(&self, start: DateTime<Local>) -> Result<Vec<RecordedEvent>, StoreError> {
        Ok(self
            .events
            .iter()
            .filter(|recorded| recorded.event.occurred_at >= start)
            .cloned()
            .collect())
    }
}
