use chrono::{DateTime, Local, NaiveDateTime, Offset, TimeDelta, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::analyzer::{AnomalyEvent, ClassifierMetadata, REPORT_VERSION, ReportMetadata, Severity};
use super::cell_anomaly::{
    CellAnomalyClassifier, DEFAULT_RAPID_CHANGE_COUNT, DEFAULT_RAPID_CHANGE_WINDOW_SECS,
    DEFAULT_SIGNAL_THRESHOLD_DBM, DEFAULT_WINDOW_CAPACITY, WindowSnapshot,
};
use super::network_transition::NetworkTransitionClassifier;
use super::sms::{SmsClassifier, classify_sms, classify_wap_push};
use super::threat::{ThreatSummary, recent_threat};
use super::trust::TrustPolicy;
use crate::observation::{
    CellObservation, NetworkTransition, ObservationError, ObservationRecord, RadioGeneration,
    SmsObservation, WapPushObservation,
};
use crate::store::{EventId, EventSink, StoreError, TowerStore};
use crate::util::RuntimeMetadata;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub signal_anomaly_threshold_dbm: i32,
    pub rapid_change_count: usize,
    pub rapid_change_window_seconds: i64,
    pub trust_observation_bonus_cap: f64,
    pub trust_age_bonus_cap: f64,
    pub trusted_threshold: f64,
    pub suspicious_threshold: f64,
    /// Events at or above this severity level are handed to the listener.
    pub notify_min_severity: u8,
    pub window_capacity: usize,
    pub threat_window_minutes: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let policy = TrustPolicy::default();
        EngineConfig {
            signal_anomaly_threshold_dbm: DEFAULT_SIGNAL_THRESHOLD_DBM,
            rapid_change_count: DEFAULT_RAPID_CHANGE_COUNT,
            rapid_change_window_seconds: DEFAULT_RAPID_CHANGE_WINDOW_SECS,
            trust_observation_bonus_cap: policy.observation_bonus_cap,
            trust_age_bonus_cap: policy.age_bonus_cap,
            trusted_threshold: policy.trusted_threshold,
            suspicious_threshold: policy.suspicious_threshold,
            notify_min_severity: Severity::Medium.level(),
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            threat_window_minutes: 60,
        }
    }
}

impl EngineConfig {
    pub fn trust_policy(&self) -> TrustPolicy {
        TrustPolicy {
            observation_bonus_cap: self.trust_observation_bonus_cap,
            age_bonus_cap: self.trust_age_bonus_cap,
            trusted_threshold: self.trusted_threshold,
            suspicious_threshold: self.suspicious_threshold,
        }
    }

    pub fn threat_window(&self) -> TimeDelta {
        TimeDelta::try_minutes(self.threat_window_minutes.max(0)).unwrap_or(TimeDelta::MAX)
    }
}

type Listener = Box<dyn FnMut(&AnomalyEvent) + Send>;

/// Owns the classifiers and routes observations through them.
///
/// The tower store and event sink are injected, so the same engine runs
/// against in-memory collaborators in tests and the `check` tool, and
/// file-backed ones in the daemon. An engine has a single writer; readers
/// that need the cell window should hold a [WindowSnapshot].
pub struct Engine<T: TowerStore, S: EventSink> {
    config: EngineConfig,
    policy: TrustPolicy,
    towers: T,
    sink: S,
    cells: CellAnomalyClassifier,
    network: NetworkTransitionClassifier,
    sms: SmsClassifier,
    last_cell: Option<CellObservation>,
    listener: Option<Listener>,
    observation_count: usize,
}

impl<T: TowerStore, S: EventSink> Engine<T, S> {
    pub fn new(config: EngineConfig, towers: T, sink: S) -> Self {
        let cells = CellAnomalyClassifier::new(
            config.window_capacity,
            config.signal_anomaly_threshold_dbm,
            config.rapid_change_count,
            config.rapid_change_window_seconds,
        );
        Self {
            policy: config.trust_policy(),
            config,
            towers,
            sink,
            cells,
            network: NetworkTransitionClassifier::new(),
            sms: SmsClassifier,
            last_cell: None,
            listener: None,
            observation_count: 0,
        }
    }

    /// Register the callback that receives every emitted event at or above
    /// `notify_min_severity`. Replaces any previous listener.
    pub fn set_listener<F>(&mut self, listener: F)
    where
        F: FnMut(&AnomalyEvent) + Send + 'static,
    {
        self.listener = Some(Box::new(listener));
    }

    /// Validate a feed record and route it to the matching classifier.
    pub fn process(
        &mut self,
        record: ObservationRecord,
    ) -> Result<Vec<AnomalyEvent>, ObservationError> {
        let events = match record {
            ObservationRecord::Cell(raw) => self.process_cell(&CellObservation::try_from(raw)?),
            ObservationRecord::Network {
                generation,
                observed_at,
            } => self
                .process_generation(generation, observed_at)
                .into_iter()
                .collect(),
            ObservationRecord::Sms(raw) => self.process_sms(&SmsObservation::try_from(raw)?),
            ObservationRecord::WapPush(push) => vec![self.process_wap_push(&push)],
        };
        Ok(events)
    }

    /// Look the tower up, classify the sighting, count it in the tower store
    /// and record whatever fired.
    pub fn process_cell(&mut self, current: &CellObservation) -> Vec<AnomalyEvent> {
        self.observation_count += 1;
        let tower = current.tower();
        let tower_is_known = match self.towers.is_tower_known(&tower) {
            Ok(known) => known,
            Err(err) => {
                warn!("tower lookup for {tower} failed, treating it as unknown: {err}");
                false
            }
        };

        let events = self
            .cells
            .classify(self.last_cell.as_ref(), current, tower_is_known);

        match self.towers.record_tower_observation(&tower, current.observed_at) {
            Ok(record) => debug!(
                "tower {tower} seen {} times, trust {:.2} ({:?})",
                record.times_observed,
                record.trust_score,
                record.trust_level(&self.policy)
            ),
            Err(err) => warn!("failed to record sighting of tower {tower}: {err}"),
        }

        self.last_cell = Some(*current);
        self.emit(&events);
        events
    }

    /// Feed the generation the platform reports now; fires when that
    /// amounts to a forced 2G downgrade.
    pub fn process_generation(
        &mut self,
        generation: RadioGeneration,
        at: DateTime<Local>,
    ) -> Option<AnomalyEvent> {
        self.observation_count += 1;
        let event = self.network.observe(generation, at);
        self.emit(event.as_slice());
        event
    }

    pub fn process_transition(&mut self, transition: NetworkTransition) -> Option<AnomalyEvent> {
        self.observation_count += 1;
        let event = self.network.classify(transition);
        self.emit(event.as_slice());
        event
    }

    pub fn process_sms(&mut self, sms: &SmsObservation) -> Vec<AnomalyEvent> {
        self.observation_count += 1;
        let events = classify_sms(sms);
        self.emit(&events);
        events
    }

    pub fn process_wap_push(&mut self, push: &WapPushObservation) -> AnomalyEvent {
        self.observation_count += 1;
        let event = classify_wap_push(push);
        self.emit(std::slice::from_ref(&event));
        event
    }

    fn emit(&mut self, events: &[AnomalyEvent]) {
        for event in events {
            if let Err(err) = self.sink.record(event) {
                warn!("failed to record {:?} event: {err}", event.kind);
            }
            if event.severity.level() >= self.config.notify_min_severity
                && let Some(listener) = self.listener.as_mut()
            {
                listener(event);
            }
        }
    }

    /// Threat level over the configured window ending at `now`.
    pub fn threat(&self, now: DateTime<Local>) -> Result<ThreatSummary, StoreError> {
        let lookback = self.config.threat_window();
        let since = now.checked_sub_signed(lookback).unwrap_or_else(|| {
            DateTime::from_naive_utc_and_offset(NaiveDateTime::MIN, Utc.fix())
        });
        let recorded = self.sink.events_since(since)?;
        Ok(recent_threat(
            recorded.iter().map(|r| (&r.event, r.dismissed)),
            now,
            lookback,
        ))
    }

    pub fn dismiss(&mut self, id: EventId) -> Result<bool, StoreError> {
        self.sink.dismiss(id)
    }

    pub fn window_snapshot(&self) -> WindowSnapshot {
        self.cells.snapshot()
    }

    pub fn last_generation(&self) -> Option<RadioGeneration> {
        self.network.last_generation()
    }

    pub fn network_history(&self) -> impl Iterator<Item = &NetworkTransition> {
        self.network.history()
    }

    /// Number of observations routed through this engine.
    pub fn observation_count(&self) -> usize {
        self.observation_count
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }

    pub fn towers(&self) -> &T {
        &self.towers
    }

    pub fn towers_mut(&mut self) -> &mut T {
        &mut self.towers
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn get_metadata(&self) -> ReportMetadata {
        let classifiers = vec![
            ClassifierMetadata::of(&self.cells),
            ClassifierMetadata::of(&self.network),
            ClassifierMetadata::of(&self.sms),
        ];
        ReportMetadata {
            classifiers,
            towerwatch: RuntimeMetadata::new(),
            report_version: REPORT_VERSION,
        }
    }
}
