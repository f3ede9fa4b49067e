//! Cell anomaly classifier
//!
//! Looks at each serving-cell sighting and flags:
//! - towers absent from the tower store
//! - abrupt jumps in signal strength between consecutive sightings
//! - bursts of sightings within a short window (forced handoffs)
//!
//! The rapid-change check runs over a bounded window of recent sightings
//! which is also published as a read-only snapshot for other readers.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use chrono::TimeDelta;
use log::debug;

use super::analyzer::{AnomalyEvent, AnomalyKind, Classifier};
use crate::observation::CellObservation;

pub const DEFAULT_WINDOW_CAPACITY: usize = 1000;
pub const DEFAULT_SIGNAL_THRESHOLD_DBM: i32 = 20;
pub const DEFAULT_RAPID_CHANGE_COUNT: usize = 10;
pub const DEFAULT_RAPID_CHANGE_WINDOW_SECS: i64 = 60;

/// Shared, read-only view of the most recent sightings, newest first.
///
/// The classifier publishes a fresh copy after every append, so readers
/// always see a complete window and never block the writer for longer than a
/// pointer swap.
#[derive(Clone)]
pub struct WindowSnapshot {
    inner: Arc<RwLock<Arc<[CellObservation]>>>,
}

impl Default for WindowSnapshot {
    fn default() -> Self {
        let empty: Arc<[CellObservation]> = Arc::from(Vec::new());
        WindowSnapshot {
            inner: Arc::new(RwLock::new(empty)),
        }
    }
}

impl WindowSnapshot {
    pub fn load(&self) -> Arc<[CellObservation]> {
        match self.inner.read() {
            Ok(window) => window.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn publish(&self, window: Arc<[CellObservation]>) {
        match self.inner.write() {
            Ok(mut current) => *current = window,
            Err(poisoned) => *poisoned.into_inner() = window,
        }
    }
}

pub struct CellAnomalyClassifier {
    window: VecDeque<CellObservation>,
    capacity: usize,
    signal_threshold_dbm: i32,
    rapid_change_count: usize,
    rapid_change_window: TimeDelta,
    snapshot: WindowSnapshot,
}

impl Default for CellAnomalyClassifier {
    fn default() -> Self {
        Self::new(
            DEFAULT_WINDOW_CAPACITY,
            DEFAULT_SIGNAL_THRESHOLD_DBM,
            DEFAULT_RAPID_CHANGE_COUNT,
            DEFAULT_RAPID_CHANGE_WINDOW_SECS,
        )
    }
}

impl CellAnomalyClassifier {
    pub fn new(
        capacity: usize,
        signal_threshold_dbm: i32,
        rapid_change_count: usize,
        rapid_change_window_secs: i64,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            signal_threshold_dbm,
            rapid_change_count,
            rapid_change_window: TimeDelta::try_seconds(rapid_change_window_secs.max(0))
                .unwrap_or(TimeDelta::MAX),
            snapshot: WindowSnapshot::default(),
        }
    }

    /// Classify `current` against the previous sighting and the window, then
    /// append it to the window.
    pub fn classify(
        &mut self,
        previous: Option<&CellObservation>,
        current: &CellObservation,
        tower_is_known: bool,
    ) -> Vec<AnomalyEvent> {
        let events = self.evaluate(previous, current, tower_is_known);
        self.push(*current);
        events
    }

    /// Run every rule without touching the window.
    pub fn evaluate(
        &self,
        previous: Option<&CellObservation>,
        current: &CellObservation,
        tower_is_known: bool,
    ) -> Vec<AnomalyEvent> {
        let mut events = Vec::new();

        if !tower_is_known {
            events.push(AnomalyEvent::new(
                AnomalyKind::UnknownTower,
                current.observed_at,
                format!(
                    "Serving cell {} ({}) is not in the tower store",
                    current.tower(),
                    current.radio_generation
                ),
            ));
        }

        if let Some(previous) = previous {
            let delta = (current.signal_strength_dbm - previous.signal_strength_dbm).abs();
            if delta > self.signal_threshold_dbm {
                events.push(AnomalyEvent::new(
                    AnomalyKind::SignalAnomaly,
                    current.observed_at,
                    format!(
                        "Signal changed by {delta} dBm ({} -> {} dBm) on cell {}",
                        previous.signal_strength_dbm,
                        current.signal_strength_dbm,
                        current.tower()
                    ),
                ));
            }
        }

        let recent = self.recent_cell_changes(current);
        if recent > self.rapid_change_count {
            events.push(AnomalyEvent::new(
                AnomalyKind::RapidCellChange,
                current.observed_at,
                format!(
                    "{recent} cell observations in the last {} seconds",
                    self.rapid_change_window.num_seconds()
                ),
            ));
        }

        debug!(
            "cell {} at {} dBm: {} events, {recent} recent sightings",
            current.tower(),
            current.signal_strength_dbm,
            events.len()
        );
        events
    }

    // Sightings strictly newer than `current.observed_at - window`, counting
    // `current` itself. A window reaching past the start of time covers
    // everything we hold.
    fn recent_cell_changes(&self, current: &CellObservation) -> usize {
        let cutoff = current
            .observed_at
            .checked_sub_signed(self.rapid_change_window);
        1 + self
            .window
            .iter()
            .filter(|obs| cutoff.is_none_or(|cutoff| obs.observed_at > cutoff))
            .count()
    }

    fn push(&mut self, observation: CellObservation) {
        self.window.push_front(observation);
        while self.window.len() > self.capacity {
            self.window.pop_back();
        }
        let copy: Arc<[CellObservation]> = self.window.iter().copied().collect();
        self.snapshot.publish(copy);
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent sighting, if any.
    pub fn latest(&self) -> Option<&CellObservation> {
        self.window.front()
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        self.snapshot.clone()
    }
}

impl Classifier for CellAnomalyClassifier {
    fn get_name(&self) -> Cow<'_, str> {
        Cow::from("Cell Anomalies")
    }

    fn get_description(&self) -> Cow<'_, str> {
        Cow::from(
            "Flags serving cells that aren't in the tower store, signal strength jumps \
             larger than the configured threshold between consecutive observations, and \
             bursts of cell observations in a short window. Moving between towers, poor \
             coverage and newly built legitimate towers can all trigger these.",
        )
    }

    fn get_version(&self) -> u32 {
        1
    }
}
