use std::borrow::Cow;
use std::collections::VecDeque;

use chrono::{DateTime, Local};
use log::{debug, info};

use super::analyzer::{AnomalyEvent, AnomalyKind, Classifier};
use crate::observation::{NetworkTransition, RadioGeneration};

const HISTORY_CAPACITY: usize = 256;

/// Classify a single generation change. Only a downgrade onto 2G is
/// policy-significant; every other change is history only.
pub fn classify_network_transition(transition: &NetworkTransition) -> Option<AnomalyEvent> {
    if !transition.is_2g_downgrade() {
        return None;
    }
    Some(AnomalyEvent::new(
        AnomalyKind::NetworkDowngrade2G,
        transition.occurred_at,
        format!(
            "Network downgraded from {} to {}",
            transition.from_generation, transition.to_generation
        ),
    ))
}

/// Tracks the last known radio generation and turns generation callbacks
/// into transitions.
///
/// There is no hysteresis: a phone bouncing between 4G and 2G at a cell edge
/// produces an event on every drop.
pub struct NetworkTransitionClassifier {
    last_generation: Option<RadioGeneration>,
    history: VecDeque<NetworkTransition>,
}

impl Default for NetworkTransitionClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkTransitionClassifier {
    pub fn new() -> Self {
        Self {
            last_generation: None,
            history: VecDeque::new(),
        }
    }

    /// Record the generation the platform reports now. Unknown readings don't
    /// replace the last known generation.
    pub fn observe(
        &mut self,
        generation: RadioGeneration,
        at: DateTime<Local>,
    ) -> Option<AnomalyEvent> {
        if !generation.is_known() {
            debug!("ignoring unknown radio generation at {at}");
            return None;
        }
        let previous = self.last_generation.replace(generation)?;
        if previous == generation {
            return None;
        }
        self.record(NetworkTransition {
            from_generation: previous,
            to_generation: generation,
            occurred_at: at,
        })
    }

    /// Classify a transition the host already computed, and adopt its target
    /// as the last known generation.
    pub fn classify(&mut self, transition: NetworkTransition) -> Option<AnomalyEvent> {
        if transition.to_generation.is_known() {
            self.last_generation = Some(transition.to_generation);
        }
        if transition.from_generation == transition.to_generation {
            return None;
        }
        self.record(transition)
    }

    fn record(&mut self, transition: NetworkTransition) -> Option<AnomalyEvent> {
        if transition.is_downgrade() {
            info!(
                "radio downgrade {} -> {}",
                transition.from_generation, transition.to_generation
            );
        } else {
            debug!(
                "radio transition {} -> {}",
                transition.from_generation, transition.to_generation
            );
        }
        self.history.push_front(transition);
        self.history.truncate(HISTORY_CAPACITY);
        classify_network_transition(&transition)
    }

    pub fn last_generation(&self) -> Option<RadioGeneration> {
        self.last_generation
    }

    /// Recorded transitions, newest first.
    pub fn history(&self) -> impl Iterator<Item = &NetworkTransition> {
        self.history.iter()
    }
}

impl Classifier for NetworkTransitionClassifier {
    fn get_name(&self) -> Cow<'_, str> {
        Cow::from("Forced 2G Downgrade")
    }

    fn get_description(&self) -> Cow<'_, str> {
        Cow::from(
            "Tests for the serving network dropping from a higher radio generation to 2G, \
             whose weak encryption makes interception practical. Leaving 3G/4G/5G coverage \
             legitimately will also trigger this.",
        )
    }

    fn get_version(&self) -> u32 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(from: RadioGeneration, to: RadioGeneration) -> NetworkTransition {
        NetworkTransition {
            from_generation: from,
            to_generation: to,
            occurred_at: Local::now(),
        }
    }

    #[test]
    fn test_only_2g_downgrades_emit() {
        use RadioGeneration::*;
        let event = classify_network_transition(&transition(Gen4, Gen2)).unwrap();
        assert_eq!(event.kind, AnomalyKind::NetworkDowngrade2G);
        assert_eq!(event.severity.level(), 3);
        assert!(classify_network_transition(&transition(Gen5, Gen2)).is_some());
        assert!(classify_network_transition(&transition(Gen2, Gen4)).is_none());
        assert!(classify_network_transition(&transition(Gen5, Gen4)).is_none());
        assert!(classify_network_transition(&transition(Gen2, Gen2)).is_none());
        assert!(classify_network_transition(&transition(Unknown, Gen2)).is_none());
    }

    #[test]
    fn test_observe_tracks_last_generation() {
        use RadioGeneration::*;
        let mut classifier = NetworkTransitionClassifier::new();
        let now = Local::now();
        assert!(classifier.observe(Gen4, now).is_none());
        assert!(classifier.observe(Gen4, now).is_none());
        assert!(classifier.observe(Unknown, now).is_none());
        assert_eq!(classifier.last_generation(), Some(Gen4));

        let event = classifier.observe(Gen2, now).unwrap();
        assert_eq!(event.kind, AnomalyKind::NetworkDowngrade2G);
        assert!(classifier.observe(Gen3, now).is_none());
        assert_eq!(classifier.history().count(), 2);
    }

    #[test]
    fn test_oscillation_fires_every_time() {
        use RadioGeneration::*;
        let mut classifier = NetworkTransitionClassifier::new();
        let now = Local::now();
        classifier.observe(Gen4, now);
        let fired = (0..5)
            .filter_map(|_| {
                let down = classifier.observe(Gen2, now);
                classifier.observe(Gen4, now);
                down
            })
            .count();
        assert_eq!(fired, 5);
    }

    #[test]
    fn test_history_is_bounded() {
        use RadioGeneration::*;
        let mut classifier = NetworkTransitionClassifier::new();
        for _ in 0..HISTORY_CAPACITY {
            classifier.classify(transition(Gen4, Gen3));
            classifier.classify(transition(Gen3, Gen4));
        }
        assert_eq!(classifier.history().count(), HISTORY_CAPACITY);
        assert_eq!(classifier.last_generation(), Some(Gen4));
    }
}
