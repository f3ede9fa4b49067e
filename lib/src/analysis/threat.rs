//! Threat aggregation.
//!
//! The threat level is the highest severity among recent, undismissed events.
//! It is a maximum and never a sum: one critical event outweighs any number
//! of informational ones.

use chrono::{DateTime, Local, TimeDelta};
use serde::{Deserialize, Serialize};

use super::analyzer::{AnomalyEvent, Severity};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ThreatSummary {
    pub level: Severity,
    pub contributing_event_count: usize,
    pub window_start: DateTime<Local>,
    pub window_end: DateTime<Local>,
}

impl ThreatSummary {
    pub fn empty(window_start: DateTime<Local>, window_end: DateTime<Local>) -> Self {
        ThreatSummary {
            level: Severity::Informational,
            contributing_event_count: 0,
            window_start,
            window_end,
        }
    }

    pub fn is_alarming(&self) -> bool {
        self.level > Severity::Informational
    }
}

/// Summarize `(event, dismissed)` pairs that occurred at or after
/// `window_start`. `window_end` is the newest contributing event, or
/// `window_start` when nothing contributes.
pub fn aggregate_threat<'a, I>(events: I, window_start: DateTime<Local>) -> ThreatSummary
where
    I: IntoIterator<Item = (&'a AnomalyEvent, bool)>,
{
    let mut summary = ThreatSummary::empty(window_start, window_start);
    for (event, dismissed) in events {
        if dismissed || event.occurred_at < window_start {
            continue;
        }
        summary.contributing_event_count += 1;
        summary.level = summary.level.max(event.severity);
        summary.window_end = summary.window_end.max(event.occurred_at);
    }
    summary
}

/// Summarize the `lookback` period ending at `now`. A lookback reaching past
/// the earliest representable time starts the window at the oldest event.
pub fn recent_threat<'a, I>(events: I, now: DateTime<Local>, lookback: TimeDelta) -> ThreatSummary
where
    I: IntoIterator<Item = (&'a AnomalyEvent, bool)>,
{
    let events: Vec<(&AnomalyEvent, bool)> = events.into_iter().collect();
    let window_start = now.checked_sub_signed(lookback).unwrap_or_else(|| {
        events
            .iter()
            .map(|(event, _)| event.occurred_at)
            .min()
            .map_or(now, |oldest| oldest.min(now))
    });
    let mut summary = aggregate_threat(events, window_start);
    summary.window_end = summary.window_end.max(now);
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::analyzer::AnomalyKind;

    fn event_with(kind: AnomalyKind, at: DateTime<Local>) -> AnomalyEvent {
        AnomalyEvent::new(kind, at, String::new())
    }

    #[test]
    fn test_empty_is_level_zero() {
        let now = Local::now();
        let summary = aggregate_threat(std::iter::empty::<(&AnomalyEvent, bool)>(), now);
        assert_eq!(summary.level.level(), 0);
        assert_eq!(summary.contributing_event_count, 0);
        assert!(!summary.is_alarming());
    }

    #[test]
    fn test_dismissed_events_do_not_count() {
        let now = Local::now();
        let events = [
            (event_with(AnomalyKind::SignalAnomaly, now), false),
            (event_with(AnomalyKind::SilentSmsType0, now), true),
        ];
        let summary = aggregate_threat(events.iter().map(|(e, d)| (e, *d)), now);
        assert_eq!(summary.level, Severity::Low);
        assert_eq!(summary.contributing_event_count, 1);
    }

    #[test]
    fn test_level_is_maximum_not_sum() {
        let now = Local::now();
        let mut events: Vec<(AnomalyEvent, bool)> = (0..50)
            .map(|_| (event_with(AnomalyKind::SignalAnomaly, now), false))
            .collect();
        events.push((event_with(AnomalyKind::SilentSmsType0, now), false));
        let summary = aggregate_threat(events.iter().map(|(e, d)| (e, *d)), now);
        assert_eq!(summary.level, Severity::Critical);
        assert_eq!(summary.contributing_event_count, 51);
    }

    #[test]
    fn test_events_before_window_are_excluded() {
        let now = Local::now();
        let window_start = now - TimeDelta::minutes(60);
        let events = [
            (
                event_with(AnomalyKind::SilentSmsType0, window_start - TimeDelta::seconds(1)),
                false,
            ),
            (event_with(AnomalyKind::UnknownTower, window_start), false),
        ];
        let summary = aggregate_threat(events.iter().map(|(e, d)| (e, *d)), window_start);
        assert_eq!(summary.level, Severity::Medium);
        assert_eq!(summary.contributing_event_count, 1);
        assert_eq!(summary.window_end, window_start);
    }

    #[test]
    fn test_recent_threat_window_bounds() {
        let now = Local::now();
        let events = [(
            event_with(AnomalyKind::NetworkDowngrade2G, now - TimeDelta::minutes(5)),
            false,
        )];
        let summary = recent_threat(
            events.iter().map(|(e, d)| (e, *d)),
            now,
            TimeDelta::minutes(60),
        );
        assert_eq!(summary.level, Severity::High);
        assert_eq!(summary.window_start, now - TimeDelta::minutes(60));
        assert_eq!(summary.window_end, now);
    }

    #[test]
    fn test_unbounded_lookback_starts_at_oldest_event() {
        let now = Local::now();
        let oldest = now - TimeDelta::days(4000);
        let events = [
            (event_with(AnomalyKind::SilentSmsClass0, oldest), false),
            (event_with(AnomalyKind::UnknownTower, now), false),
        ];
        let summary = recent_threat(events.iter().map(|(e, d)| (e, *d)), now, TimeDelta::MAX);
        assert_eq!(summary.level, Severity::High);
        assert_eq!(summary.contributing_event_count, 2);
        assert_eq!(summary.window_start, oldest);

        let empty = recent_threat(std::iter::empty(), now, TimeDelta::MAX);
        assert_eq!(empty.window_start, now);
        assert_eq!(empty.level, Severity::Informational);
    }
}
