use chrono::{DateTime, Local, TimeDelta};
use towerwatch::analysis::analyzer::{AnomalyEvent, AnomalyKind, Severity};
use towerwatch::analysis::cell_anomaly::CellAnomalyClassifier;
use towerwatch::analysis::engine::{Engine, EngineConfig};
use towerwatch::analysis::network_transition::classify_network_transition;
use towerwatch::analysis::sms::classify_sms;
use towerwatch::analysis::threat::aggregate_threat;
use towerwatch::analysis::trust::compute_trust_score;
use towerwatch::observation::{
    CellObservation, NetworkTransition, ObservationRecord, RadioGeneration, SmsObservation,
};
use towerwatch::store::{MemoryEventLog, MemoryTowerStore};

fn cell(cell_id: u64, dbm: i32, at: DateTime<Local>) -> CellObservation {
    CellObservation {
        cell_id,
        area_code: 1_201,
        country_code: 208,
        network_code: 10,
        radio_generation: RadioGeneration::Gen4,
        signal_strength_dbm: dbm,
        observed_at: at,
    }
}

fn kinds(events: &[AnomalyEvent]) -> Vec<AnomalyKind> {
    events.iter().map(|e| e.kind).collect()
}

#[test]
fn test_trust_score_bounds_and_monotonicity() {
    let now = Local::now();
    assert_eq!(compute_trust_score(0, now, now), 0.5);
    assert_eq!(
        compute_trust_score(100, now - TimeDelta::days(24 * 30), now),
        1.0
    );

    let mut last = 0.0;
    for times in [0u64, 1, 9, 10, 25, 30, 31, 1_000, u64::MAX] {
        let score = compute_trust_score(times, now, now);
        assert!((0.0..=1.0).contains(&score));
        assert!(score >= last);
        last = score;
    }

    let mut last = 0.0;
    for days in [0i64, 29, 30, 59, 60, 365, 3_650] {
        let score = compute_trust_score(5, now - TimeDelta::days(days), now);
        assert!((0.0..=1.0).contains(&score));
        assert!(score >= last);
        last = score;
    }
}

#[test]
fn test_first_observation_never_signal_anomaly() {
    let mut classifier = CellAnomalyClassifier::default();
    let events = classifier.classify(None, &cell(1, -50, Local::now()), false);
    assert!(kinds(&events).contains(&AnomalyKind::UnknownTower));
    assert!(!kinds(&events).contains(&AnomalyKind::SignalAnomaly));
}

#[test]
fn test_signal_delta_threshold() {
    let classifier = CellAnomalyClassifier::default();
    let now = Local::now();
    let prev = cell(1, -90, now);
    let over = classifier.evaluate(Some(&prev), &cell(1, -69, now), true);
    assert_eq!(kinds(&over), vec![AnomalyKind::SignalAnomaly]);
    let at = classifier.evaluate(Some(&prev), &cell(1, -70, now), true);
    assert!(at.is_empty());
}

#[test]
fn test_rapid_change_on_eleventh_observation() {
    let mut engine = Engine::new(
        EngineConfig::default(),
        MemoryTowerStore::default(),
        MemoryEventLog::default(),
    );
    let start = Local::now();
    for i in 0..10 {
        let events = engine.process_cell(&cell(i, -80, start + TimeDelta::seconds(i as i64)));
        assert!(!kinds(&events).contains(&AnomalyKind::RapidCellChange));
    }
    let events = engine.process_cell(&cell(10, -80, start + TimeDelta::seconds(10)));
    assert!(kinds(&events).contains(&AnomalyKind::RapidCellChange));
}

#[test]
fn test_network_transitions() {
    let now = Local::now();
    let t = |from, to| NetworkTransition {
        from_generation: from,
        to_generation: to,
        occurred_at: now,
    };
    let event =
        classify_network_transition(&t(RadioGeneration::Gen4, RadioGeneration::Gen2)).unwrap();
    assert_eq!(event.kind, AnomalyKind::NetworkDowngrade2G);
    assert_eq!(event.severity.level(), 3);
    assert!(classify_network_transition(&t(RadioGeneration::Gen2, RadioGeneration::Gen4)).is_none());
    assert!(classify_network_transition(&t(RadioGeneration::Gen5, RadioGeneration::Gen4)).is_none());
}

#[test]
fn test_silent_sms_both_rules() {
    let sms = SmsObservation {
        message_class: Some(0),
        protocol_id: Some(0x40),
        has_text_body: true,
        has_binary_payload: false,
        sender: None,
        received_at: Local::now(),
    };
    assert_eq!(
        kinds(&classify_sms(&sms)),
        vec![AnomalyKind::SilentSmsClass0, AnomalyKind::SilentSmsType0]
    );
}

#[test]
fn test_aggregate_ignores_dismissed() {
    let now = Local::now();
    let low = AnomalyEvent::new(AnomalyKind::SignalAnomaly, now, String::new());
    let critical = AnomalyEvent::new(AnomalyKind::SilentSmsType0, now, String::new());
    let summary = aggregate_threat([(&low, false), (&critical, true)], now);
    assert_eq!(summary.level, Severity::Low);
    assert_eq!(summary.contributing_event_count, 1);

    let summary = aggregate_threat(std::iter::empty::<(&AnomalyEvent, bool)>(), now);
    assert_eq!(summary.level.level(), 0);
    assert_eq!(summary.contributing_event_count, 0);
}

#[test]
fn test_identical_inputs_identical_events() {
    let run = || {
        let mut engine = Engine::new(
            EngineConfig::default(),
            MemoryTowerStore::default(),
            MemoryEventLog::default(),
        );
        let start: DateTime<Local> = "2024-03-01T08:00:00+01:00".parse().unwrap();
        let mut out = Vec::new();
        for i in 0..15 {
            let dbm = if i % 3 == 0 { -110 } else { -70 };
            out.extend(engine.process_cell(&cell(i % 4, dbm, start + TimeDelta::seconds(i as i64))));
        }
        out
    };
    assert_eq!(run(), run());
}

#[test]
fn test_feed_replay_end_to_end() {
    let lines = [
        r#"{"type":"network","generation":"4G","observed_at":"2024-03-01T08:00:00+00:00"}"#,
        r#"{"type":"cell","cell_id":1,"area_code":2,"country_code":208,"network_code":10,"radio_generation":"4G","signal_strength_dbm":-85,"observed_at":"2024-03-01T08:00:01+00:00"}"#,
        r#"{"type":"network","generation":"2G","observed_at":"2024-03-01T08:00:02+00:00"}"#,
        r#"{"type":"sms","message_class":-1,"protocol_id":64,"has_text_body":false,"has_binary_payload":false,"received_at":"2024-03-01T08:00:03+00:00"}"#,
    ];
    let mut engine = Engine::new(
        EngineConfig::default(),
        MemoryTowerStore::default(),
        MemoryEventLog::default(),
    );
    let mut all = Vec::new();
    for line in lines {
        let record: ObservationRecord = serde_json::from_str(line).unwrap();
        all.extend(engine.process(record).unwrap());
    }
    assert_eq!(
        kinds(&all),
        vec![
            AnomalyKind::UnknownTower,
            AnomalyKind::NetworkDowngrade2G,
            AnomalyKind::SilentSmsType0
        ]
    );
    let now: DateTime<Local> = "2024-03-01T08:05:00+00:00".parse().unwrap();
    let threat = engine.threat(now).unwrap();
    assert_eq!(threat.level, Severity::Critical);
    assert_eq!(threat.contributing_event_count, 3);
    assert_eq!(engine.observation_count(), 4);
}
