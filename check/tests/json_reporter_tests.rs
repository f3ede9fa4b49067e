use chrono::{Local, TimeZone};
use serde_json::Value;
use towerwatch::analysis::analyzer::{AnomalyEvent, AnomalyKind, ReportMetadata, Severity};
use towerwatch::analysis::engine::{Engine, EngineConfig};
use towerwatch::store::{MemoryEventLog, MemoryTowerStore};

#[test]
fn test_metadata_serialization() {
    let engine = Engine::new(
        EngineConfig::default(),
        MemoryTowerStore::default(),
        MemoryEventLog::default(),
    );
    let metadata = engine.get_metadata();
    let json: Value = serde_json::to_value(&metadata).unwrap();

    let classifiers = json["classifiers"].as_array().unwrap();
    assert_eq!(classifiers.len(), 3);
    for classifier in classifiers {
        assert!(classifier["name"].is_string());
        assert!(classifier["description"].is_string());
        assert!(classifier["version"].is_u64());
    }
    assert!(json["towerwatch"]["towerwatch_version"].is_string());

    let back: ReportMetadata = serde_json::from_value(json).unwrap();
    assert_eq!(back.classifiers, metadata.classifiers);
}

#[test]
fn test_event_serialization() {
    let at = Local.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap();
    let event = AnomalyEvent::new(
        AnomalyKind::NetworkDowngrade2G,
        at,
        "4G -> 2G".to_string(),
    );
    let json: Value = serde_json::to_value(&event).unwrap();

    assert_eq!(json["kind"], "NetworkDowngrade2G");
    assert_eq!(json["severity"], "High");
    assert_eq!(json["message"], "4G -> 2G");

    let back: AnomalyEvent = serde_json::from_value(json).unwrap();
    assert_eq!(back, event);
    assert_eq!(back.severity, Severity::High);
}
