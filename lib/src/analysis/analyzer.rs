use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, Local};
use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};

use crate::util::RuntimeMetadata;

pub const REPORT_VERSION: u32 = 1;

/// The severity of an [AnomalyEvent], and by extension the ordinal threat
/// level reported for a set of events.
///
/// Informational does not result in any alert.
#[derive(
    Serialize, Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive,
)]
#[repr(u8)]
pub enum Severity {
    #[default]
    Informational = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Severity {
    /// The numeric level, 0 through 4.
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// Severities show up both as names (reports) and as bare levels (hand-written
// observation fixtures and config), so accept either.
impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum SeverityHelper {
            Name(String),
            Level(u8),
        }

        match SeverityHelper::deserialize(deserializer)? {
            SeverityHelper::Name(s) => match s.as_str() {
                "Informational" => Ok(Severity::Informational),
                "Low" => Ok(Severity::Low),
                "Medium" => Ok(Severity::Medium),
                "High" => Ok(Severity::High),
                "Critical" => Ok(Severity::Critical),
                _ => Err(D::Error::custom(format!("unknown Severity: {s}"))),
            },
            SeverityHelper::Level(level) => Severity::try_from(level)
                .map_err(|_| D::Error::custom(format!("severity level {level} out of range"))),
        }
    }
}

/// Every category of anomaly the classifiers can emit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnomalyKind {
    UnknownTower,
    SignalAnomaly,
    RapidCellChange,
    NetworkDowngrade2G,
    SilentSmsClass0,
    SilentSmsType0,
    BinarySms,
    WapPush,
}

impl AnomalyKind {
    /// Baseline severity each kind is emitted with.
    pub fn severity(self) -> Severity {
        match self {
            AnomalyKind::SignalAnomaly => Severity::Low,
            AnomalyKind::UnknownTower
            | AnomalyKind::RapidCellChange
            | AnomalyKind::BinarySms
            | AnomalyKind::WapPush => Severity::Medium,
            AnomalyKind::NetworkDowngrade2G | AnomalyKind::SilentSmsClass0 => Severity::High,
            AnomalyKind::SilentSmsType0 => Severity::Critical,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            AnomalyKind::UnknownTower => "Unknown cell tower",
            AnomalyKind::SignalAnomaly => "Signal strength anomaly",
            AnomalyKind::RapidCellChange => "Rapid cell changes",
            AnomalyKind::NetworkDowngrade2G => "Forced 2G downgrade",
            AnomalyKind::SilentSmsClass0 => "Class 0 (flash) SMS",
            AnomalyKind::SilentSmsType0 => "Type 0 (silent) SMS",
            AnomalyKind::BinarySms => "Binary SMS",
            AnomalyKind::WapPush => "WAP push",
        }
    }
}

/// Anomaly events are the only output of the classifiers. They are immutable
/// once produced; hosts store them and feed them back into the threat
/// aggregator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AnomalyEvent {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub occurred_at: DateTime<Local>,
    /// Human-readable context. Never used for decisions.
    pub message: String,
}

impl AnomalyEvent {
    pub fn new(kind: AnomalyKind, occurred_at: DateTime<Local>, message: String) -> Self {
        AnomalyEvent {
            kind,
            severity: kind.severity(),
            occurred_at,
            message,
        }
    }
}

/// A [Classifier] represents one family of heuristics for detecting an IMSI
/// catcher. Classifiers run inside a single worker for the whole lifetime of
/// the host, so keep any state bounded.
pub trait Classifier {
    /// Returns a user-friendly, concise name for your heuristic.
    fn get_name(&self) -> Cow<'_, str>;

    /// Returns a user-friendly description of what your heuristic looks for,
    /// the kinds of [AnomalyEvent] it may emit, and known false-positive
    /// conditions.
    fn get_description(&self) -> Cow<'_, str>;

    /// Returns a version number for this Classifier. This should only ever
    /// increase, and do so whenever its heuristic changes substantially.
    fn get_version(&self) -> u32;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClassifierMetadata {
    pub name: String,
    pub description: String,
    pub version: u32,
}

impl ClassifierMetadata {
    pub fn of(classifier: &dyn Classifier) -> Self {
        ClassifierMetadata {
            name: classifier.get_name().to_string(),
            description: classifier.get_description().to_string(),
            version: classifier.get_version(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ReportMetadata {
    pub classifiers: Vec<ClassifierMetadata>,
    pub towerwatch: RuntimeMetadata,
    // anytime the format of a report changes, bump this by 1
    pub report_version: u32,
}
