//! Parsed observation records consumed by the analysis engine.
//!
//! Hosts sample the radio, the SMS inbox and network-type callbacks, then
//! convert what they see into the types in this module. The `Raw*` variants
//! mirror what a platform API hands back (sentinel values included) and are
//! validated through `TryFrom` before anything reaches a classifier.

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Weakest signal we accept as a real reading.
pub const MIN_SIGNAL_DBM: i32 = -150;
/// Strongest signal we accept as a real reading.
pub const MAX_SIGNAL_DBM: i32 = 0;

/// Platform APIs report "unavailable" with the integer extremes.
const UNAVAILABLE_SENTINELS: [i32; 2] = [i32::MAX, i32::MIN];

/// Protocol identifier for a Type 0 ("silent") short message.
pub const PROTOCOL_ID_TYPE_0: u8 = 0x40;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObservationError {
    #[error("signal strength is unavailable")]
    SignalUnavailable,
    #[error("signal strength {0} dBm is outside the accepted range")]
    SignalOutOfRange(i32),
    #[error("message class {0} is out of range")]
    InvalidMessageClass(i32),
    #[error("protocol identifier {0} does not fit in a byte")]
    InvalidProtocolId(i32),
}

/// Cellular technology generation of the serving cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RadioGeneration {
    #[serde(rename = "2G", alias = "GSM", alias = "GPRS", alias = "EDGE")]
    Gen2,
    #[serde(rename = "3G", alias = "UMTS", alias = "HSPA", alias = "WCDMA")]
    Gen3,
    #[serde(rename = "4G", alias = "LTE")]
    Gen4,
    #[serde(rename = "5G", alias = "NR")]
    Gen5,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl RadioGeneration {
    /// Ordering used for downgrade detection. `Unknown` ranks 0 and is never
    /// compared.
    pub fn rank(self) -> u8 {
        match self {
            RadioGeneration::Gen2 => 2,
            RadioGeneration::Gen3 => 3,
            RadioGeneration::Gen4 => 4,
            RadioGeneration::Gen5 => 5,
            RadioGeneration::Unknown => 0,
        }
    }

    pub fn is_known(self) -> bool {
        self != RadioGeneration::Unknown
    }
}

impl fmt::Display for RadioGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RadioGeneration::Gen2 => "2G",
            RadioGeneration::Gen3 => "3G",
            RadioGeneration::Gen4 => "4G",
            RadioGeneration::Gen5 => "5G",
            RadioGeneration::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// The tuple that uniquely identifies a tower across operators and areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TowerIdentity {
    pub cell_id: u64,
    pub area_code: u32,
    pub country_code: u16,
    pub network_code: u16,
}

impl fmt::Display for TowerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.country_code, self.network_code, self.area_code, self.cell_id
        )
    }
}

/// A single sighting of the serving cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellObservation {
    pub cell_id: u64,
    pub area_code: u32,
    pub country_code: u16,
    pub network_code: u16,
    pub radio_generation: RadioGeneration,
    pub signal_strength_dbm: i32,
    pub observed_at: DateTime<Local>,
}

impl CellObservation {
    pub fn tower(&self) -> TowerIdentity {
        TowerIdentity {
            cell_id: self.cell_id,
            area_code: self.area_code,
            country_code: self.country_code,
            network_code: self.network_code,
        }
    }
}

/// A serving-cell sample as the platform reports it, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCellObservation {
    pub cell_id: u64,
    pub area_code: u32,
    pub country_code: u16,
    pub network_code: u16,
    #[serde(default)]
    pub radio_generation: RadioGeneration,
    pub signal_strength_dbm: Option<i32>,
    pub observed_at: DateTime<Local>,
}

impl TryFrom<RawCellObservation> for CellObservation {
    type Error = ObservationError;

    fn try_from(raw: RawCellObservation) -> Result<Self, Self::Error> {
        let dbm = raw
            .signal_strength_dbm
            .ok_or(ObservationError::SignalUnavailable)?;
        if UNAVAILABLE_SENTINELS.contains(&dbm) {
            return Err(ObservationError::SignalUnavailable);
        }
        if !(MIN_SIGNAL_DBM..=MAX_SIGNAL_DBM).contains(&dbm) {
            return Err(ObservationError::SignalOutOfRange(dbm));
        }
        Ok(CellObservation {
            cell_id: raw.cell_id,
            area_code: raw.area_code,
            country_code: raw.country_code,
            network_code: raw.network_code,
            radio_generation: raw.radio_generation,
            signal_strength_dbm: dbm,
            observed_at: raw.observed_at,
        })
    }
}

/// A change of serving radio generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTransition {
    pub from_generation: RadioGeneration,
    pub to_generation: RadioGeneration,
    pub occurred_at: DateTime<Local>,
}

impl NetworkTransition {
    fn comparable(&self) -> bool {
        self.from_generation.is_known() && self.to_generation.is_known()
    }

    pub fn is_downgrade(&self) -> bool {
        self.comparable() && self.from_generation.rank() > self.to_generation.rank()
    }

    pub fn is_upgrade(&self) -> bool {
        self.comparable() && self.from_generation.rank() < self.to_generation.rank()
    }

    pub fn is_2g_downgrade(&self) -> bool {
        self.is_downgrade() && self.to_generation == RadioGeneration::Gen2
    }
}

/// Metadata of an inbound short message. The body itself is never kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsObservation {
    /// 0-3, or `None` when the class couldn't be resolved.
    pub message_class: Option<u8>,
    pub protocol_id: Option<u8>,
    pub has_text_body: bool,
    pub has_binary_payload: bool,
    pub sender: Option<String>,
    pub received_at: DateTime<Local>,
}

/// An SMS as reported by the platform, with `-1` standing in for an
/// unresolvable class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSmsObservation {
    pub message_class: i32,
    pub protocol_id: Option<i32>,
    pub has_text_body: bool,
    pub has_binary_payload: bool,
    #[serde(default)]
    pub sender: Option<String>,
    pub received_at: DateTime<Local>,
}

impl TryFrom<RawSmsObservation> for SmsObservation {
    type Error = ObservationError;

    fn try_from(raw: RawSmsObservation) -> Result<Self, Self::Error> {
        let message_class = match raw.message_class {
            -1 => None,
            class @ 0..=3 => Some(class as u8),
            other => return Err(ObservationError::InvalidMessageClass(other)),
        };
        let protocol_id = raw
            .protocol_id
            .map(|pid| u8::try_from(pid).map_err(|_| ObservationError::InvalidProtocolId(pid)))
            .transpose()?;
        Ok(SmsObservation {
            message_class,
            protocol_id,
            has_text_body: raw.has_text_body,
            has_binary_payload: raw.has_binary_payload,
            sender: raw.sender,
            received_at: raw.received_at,
        })
    }
}

/// A WAP push delivery. Hosts receive these through a separate intake path
/// from ordinary SMS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WapPushObservation {
    #[serde(default)]
    pub sender: Option<String>,
    pub received_at: DateTime<Local>,
}

/// One line of an NDJSON observation feed, as written by a capture host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObservationRecord {
    Cell(RawCellObservation),
    /// The platform's current radio generation; transitions are derived from
    /// consecutive readings.
    Network {
        generation: RadioGeneration,
        observed_at: DateTime<Local>,
    },
    Sms(RawSmsObservation),
    WapPush(WapPushObservation),
}

impl ObservationRecord {
    pub fn timestamp(&self) -> DateTime<Local> {
        match self {
            ObservationRecord::Cell(cell) => cell.observed_at,
            ObservationRecord::Network { observed_at, .. } => *observed_at,
            ObservationRecord::Sms(sms) => sms.received_at,
            ObservationRecord::WapPush(push) => push.received_at,
        }
    }
}
