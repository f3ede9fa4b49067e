//! Global clock offset for adjusting timestamps.
//!
//! Observation timestamps are compared against "now" when aging towers and
//! selecting the threat window. Devices with a wrong system clock can be
//! corrected by setting an offset here; it lives in memory only and is not
//! persisted across restarts.

use chrono::{DateTime, Local, TimeDelta};
use std::sync::RwLock;

static CLOCK_OFFSET: RwLock<TimeDelta> = RwLock::new(TimeDelta::zero());

/// Get the current clock offset.
pub fn get_offset() -> TimeDelta {
    match CLOCK_OFFSET.read() {
        Ok(offset) => *offset,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

/// Set the clock offset.
pub fn set_offset(offset: TimeDelta) {
    match CLOCK_OFFSET.write() {
        Ok(mut current) => *current = offset,
        Err(poisoned) => *poisoned.into_inner() = offset,
    }
}

/// Get the current adjusted time (system time + offset). An offset pushing
/// past the representable range is ignored.
pub fn get_adjusted_now() -> DateTime<Local> {
    let now = Local::now();
    now.checked_add_signed(get_offset()).unwrap_or(now)
}
