//! Tower trust scoring.
//!
//! A tower's trust grows with how often we've seen it and how long it has
//! been around. A fresh tower starts at a neutral 0.5; repeat sightings add up
//! to 0.3 and age adds up to 0.2.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

pub const BASE_TRUST: f64 = 0.5;
/// Sightings are counted in whole blocks of this size.
pub const OBSERVATIONS_PER_STEP: u64 = 10;
pub const BONUS_PER_OBSERVATION_STEP: f64 = 0.1;
pub const BONUS_PER_MONTH: f64 = 0.1;
pub const DAYS_PER_MONTH: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustLevel {
    Trusted,
    Neutral,
    Suspicious,
}

/// Caps and thresholds applied by the trust scorer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustPolicy {
    pub observation_bonus_cap: f64,
    pub age_bonus_cap: f64,
    pub trusted_threshold: f64,
    pub suspicious_threshold: f64,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        TrustPolicy {
            observation_bonus_cap: 0.3,
            age_bonus_cap: 0.2,
            trusted_threshold: 0.7,
            suspicious_threshold: 0.3,
        }
    }
}

/// Whole 30-day months between `first_seen_at` and `now`. A first sighting
/// in the future (clock skew) counts as age zero.
pub fn age_in_months(first_seen_at: DateTime<Local>, now: DateTime<Local>) -> i64 {
    (now - first_seen_at).num_days().max(0) / DAYS_PER_MONTH
}

impl TrustPolicy {
    pub fn score(
        &self,
        times_observed: u64,
        first_seen_at: DateTime<Local>,
        now: DateTime<Local>,
    ) -> f64 {
        let steps = (times_observed / OBSERVATIONS_PER_STEP) as f64;
        let observation_bonus =
            (steps * BONUS_PER_OBSERVATION_STEP).min(self.observation_bonus_cap.max(0.0));
        let months = age_in_months(first_seen_at, now) as f64;
        let age_bonus = (months * BONUS_PER_MONTH).min(self.age_bonus_cap.max(0.0));
        (BASE_TRUST + observation_bonus + age_bonus).clamp(0.0, 1.0)
    }

    pub fn level(&self, score: f64) -> TrustLevel {
        if score >= self.trusted_threshold {
            TrustLevel::Trusted
        } else if score < self.suspicious_threshold {
            TrustLevel::Suspicious
        } else {
            TrustLevel::Neutral
        }
    }
}

/// Trust score under the default policy.
pub fn compute_trust_score(
    times_observed: u64,
    first_seen_at: DateTime<Local>,
    now: DateTime<Local>,
) -> f64 {
    TrustPolicy::default().score(times_observed, first_seen_at, now)
}
