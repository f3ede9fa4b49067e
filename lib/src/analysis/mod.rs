pub mod analyzer;
pub mod cell_anomaly;
pub mod engine;
pub mod network_transition;
pub mod sms;
pub mod threat;
pub mod trust;
