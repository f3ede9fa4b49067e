pub mod config;
pub mod error;
pub mod event_log;
pub mod notifications;
pub mod server;
pub mod source;
pub mod tower_db;
pub mod worker;
