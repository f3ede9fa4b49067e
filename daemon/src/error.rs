use thiserror::Error;

use crate::event_log::EventLogError;
use crate::tower_db::TowerDbError;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Config file parsing error: {0}")]
    ConfigFileParsingError(#[from] toml::de::Error),
    #[error("Tokio error: {0}")]
    TokioError(#[from] tokio::io::Error),
    #[error("Tower database error: {0}")]
    TowerDbError(#[from] TowerDbError),
    #[error("Event log error: {0}")]
    EventLogError(#[from] EventLogError),
    #[error("Couldn't bind to port {0}: {1}")]
    BindError(u16, tokio::io::Error),
}
