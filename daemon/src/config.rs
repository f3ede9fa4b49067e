use log::warn;
use serde::{Deserialize, Serialize};

use towerwatch::analysis::engine::EngineConfig;

use crate::error::DaemonError;
use crate::notifications::NotificationType;

/// The structure of a valid towerwatch configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Directory holding the tower database and event log
    pub data_path: String,
    /// NDJSON observation feed, or "-" for stdin
    pub observation_source: String,
    /// Listening port
    pub port: u16,
    /// Seconds between threat recomputations and state saves
    pub scan_interval_secs: u64,
    /// ntfy.sh URL
    pub ntfy_url: Option<String>,
    /// Vector containing the types of enabled notifications
    pub enabled_notifications: Vec<NotificationType>,
    /// Classifier thresholds and trust policy
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_path: "/data/towerwatch".to_string(),
            observation_source: "-".to_string(),
            port: 8080,
            scan_interval_secs: 10,
            ntfy_url: None,
            enabled_notifications: vec![NotificationType::Anomaly, NotificationType::ThreatLevel],
            engine: EngineConfig::default(),
        }
    }
}

pub async fn parse_config<P>(path: P) -> Result<Config, DaemonError>
where
    P: AsRef<std::path::Path>,
{
    if let Ok(config_file) = tokio::fs::read_to_string(&path).await {
        Ok(toml::from_str(&config_file).map_err(DaemonError::ConfigFileParsingError)?)
    } else {
        warn!("unable to read config file, using default config");
        Ok(Config::default())
    }
}

pub struct Args {
    pub config_path: String,
}

pub fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        println!("Usage: {} /path/to/config/file", args[0]);
        std::process::exit(1);
    }
    Args {
        config_path: args[1].clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::Builder;

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = Builder::new().prefix("config_test").tempdir().unwrap();
        let config = parse_config(dir.path().join("nope.toml")).await.unwrap();
        assert_eq!(config, Config::default());
    }

    #[tokio::test]
    async fn test_partial_config() {
        let dir = Builder::new().prefix("config_test").tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(
            &path,
            r#"
port = 9000
observation_source = "/tmp/feed.ndjson"
enabled_notifications = ["Anomaly"]

[engine]
signal_anomaly_threshold_dbm = 15
notify_min_severity = 3
"#,
        )
        .await
        .unwrap();
        let config = parse_config(&path).await.unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.observation_source, "/tmp/feed.ndjson");
        assert_eq!(config.scan_interval_secs, 10);
        assert_eq!(config.enabled_notifications, vec![NotificationType::Anomaly]);
        assert_eq!(config.engine.signal_anomaly_threshold_dbm, 15);
        assert_eq!(config.engine.notify_min_severity, 3);
        assert_eq!(config.engine.rapid_change_count, 10);
    }

    #[tokio::test]
    async fn test_malformed_config_is_an_error() {
        let dir = Builder::new().prefix("config_test").tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "port = \"eighty\"").await.unwrap();
        assert!(matches!(
            parse_config(&path).await,
            Err(DaemonError::ConfigFileParsingError(_))
        ));
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
