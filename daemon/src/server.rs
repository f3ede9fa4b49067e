use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::fs::write;
use tokio::sync::mpsc::Sender;
use tokio::sync::{RwLock, oneshot};
use tokio_util::sync::CancellationToken;

use towerwatch::analysis::analyzer::ReportMetadata;
use towerwatch::analysis::cell_anomaly::WindowSnapshot;
use towerwatch::observation::CellObservation;
use towerwatch::store::{EventId, RecordedEvent, StoreError};

use crate::config::Config;
use crate::tower_db::TowerEntry;
use crate::worker::{EngineStatus, WorkerRequest};

pub struct ServerState {
    pub config_path: String,
    pub config: Config,
    pub status_lock: Arc<RwLock<EngineStatus>>,
    pub window: WindowSnapshot,
    pub worker_sender: Sender<WorkerRequest>,
    pub daemon_restart_token: CancellationToken,
}

// Send a request to the engine worker and wait for its answer
async fn ask_worker<T>(
    state: &ServerState,
    request: impl FnOnce(oneshot::Sender<T>) -> WorkerRequest,
) -> Result<T, (StatusCode, String)> {
    let (tx, rx) = oneshot::channel();
    state.worker_sender.send(request(tx)).await.map_err(|_| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "engine worker is not running".to_string(),
        )
    })?;
    rx.await.map_err(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "engine worker dropped the request".to_string(),
        )
    })
}

pub async fn get_threat(State(state): State<Arc<ServerState>>) -> Json<EngineStatus> {
    Json(state.status_lock.read().await.clone())
}

/// Recent serving-cell observations, newest first.
pub async fn get_observations(
    State(state): State<Arc<ServerState>>,
) -> Json<Vec<CellObservation>> {
    Json(state.window.load().to_vec())
}

pub async fn get_events(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<RecordedEvent>>, (StatusCode, String)> {
    let mut events = ask_worker(&state, WorkerRequest::Events).await?;
    events.reverse();
    Ok(Json(events))
}

pub async fn dismiss_event(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<u64>,
) -> Result<(StatusCode, String), (StatusCode, String)> {
    let id = EventId(id);
    match ask_worker(&state, |tx| WorkerRequest::Dismiss(id, tx)).await? {
        Ok(true) => Ok((StatusCode::OK, format!("dismissed event {id}"))),
        Ok(false) => Ok((StatusCode::OK, format!("event {id} was already dismissed"))),
        Err(StoreError::NoSuchEvent(id)) => Err((
            StatusCode::NOT_FOUND,
            format!("couldn't find event with id {id}"),
        )),
        Err(err) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to dismiss event: {err}"),
        )),
    }
}

pub async fn get_towers(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<TowerEntry>>, (StatusCode, String)> {
    Ok(Json(ask_worker(&state, WorkerRequest::Towers).await?))
}

pub async fn get_metadata(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<ReportMetadata>, (StatusCode, String)> {
    Ok(Json(ask_worker(&state, WorkerRequest::Metadata).await?))
}

pub async fn get_config(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Config>, (StatusCode, String)> {
    Ok(Json(state.config.clone()))
}

pub async fn set_config(
    State(state): State<Arc<ServerState>>,
    Json(config): Json<Config>,
) -> Result<(StatusCode, String), (StatusCode, String)> {
    let config_str = toml::to_string_pretty(&config).map_err(|err| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to serialize config as TOML: {err}"),
        )
    })?;

    write(&state.config_path, config_str).await.map_err(|err| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to write config file: {err}"),
        )
    })?;

    // Trigger daemon restart after writing config
    state.daemon_restart_token.cancel();
    Ok((
        StatusCode::ACCEPTED,
        "wrote config and triggered restart".to_string(),
    ))
}

pub async fn test_notification(
    State(state): State<Arc<ServerState>>,
) -> Result<(StatusCode, String), (StatusCode, String)> {
    let url = state.config.ntfy_url.as_ref().ok_or((
        StatusCode::BAD_REQUEST,
        "No notification URL configured".to_string(),
    ))?;

    if url.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Notification URL is empty".to_string(),
        ));
    }

    let http_client = reqwest::Client::new();
    let message = "Test notification from towerwatch".to_string();

    crate::notifications::send_notification(&http_client, url, message)
        .await
        .map(|()| {
            (
                StatusCode::OK,
                "Test notification sent successfully".to_string(),
            )
        })
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to send test notification: {e}"),
            )
        })
}

/// Response for GET /api/time
#[derive(Serialize)]
pub struct TimeResponse {
    /// The raw system time (without clock offset)
    pub system_time: DateTime<Local>,
    /// The adjusted time (system time + offset)
    pub adjusted_time: DateTime<Local>,
    /// The current offset in seconds
    pub offset_seconds: i64,
}

/// Request for POST /api/time-offset
#[derive(Deserialize)]
pub struct SetTimeOffsetRequest {
    /// The offset to set, in seconds
    pub offset_seconds: i64,
}

pub async fn get_time() -> Json<TimeResponse> {
    let system_time = Local::now();
    let adjusted_time = towerwatch::clock::get_adjusted_now();
    let offset_seconds = adjusted_time
        .signed_duration_since(system_time)
        .num_seconds();
    Json(TimeResponse {
        system_time,
        adjusted_time,
        offset_seconds,
    })
}

pub async fn set_time_offset(
    Json(req): Json<SetTimeOffsetRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let offset = chrono::TimeDelta::try_seconds(req.offset_seconds).ok_or((
        StatusCode::BAD_REQUEST,
        format!("offset of {} seconds is out of range", req.offset_seconds),
    ))?;
    towerwatch::clock::set_offset(offset);
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use towerwatch::analysis::analyzer::{AnomalyEvent, AnomalyKind};

    fn create_test_server_state(
        worker_sender: Sender<WorkerRequest>,
        config_path: String,
    ) -> Arc<ServerState> {
        Arc::new(ServerState {
            config_path,
            config: Config::default(),
            status_lock: Arc::new(RwLock::new(EngineStatus::new())),
            window: WindowSnapshot::default(),
            worker_sender,
            daemon_restart_token: CancellationToken::new(),
        })
    }

    // Answers worker requests from a fixed list of events.
    fn spawn_fake_worker(mut rx: mpsc::Receiver<WorkerRequest>, events: Vec<RecordedEvent>) {
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    WorkerRequest::Events(reply) => {
                        let _ = reply.send(events.clone());
                    }
                    WorkerRequest::Dismiss(id, reply) => {
                        let result = match events.iter().find(|e| e.id == id) {
                            Some(e) => Ok(!e.dismissed),
                            None => Err(StoreError::NoSuchEvent(id)),
                        };
                        let _ = reply.send(result);
                    }
                    WorkerRequest::Towers(reply) => {
                        let _ = reply.send(Vec::new());
                    }
                    WorkerRequest::Metadata(reply) => {
                        let _ = reply.send(ReportMetadata::default());
                    }
                }
            }
        });
    }

    fn recorded(id: u64, dismissed: bool) -> RecordedEvent {
        RecordedEvent {
            id: EventId(id),
            event: AnomalyEvent::new(AnomalyKind::UnknownTower, Local::now(), String::new()),
            dismissed,
        }
    }

    #[tokio::test]
    async fn test_events_newest_first() {
        let (tx, rx) = mpsc::channel(1);
        spawn_fake_worker(rx, vec![recorded(1, false), recorded(2, false)]);
        let state = create_test_server_state(tx, String::new());
        let Json(events) = get_events(State(state)).await.unwrap();
        let ids: Vec<EventId> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![EventId(2), EventId(1)]);
    }

    #[tokio::test]
    async fn test_dismiss_statuses() {
        let (tx, rx) = mpsc::channel(1);
        spawn_fake_worker(rx, vec![recorded(1, false), recorded(2, true)]);
        let state = create_test_server_state(tx, String::new());

        let (status, _) = dismiss_event(State(state.clone()), Path(1)).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        let (status, message) = dismiss_event(State(state.clone()), Path(2)).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(message.contains("already"));
        let (status, _) = dismiss_event(State(state), Path(3)).await.unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_worker_gone_is_unavailable() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let state = create_test_server_state(tx, String::new());
        let (status, _) = get_towers(State(state)).await.unwrap_err();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_out_of_range_time_offset_is_rejected() {
        let (status, _) = set_time_offset(Json(SetTimeOffsetRequest {
            offset_seconds: i64::MAX,
        }))
        .await
        .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_set_config_writes_and_restarts() {
        let dir = tempfile::Builder::new()
            .prefix("server_test")
            .tempdir()
            .unwrap();
        let path = dir.path().join("config.toml");
        let (tx, _rx) = mpsc::channel(1);
        let state = create_test_server_state(tx, path.to_string_lossy().into_owned());

        let config = Config {
            port: 9999,
            ..Config::default()
        };
        let (status, _) = set_config(State(state.clone()), Json(config.clone()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(state.daemon_restart_token.is_cancelled());
        let written = crate::config::parse_config(&path).await.unwrap();
        assert_eq!(written, config);
    }
}
