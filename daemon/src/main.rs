use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use log::{error, info};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use towerwatch::store::DEFAULT_EVENT_CAPACITY;
use towerwatch_daemon::config::{self, parse_args, parse_config};
use towerwatch_daemon::error::DaemonError;
use towerwatch_daemon::event_log::EventLog;
use towerwatch_daemon::notifications::{NotificationService, run_notification_worker};
use towerwatch_daemon::server::{
    ServerState, dismiss_event, get_config, get_events, get_metadata, get_observations,
    get_threat, get_time, get_towers, set_config, set_time_offset, test_notification,
};
use towerwatch_daemon::source::run_observation_source;
use towerwatch_daemon::tower_db::TowerDb;
use towerwatch_daemon::worker::{EngineStatus, build_engine, run_engine_worker};

type AppRouter = Router<Arc<ServerState>>;

fn get_router() -> AppRouter {
    Router::new()
        .route("/api/threat", get(get_threat))
        .route("/api/observations", get(get_observations))
        .route("/api/events", get(get_events))
        .route("/api/events/{id}/dismiss", post(dismiss_event))
        .route("/api/towers", get(get_towers))
        .route("/api/metadata", get(get_metadata))
        .route("/api/config", get(get_config))
        .route("/api/config", post(set_config))
        .route("/api/test-notification", post(test_notification))
        .route("/api/time", get(get_time))
        .route("/api/time-offset", post(set_time_offset))
}

// Runs the axum server until the shutdown token fires
async fn run_server(
    task_tracker: &TaskTracker,
    state: Arc<ServerState>,
    shutdown_token: CancellationToken,
) -> Result<JoinHandle<()>, DaemonError> {
    info!("spinning up server");
    let port = state.config.port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|err| DaemonError::BindError(port, err))?;
    let app = get_router().with_state(state);

    Ok(task_tracker.spawn(async move {
        info!("listening on {addr}");
        let shutdown = async move {
            shutdown_token.cancelled().await;
            info!("Server received shutdown signal, exiting...");
        };
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("server error: {err}");
        }
    }))
}

// Start a thread that'll track when user hits ctrl+c or a config change asks
// for a restart. Either way, every other task is told to shut down.
fn run_shutdown_thread(
    task_tracker: &TaskTracker,
    daemon_restart_token: CancellationToken,
    should_restart_flag: Arc<AtomicBool>,
    shutdown_token: CancellationToken,
) -> JoinHandle<()> {
    info!("create shutdown thread");

    task_tracker.spawn(async move {
        select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(err) = res {
                    error!("Unable to listen for shutdown signal: {err}");
                }

                should_restart_flag.store(false, Ordering::Relaxed);
            }
            _ = daemon_restart_token.cancelled() => {
                should_restart_flag.store(true, Ordering::Relaxed);
            }
            // something else already asked for shutdown
            _ = shutdown_token.cancelled() => {}
        };

        shutdown_token.cancel();
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), DaemonError> {
    env_logger::init();

    #[cfg(feature = "rustcrypto-tls")]
    rustls_rustcrypto::provider()
        .install_default()
        .expect("Couldn't install rustcrypto provider");

    let args = parse_args();

    loop {
        let config = parse_config(&args.config_path).await?;
        if !run_with_config(&args, config).await? {
            return Ok(());
        }
        info!("restarting with new config");
    }
}

async fn run_with_config(
    args: &config::Args,
    config: config::Config,
) -> Result<bool, DaemonError> {
    // TaskTrackers give us an interface to spawn tokio threads, and then
    // eventually await all of them ending
    let task_tracker = TaskTracker::new();
    info!("towerwatch {} starting", env!("CARGO_PKG_VERSION"));

    let towers = TowerDb::open(&config.data_path, config.engine.trust_policy()).await?;
    let feed_offset = towers.feed_offset(&config.observation_source);
    let events = EventLog::open(&config.data_path, DEFAULT_EVENT_CAPACITY).await?;
    let notification_service = NotificationService::new(config.ntfy_url.clone());
    let engine = build_engine(
        config.engine.clone(),
        towers,
        events,
        notification_service.new_handler(),
    );
    let window = engine.window_snapshot();

    let (observations_tx, observations_rx) = mpsc::channel(64);
    let (worker_tx, worker_rx) = mpsc::channel(8);
    let status_lock = Arc::new(RwLock::new(EngineStatus::new()));
    let shutdown_token = CancellationToken::new();
    let daemon_restart_token = CancellationToken::new();
    let should_restart_flag = Arc::new(AtomicBool::new(false));

    info!("Starting engine worker");
    run_engine_worker(
        &task_tracker,
        engine,
        observations_rx,
        worker_rx,
        status_lock.clone(),
        Duration::from_secs(config.scan_interval_secs),
        notification_service.new_handler(),
        shutdown_token.clone(),
    );
    run_observation_source(
        &task_tracker,
        config.observation_source.clone(),
        feed_offset,
        observations_tx,
        shutdown_token.clone(),
    );
    run_notification_worker(
        &task_tracker,
        notification_service,
        config.enabled_notifications.clone(),
    );
    run_shutdown_thread(
        &task_tracker,
        daemon_restart_token.clone(),
        should_restart_flag.clone(),
        shutdown_token.clone(),
    );

    let state = Arc::new(ServerState {
        config_path: args.config_path.clone(),
        config,
        status_lock,
        window,
        worker_sender: worker_tx,
        daemon_restart_token,
    });
    let server = run_server(&task_tracker, state, shutdown_token.clone()).await;

    if server.is_err() {
        shutdown_token.cancel();
    }
    task_tracker.close();
    task_tracker.wait().await;
    server?;

    info!("towerwatch stopped");
    Ok(should_restart_flag.load(Ordering::Relaxed))
}
