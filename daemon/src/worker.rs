use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde::Serialize;
use tokio::select;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use towerwatch::analysis::analyzer::{ReportMetadata, Severity};
use towerwatch::analysis::engine::{Engine, EngineConfig};
use towerwatch::analysis::threat::ThreatSummary;
use towerwatch::clock::get_adjusted_now;
use towerwatch::observation::RadioGeneration;
use towerwatch::store::{EventId, RecordedEvent, StoreError};

use crate::event_log::EventLog;
use crate::notifications::{Notification, NotificationType, try_notify};
use crate::source::FeedRecord;
use crate::tower_db::{TowerDb, TowerEntry};

pub type DaemonEngine = Engine<TowerDb, EventLog>;

const ANOMALY_DEBOUNCE: Duration = Duration::from_secs(5 * 60);

/// What the periodic loop last published for the API.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// Ordinal threat level, 0 through 4.
    pub threat_level: u8,
    pub threat: ThreatSummary,
    pub observations_processed: usize,
    pub last_generation: Option<RadioGeneration>,
}

impl EngineStatus {
    pub fn new() -> Self {
        let now = get_adjusted_now();
        EngineStatus {
            threat_level: Severity::Informational.level(),
            threat: ThreatSummary::empty(now, now),
            observations_processed: 0,
            last_generation: None,
        }
    }
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Queries the HTTP API sends to the worker, each answered over a oneshot.
pub enum WorkerRequest {
    Events(oneshot::Sender<Vec<RecordedEvent>>),
    Dismiss(EventId, oneshot::Sender<Result<bool, StoreError>>),
    Towers(oneshot::Sender<Vec<TowerEntry>>),
    Metadata(oneshot::Sender<ReportMetadata>),
}

/// Build an engine over the daemon's persistent collaborators and route
/// notable events to the notification worker.
pub fn build_engine(
    config: EngineConfig,
    towers: TowerDb,
    events: EventLog,
    notification_tx: Sender<Notification>,
) -> DaemonEngine {
    let mut engine = Engine::new(config, towers, events);
    engine.set_listener(move |event| {
        try_notify(
            &notification_tx,
            Notification::new(
                NotificationType::Anomaly,
                format!("towerwatch: {} ({})", event.kind.title(), event.message),
                Some(ANOMALY_DEBOUNCE),
            ),
        );
    });
    engine
}

struct Worker {
    engine: DaemonEngine,
    status: Arc<RwLock<EngineStatus>>,
    notification_tx: Sender<Notification>,
    last_level: Severity,
}

impl Worker {
    fn handle_record(&mut self, item: FeedRecord) {
        match self.engine.process(item.record) {
            Ok(events) => {
                for event in events {
                    info!(
                        "{} [{}]: {}",
                        event.kind.title(),
                        event.severity,
                        event.message
                    );
                }
            }
            Err(err) => warn!("rejected observation: {err}"),
        }
        if let Some(cursor) = item.cursor {
            self.engine.towers_mut().advance_feed(cursor);
        }
    }

    async fn handle_request(&mut self, request: WorkerRequest) {
        // a dropped reply receiver just means the HTTP client went away
        match request {
            WorkerRequest::Events(reply) => {
                let _ = reply.send(self.engine.sink().recent());
            }
            WorkerRequest::Dismiss(id, reply) => {
                let result = self.engine.dismiss(id);
                if matches!(result, Ok(true)) {
                    info!("event {id} dismissed");
                    self.publish().await;
                }
                let _ = reply.send(result);
            }
            WorkerRequest::Towers(reply) => {
                let _ = reply.send(self.engine.towers().entries_at(get_adjusted_now()));
            }
            WorkerRequest::Metadata(reply) => {
                let _ = reply.send(self.engine.get_metadata());
            }
        }
    }

    /// Recompute the threat summary and publish it.
    async fn publish(&mut self) {
        let threat = match self.engine.threat(get_adjusted_now()) {
            Ok(threat) => threat,
            Err(err) => {
                error!("failed to compute threat level: {err}");
                return;
            }
        };
        if threat.level != self.last_level {
            info!(
                "threat level {} -> {} ({} events)",
                self.last_level, threat.level, threat.contributing_event_count
            );
            if threat.level > self.last_level && threat.is_alarming() {
                try_notify(
                    &self.notification_tx,
                    Notification::new(
                        NotificationType::ThreatLevel,
                        format!(
                            "towerwatch: threat level raised to {} ({} recent events)",
                            threat.level, threat.contributing_event_count
                        ),
                        None,
                    ),
                );
            }
            self.last_level = threat.level;
        }
        let mut status = self.status.write().await;
        status.threat_level = threat.level.level();
        status.threat = threat;
        status.observations_processed = self.engine.observation_count();
        status.last_generation = self.engine.last_generation();
    }

    async fn persist(&mut self) {
        if let Err(err) = self.engine.towers_mut().save().await {
            error!("failed to save tower database: {err}");
        }
        if let Err(err) = self.engine.sink_mut().flush().await {
            error!("failed to flush event log: {err}");
        }
    }

    async fn tick(&mut self) {
        self.publish().await;
        self.persist().await;
    }
}

/// Spawn the single task that owns the engine. It consumes the observation
/// feed and API requests, and every `scan_interval` recomputes the threat
/// summary and saves state. On cancellation it saves once more and exits.
#[allow(clippy::too_many_arguments)]
pub fn run_engine_worker(
    task_tracker: &TaskTracker,
    engine: DaemonEngine,
    mut observations_rx: Receiver<FeedRecord>,
    mut requests_rx: Receiver<WorkerRequest>,
    status: Arc<RwLock<EngineStatus>>,
    scan_interval: Duration,
    notification_tx: Sender<Notification>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    task_tracker.spawn(async move {
        let mut worker = Worker {
            engine,
            status,
            notification_tx,
            last_level: Severity::Informational,
        };
        let mut interval = tokio::time::interval(scan_interval.max(Duration::from_millis(100)));
        let mut feed_open = true;

        loop {
            select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => worker.tick().await,
                record = observations_rx.recv(), if feed_open => match record {
                    Some(record) => worker.handle_record(record),
                    None => {
                        info!("observation feed closed");
                        feed_open = false;
                    }
                },
                Some(request) = requests_rx.recv() => worker.handle_request(request).await,
            }
        }

        info!("engine worker shutting down");
        worker.tick().await;
    })
}
