use std::{
    cmp::min,
    collections::HashMap,
    time::{Duration, Instant},
};

use log::{error, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

#[derive(Hash, Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub enum NotificationType {
    /// A single anomaly at or above the engine's notify threshold
    Anomaly,
    /// The aggregated threat level went up
    ThreatLevel,
}

pub struct Notification {
    notification_type: NotificationType,
    message: String,
    debounce: Option<Duration>,
}

impl Notification {
    pub fn new(
        notification_type: NotificationType,
        message: String,
        debounce: Option<Duration>,
    ) -> Self {
        Notification {
            notification_type,
            message,
            debounce,
        }
    }
}

struct NotificationStatus {
    message: String,
    needs_sending: bool,
    last_sent: Option<Instant>,
    last_attempt: Option<Instant>,
    failed_since_last_success: u32,
}

pub struct NotificationService {
    url: Option<String>,
    tx: mpsc::Sender<Notification>,
    rx: mpsc::Receiver<Notification>,
}

impl NotificationService {
    pub fn new(url: Option<String>) -> Self {
        let (tx, rx) = mpsc::channel(10);
        Self { url, tx, rx }
    }

    pub fn new_handler(&self) -> mpsc::Sender<Notification> {
        self.tx.clone()
    }
}

/// Queue a notification without waiting. Anomalies are raised from the
/// engine's synchronous listener, so a full queue drops the message.
pub fn try_notify(sender: &mpsc::Sender<Notification>, notification: Notification) {
    if let Err(err) = sender.try_send(notification) {
        warn!("dropping notification: {err}");
    }
}

pub async fn send_notification(
    http_client: &reqwest::Client,
    url: &str,
    message: String,
) -> Result<(), reqwest::Error> {
    http_client
        .post(url)
        .body(message)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

pub fn run_notification_worker(
    task_tracker: &TaskTracker,
    notification_service: NotificationService,
    enabled_notifications: Vec<NotificationType>,
) -> JoinHandle<()> {
    let NotificationService { url, tx, mut rx } = notification_service;
    // only handlers handed out by new_handler keep the worker alive
    drop(tx);

    task_tracker.spawn(async move {
        if let Some(url) = url
            && !url.is_empty()
        {
            let mut notification_statuses = HashMap::new();
            let http_client = reqwest::Client::new();

            loop {
                // Get any notifications since the last time we checked
                loop {
                    match rx.try_recv() {
                        Ok(notification) => {
                            if !enabled_notifications.contains(&notification.notification_type) {
                                continue;
                            }

                            let status = notification_statuses
                                .entry(notification.notification_type)
                                .or_insert_with(|| NotificationStatus {
                                    message: "".to_string(),
                                    needs_sending: true,
                                    last_sent: None,
                                    last_attempt: None,
                                    failed_since_last_success: 0,
                                });
                            // Ignore if we're in the debounce period
                            if let Some(debounce) = notification.debounce
                                && let Some(last_sent) = status.last_sent
                                && last_sent.elapsed() < debounce
                            {
                                continue;
                            }
                            status.message = notification.message;
                            status.needs_sending = true;
                        }
                        Err(TryRecvError::Empty) => {
                            break;
                        }
                        Err(TryRecvError::Disconnected) => {
                            return;
                        }
                    }
                }

                // Attempt to send pending notifications
                for notification in notification_statuses.values_mut() {
                    if !notification.needs_sending {
                        continue;
                    }

                    // Backoff retries, up to a maximum of 256 seconds.
                    if let Some(last_attempt) = notification.last_attempt {
                        let min_wait_time = Duration::from_secs(
                            2u64.pow(min(notification.failed_since_last_success, 8)),
                        );
                        if last_attempt.elapsed() < min_wait_time {
                            continue;
                        }
                    }

                    match send_notification(&http_client, &url, notification.message.clone())
                        .await
                    {
                        Ok(()) => {
                            notification.last_sent = Some(Instant::now());
                            notification.failed_since_last_success = 0;
                            notification.needs_sending = false;
                        }
                        Err(e) => {
                            error!("Failed to send notification to ntfy: {e}");
                            notification.failed_since_last_success += 1;
                            notification.last_attempt = Some(Instant::now());
                        }
                    }
                }

                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
        // If there's no url to send to we'll just discard the notifications
        else {
            while rx.recv().await.is_some() {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_worker_without_url_exits_when_handlers_drop() {
        let task_tracker = TaskTracker::new();
        let service = NotificationService::new(None);
        let handler = service.new_handler();
        let worker = run_notification_worker(&task_tracker, service, vec![]);

        try_notify(
            &handler,
            Notification::new(NotificationType::Anomaly, "hi".to_string(), None),
        );
        drop(handler);
        worker.await.unwrap();
    }

    #[test]
    fn test_try_notify_drops_when_full() {
        let service = NotificationService::new(None);
        let handler = service.new_handler();
        for i in 0..20 {
            try_notify(
                &handler,
                Notification::new(NotificationType::ThreatLevel, format!("{i}"), None),
            );
        }
        assert_eq!(handler.capacity(), 0);
    }
}
