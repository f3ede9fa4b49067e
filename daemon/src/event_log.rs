use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, BufReader};

use towerwatch::analysis::analyzer::AnomalyEvent;
use towerwatch::ndjson_writer::NdjsonWriter;
use towerwatch::store::{EventId, EventSink, MemoryEventLog, RecordedEvent, StoreError};

const EVENT_LOG_FILENAME: &str = "events.ndjson";

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("Couldn't open event log: {0}")]
    OpenError(tokio::io::Error),
    #[error("Couldn't read event log: {0}")]
    ReadError(tokio::io::Error),
    #[error("Couldn't write event log: {0}")]
    WriteError(tokio::io::Error),
}

/// A line of `events.ndjson`. Dismissals are appended rather than rewriting
/// the original entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventLogEntry {
    Recorded(RecordedEvent),
    Dismissed { id: EventId },
}

/// Event sink backed by an append-only NDJSON file. The most recent events
/// are kept in memory; new lines are buffered until [EventLog::flush].
pub struct EventLog {
    pub path: PathBuf,
    events: MemoryEventLog,
    pending: Vec<EventLogEntry>,
    writer: NdjsonWriter,
}

impl EventLog {
    /// Open the log in `dir`, replaying whatever is already there.
    pub async fn open<P>(dir: P, capacity: usize) -> Result<Self, EventLogError>
    where
        P: AsRef<Path>,
    {
        fs::create_dir_all(&dir)
            .await
            .map_err(EventLogError::OpenError)?;
        let path = dir.as_ref().join(EVENT_LOG_FILENAME);
        let mut events = MemoryEventLog::new(capacity);

        if fs::try_exists(&path)
            .await
            .map_err(EventLogError::OpenError)?
        {
            let file = fs::File::open(&path)
                .await
                .map_err(EventLogError::OpenError)?;
            let mut lines = BufReader::new(file).lines();
            let mut line_num = 0;
            while let Some(line) = lines.next_line().await.map_err(EventLogError::ReadError)? {
                line_num += 1;
                match serde_json::from_str::<EventLogEntry>(&line) {
                    Ok(EventLogEntry::Recorded(recorded)) => events.restore(recorded),
                    Ok(EventLogEntry::Dismissed { id }) => {
                        // the event may have aged out of memory already
                        let _ = events.dismiss(id);
                    }
                    Err(err) => warn!("skipping event log line {line_num}: {err}"),
                }
            }
            info!("replayed {} events from {}", events.len(), path.display());
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(EventLogError::OpenError)?;
        Ok(EventLog {
            path,
            events,
            pending: Vec::new(),
            writer: NdjsonWriter::new(file),
        })
    }

    /// Append buffered entries to disk.
    pub async fn flush(&mut self) -> Result<(), EventLogError> {
        for entry in self.pending.drain(..) {
            self.writer
                .write(&entry)
                .await
                .map_err(EventLogError::WriteError)?;
        }
        self.writer.flush().await.map_err(EventLogError::WriteError)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Every event still held in memory, oldest first.
    pub fn recent(&self) -> Vec<RecordedEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl EventSink for EventLog {
    fn record(&mut self, event: &AnomalyEvent) -> Result<EventId, StoreError> {
        let id = self.events.record(event)?;
        if let Some(recorded) = self.events.get(id) {
            self.pending.push(EventLogEntry::Recorded(recorded.clone()));
        }
        Ok(id)
    }

    fn dismiss(&mut self, id: EventId) -> Result<bool, StoreError> {
        let changed = self.events.dismiss(id)?;
        if changed {
            self.pending.push(EventLogEntry::Dismissed { id });
        }
        Ok(changed)
    }

    fn events_since(&self, start: DateTime<Local>) -> Result<Vec<RecordedEvent>, StoreError> {
        self.events.events_since(start)
    }
}
