use std::io::SeekFrom;

use log::{debug, error, info, warn};
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::select;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use towerwatch::observation::ObservationRecord;

use crate::tower_db::FeedCursor;

pub const STDIN_SOURCE: &str = "-";

/// One parsed feed line. File feeds carry the position just past the line,
/// so the worker can save how far it got.
#[derive(Debug)]
pub struct FeedRecord {
    pub record: ObservationRecord,
    pub cursor: Option<FeedCursor>,
}

/// Read NDJSON observation records from `reader` and forward them until EOF,
/// cancellation, or the receiver going away. Malformed lines are skipped.
/// `source` names a file feed whose reader starts at byte `offset`, and is
/// `None` for stdin. Returns how many records were forwarded.
pub async fn forward_observations<R>(
    mut reader: R,
    source: Option<&str>,
    mut offset: u64,
    tx: &Sender<FeedRecord>,
    cancel: &CancellationToken,
) -> Result<usize, tokio::io::Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut line_num = 0;
    let mut forwarded = 0;
    loop {
        line.clear();
        let read = select! {
            _ = cancel.cancelled() => break,
            read = reader.read_line(&mut line) => read?,
        };
        if read == 0 {
            break;
        }
        // a final line without its newline may still be growing
        if !line.ends_with('\n') && source.is_some() {
            debug!("leaving partial line at offset {offset} for later");
            break;
        }
        offset += read as u64;
        line_num += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ObservationRecord>(&line) {
            Ok(record) => {
                let cursor = source.map(|source| FeedCursor {
                    source: source.to_string(),
                    offset,
                });
                if tx.send(FeedRecord { record, cursor }).await.is_err() {
                    debug!("observation receiver closed, stopping feed");
                    break;
                }
                forwarded += 1;
            }
            Err(err) => warn!("skipping malformed observation on line {line_num}: {err}"),
        }
    }
    Ok(forwarded)
}

// Open a file feed positioned at `offset`. A file shorter than the saved
// offset was replaced or truncated, so read it from the start.
async fn open_feed(source: &str, offset: u64) -> Result<(BufReader<File>, u64), tokio::io::Error> {
    let mut file = File::open(source).await?;
    let len = file.metadata().await?.len();
    let offset = if offset > len {
        warn!("{source} is shorter than the saved position {offset}, reading from the start");
        0
    } else {
        offset
    };
    file.seek(SeekFrom::Start(offset)).await?;
    Ok((BufReader::new(file), offset))
}

/// Spawn the feed task for `source`, a file path or `-` for stdin. File feeds
/// resume at byte `offset`.
pub fn run_observation_source(
    task_tracker: &TaskTracker,
    source: String,
    offset: u64,
    tx: Sender<FeedRecord>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    task_tracker.spawn(async move {
        let result = if source == STDIN_SOURCE {
            info!("reading observations from stdin");
            let stdin = BufReader::new(tokio::io::stdin());
            forward_observations(stdin, None, 0, &tx, &cancel).await
        } else {
            match open_feed(&source, offset).await {
                Ok((reader, offset)) => {
                    info!("reading observations from {source} at byte {offset}");
                    forward_observations(reader, Some(&source), offset, &tx, &cancel).await
                }
                Err(err) => Err(err),
            }
        };
        match result {
            Ok(count) => info!("observation feed ended after {count} records"),
            Err(err) => error!("observation feed {source} failed: {err}"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::Builder;
    use tokio::sync::mpsc;

    const WAP: &str = r#"{"type":"wap_push","received_at":"2024-05-01T12:00:00+00:00"}"#;
    const NETWORK: &str =
        r#"{"type":"network","generation":"3G","observed_at":"2024-05-01T12:00:01+00:00"}"#;

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let gps = r#"{"type":"gps","lat":1.0}"#;
        let feed = format!("{WAP}\nthis is not json\n\n{gps}\n{NETWORK}\n");
        let (tx, mut rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        let count = forward_observations(feed.as_bytes(), None, 0, &tx, &cancel)
            .await
            .unwrap();
        assert_eq!(count, 2);
        let first = rx.recv().await.unwrap();
        assert!(matches!(first.record, ObservationRecord::WapPush(_)));
        assert!(first.cursor.is_none());
        assert!(matches!(
            rx.recv().await.unwrap().record,
            ObservationRecord::Network { .. }
        ));
    }

    #[tokio::test]
    async fn test_file_feed_offsets() {
        let feed = format!("{WAP}\n{NETWORK}\n{WAP}");
        let (tx, mut rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        let count = forward_observations(feed.as_bytes(), Some("feed.ndjson"), 100, &tx, &cancel)
            .await
            .unwrap();
        // the unterminated last line is left for a later read
        assert_eq!(count, 2);
        let first = rx.recv().await.unwrap().cursor.unwrap();
        assert_eq!(first.source, "feed.ndjson");
        assert_eq!(first.offset, 100 + WAP.len() as u64 + 1);
        let second = rx.recv().await.unwrap().cursor.unwrap();
        assert_eq!(second.offset, 100 + (WAP.len() + NETWORK.len()) as u64 + 2);
    }

    #[tokio::test]
    async fn test_open_feed_resumes_or_restarts() {
        let dir = Builder::new().prefix("source_test").tempdir().unwrap();
        let path = dir.path().join("feed.ndjson");
        tokio::fs::write(&path, format!("{WAP}\n{NETWORK}\n"))
            .await
            .unwrap();
        let path = path.to_string_lossy().into_owned();

        let resume_at = WAP.len() as u64 + 1;
        let (mut reader, offset) = open_feed(&path, resume_at).await.unwrap();
        assert_eq!(offset, resume_at);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end(), NETWORK);

        let (_, offset) = open_feed(&path, 1_000_000).await.unwrap();
        assert_eq!(offset, 0);
    }

    #[tokio::test]
    async fn test_cancelled_feed_stops() {
        let (tx, _rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (reader, _writer) = tokio::io::duplex(64);
        let count = forward_observations(BufReader::new(reader), None, 0, &tx, &cancel)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
