use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, try_exists};

use towerwatch::analysis::trust::TrustPolicy;
use towerwatch::observation::TowerIdentity;
use towerwatch::store::{MemoryTowerStore, StoreError, TowerRecord, TowerStore};

const TOWER_DB_FILENAME: &str = "towers.toml";

#[derive(Debug, Error)]
pub enum TowerDbError {
    #[error("Couldn't open directory at path: {0}")]
    OpenDirError(tokio::io::Error),
    #[error("Couldn't read tower database: {0}")]
    ReadError(tokio::io::Error),
    #[error("Couldn't write tower database: {0}")]
    WriteError(tokio::io::Error),
    #[error("Couldn't parse tower database: {0}")]
    ParseError(toml::de::Error),
    #[error("Couldn't serialize tower database: {0}")]
    SerializeError(toml::ser::Error),
}

/// One row of `towers.toml`.
#[derive(Deserialize, Serialize, Clone, PartialEq, Debug)]
pub struct TowerEntry {
    pub cell_id: u64,
    pub area_code: u32,
    pub country_code: u16,
    pub network_code: u16,
    pub times_observed: u64,
    pub first_seen_at: DateTime<Local>,
    pub last_seen_at: DateTime<Local>,
    pub trust_score: f64,
}

/// How far into a file feed the towers in this database have been counted.
#[derive(Deserialize, Serialize, Clone, PartialEq, Eq, Debug)]
pub struct FeedCursor {
    pub source: String,
    /// Byte offset just past the last line handed to the engine.
    pub offset: u64,
}

impl TowerEntry {
    fn new(tower: &TowerIdentity, record: &TowerRecord) -> Self {
        TowerEntry {
            cell_id: tower.cell_id,
            area_code: tower.area_code,
            country_code: tower.country_code,
            network_code: tower.network_code,
            times_observed: record.times_observed,
            first_seen_at: record.first_seen_at,
            last_seen_at: record.last_seen_at,
            trust_score: record.trust_score,
        }
    }

    fn split(self) -> (TowerIdentity, TowerRecord) {
        (
            TowerIdentity {
                cell_id: self.cell_id,
                area_code: self.area_code,
                country_code: self.country_code,
                network_code: self.network_code,
            },
            TowerRecord {
                times_observed: self.times_observed,
                first_seen_at: self.first_seen_at,
                last_seen_at: self.last_seen_at,
                trust_score: self.trust_score,
            },
        )
    }
}

#[derive(Deserialize, Serialize, Default, Debug)]
struct TowerFile {
    #[serde(default)]
    feed: Option<FeedCursor>,
    #[serde(default)]
    towers: Vec<TowerEntry>,
}

/// Tower store persisted as a TOML file. Reads and updates happen in memory;
/// [TowerDb::save] writes the whole table back when something changed.
///
/// The feed cursor is saved in the same file, so sightings and the position
/// they were read up to always land on disk together.
pub struct TowerDb {
    pub path: PathBuf,
    towers: MemoryTowerStore,
    feed: Option<FeedCursor>,
    dirty: bool,
}

impl TowerDb {
    // Returns whether a directory with a tower database exists at the given
    // path (though doesn't check if it's valid)
    pub async fn exists<P>(path: P) -> Result<bool, TowerDbError>
    where
        P: AsRef<Path>,
    {
        let db_path = path.as_ref().join(TOWER_DB_FILENAME);
        let dir_exists = try_exists(path)
            .await
            .map_err(TowerDbError::OpenDirError)?;
        let db_exists = try_exists(db_path)
            .await
            .map_err(TowerDbError::ReadError)?;
        Ok(dir_exists && db_exists)
    }

    pub async fn load<P>(path: P, policy: TrustPolicy) -> Result<Self, TowerDbError>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref().to_path_buf();
        let contents = fs::read_to_string(path.join(TOWER_DB_FILENAME))
            .await
            .map_err(TowerDbError::ReadError)?;
        let file: TowerFile = toml::from_str(&contents).map_err(TowerDbError::ParseError)?;
        let mut towers = MemoryTowerStore::new(policy);
        for entry in file.towers {
            let (tower, record) = entry.split();
            towers.insert(tower, record);
        }
        info!("loaded {} towers from {}", towers.len(), path.display());
        Ok(TowerDb {
            path,
            towers,
            feed: file.feed,
            dirty: false,
        })
    }

    // Creates the data directory and writes an empty database.
    pub async fn create<P>(path: P, policy: TrustPolicy) -> Result<Self, TowerDbError>
    where
        P: AsRef<Path>,
    {
        fs::create_dir_all(&path)
            .await
            .map_err(TowerDbError::OpenDirError)?;
        let mut db = TowerDb {
            path: path.as_ref().to_owned(),
            towers: MemoryTowerStore::new(policy),
            feed: None,
            dirty: true,
        };
        db.save().await?;
        Ok(db)
    }

    pub async fn open<P>(path: P, policy: TrustPolicy) -> Result<Self, TowerDbError>
    where
        P: AsRef<Path>,
    {
        if TowerDb::exists(&path).await? {
            TowerDb::load(path, policy).await
        } else {
            TowerDb::create(path, policy).await
        }
    }

    /// Sorted rows, as written to disk.
    pub fn entries(&self) -> Vec<TowerEntry> {
        self.sorted_entries(|record| record.trust_score)
    }

    /// Sorted rows with each trust score re-evaluated as of `now`, so towers
    /// that haven't been seen lately still pick up their age bonus.
    pub fn entries_at(&self, now: DateTime<Local>) -> Vec<TowerEntry> {
        let policy = *self.towers.policy();
        self.sorted_entries(|record| record.trust_at(&policy, now))
    }

    fn sorted_entries(&self, trust: impl Fn(&TowerRecord) -> f64) -> Vec<TowerEntry> {
        let mut entries: Vec<TowerEntry> = self
            .towers
            .records()
            .map(|(tower, record)| TowerEntry {
                trust_score: trust(record),
                ..TowerEntry::new(tower, record)
            })
            .collect();
        entries.sort_by_key(|e| (e.country_code, e.network_code, e.area_code, e.cell_id));
        entries
    }

    /// Where to resume reading `source`. Any other source starts over.
    pub fn feed_offset(&self, source: &str) -> u64 {
        match &self.feed {
            Some(cursor) if cursor.source == source => cursor.offset,
            _ => 0,
        }
    }

    pub fn advance_feed(&mut self, cursor: FeedCursor) {
        if self.feed.as_ref() != Some(&cursor) {
            self.feed = Some(cursor);
            self.dirty = true;
        }
    }

    pub fn len(&self) -> usize {
        self.towers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.towers.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the table back if anything changed since the last save.
    pub async fn save(&mut self) -> Result<(), TowerDbError> {
        if !self.dirty {
            return Ok(());
        }
        let file = TowerFile {
            feed: self.feed.clone(),
            towers: self.entries(),
        };
        let contents = toml::to_string_pretty(&file).map_err(TowerDbError::SerializeError)?;
        // write next to the real file and rename, so a crash mid-write
        // leaves the previous table intact
        let tmp_path = self.path.join(format!("{TOWER_DB_FILENAME}.tmp"));
        fs::write(&tmp_path, contents)
            .await
            .map_err(TowerDbError::WriteError)?;
        fs::rename(&tmp_path, self.path.join(TOWER_DB_FILENAME))
            .await
            .map_err(TowerDbError::WriteError)?;
        self.dirty = false;
        Ok(())
    }
}

impl TowerStore for TowerDb {
    fn is_tower_known(&self, tower: &TowerIdentity) -> Result<bool, StoreError> {
        self.towers.is_tower_known(tower)
    }

    fn get_tower_record(&self, tower: &TowerIdentity) -> Result<Option<TowerRecord>, StoreError> {
        self.towers.get_tower_record(tower)
    }

    fn record_tower_observation(
        &mut self,
        tower: &TowerIdentity,
        at: DateTime<Local>,
    ) -> Result<TowerRecord, StoreError> {
        let record = self.towers.record_tower_observation(tower, at)?;
        self.dirty = true;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{Builder, TempDir};

    fn make_temp_dir() -> TempDir {
        Builder::new().prefix("tower_db_test").tempdir().unwrap()
    }

    fn tower(cell_id: u64) -> TowerIdentity {
        TowerIdentity {
            cell_id,
            area_code: 4_410,
            country_code: 310,
            network_code: 260,
        }
    }

    #[tokio::test]
    async fn test_load_from_empty_dir() {
        let dir = make_temp_dir();
        assert!(!TowerDb::exists(dir.path()).await.unwrap());
        let db = TowerDb::create(dir.path(), TrustPolicy::default())
            .await
            .unwrap();
        assert!(db.is_empty());
        assert!(TowerDb::exists(dir.path()).await.unwrap());
        let loaded = TowerDb::load(dir.path(), TrustPolicy::default())
            .await
            .unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_sightings_survive_reload() {
        let dir = make_temp_dir();
        let mut db = TowerDb::open(dir.path(), TrustPolicy::default())
            .await
            .unwrap();
        let now = Local::now();
        for _ in 0..12 {
            db.record_tower_observation(&tower(1), now).unwrap();
        }
        db.record_tower_observation(&tower(2), now).unwrap();
        assert!(db.is_dirty());
        db.save().await.unwrap();
        assert!(!db.is_dirty());

        let loaded = TowerDb::open(dir.path(), TrustPolicy::default())
            .await
            .unwrap();
        assert_eq!(loaded.len(), 2);
        let record = loaded.get_tower_record(&tower(1)).unwrap().unwrap();
        assert_eq!(record.times_observed, 12);
        assert_eq!(record.trust_score, 0.6);
        assert!(loaded.is_tower_known(&tower(2)).unwrap());
        assert!(!loaded.is_tower_known(&tower(3)).unwrap());
        assert_eq!(loaded.entries(), db.entries());
    }

    #[tokio::test]
    async fn test_entries_report_trust_as_of_now() {
        let dir = make_temp_dir();
        let mut db = TowerDb::open(dir.path(), TrustPolicy::default())
            .await
            .unwrap();
        let now = Local::now();
        db.record_tower_observation(&tower(1), now - chrono::TimeDelta::days(60))
            .unwrap();

        assert_eq!(db.entries()[0].trust_score, 0.5);
        let live = db.entries_at(now);
        assert!((live[0].trust_score - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_feed_cursor_survives_reload() {
        let dir = make_temp_dir();
        let mut db = TowerDb::open(dir.path(), TrustPolicy::default())
            .await
            .unwrap();
        assert_eq!(db.feed_offset("/tmp/feed.ndjson"), 0);
        db.save().await.unwrap();
        db.advance_feed(FeedCursor {
            source: "/tmp/feed.ndjson".to_string(),
            offset: 512,
        });
        assert!(db.is_dirty());
        db.save().await.unwrap();

        let loaded = TowerDb::open(dir.path(), TrustPolicy::default())
            .await
            .unwrap();
        assert_eq!(loaded.feed_offset("/tmp/feed.ndjson"), 512);
        assert_eq!(loaded.feed_offset("/tmp/other.ndjson"), 0);
    }

    #[tokio::test]
    async fn test_corrupt_database_is_reported() {
        let dir = make_temp_dir();
        fs::write(dir.path().join(TOWER_DB_FILENAME), "towers = 12")
            .await
            .unwrap();
        assert!(matches!(
            TowerDb::load(dir.path(), TrustPolicy::default()).await,
            Err(TowerDbError::ParseError(_))
        ));
    }
}
