//! Local library store backed by redb.
//!
//! Three tables:
//!   records:  media_key → LibraryRecord (JSON)
//!   uploads:  media_key → blake3 hash of the last successfully uploaded state
//!   meta:     small key-value pairs (last sync checkpoint, initial-sync flag,
//!             device id)
//!
//! All user mutations go through this store. "Remove" flips the tombstone
//! flag instead of deleting the row so the deletion can reach the remote
//! backend; the retention cleanup purges it there.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};

use crate::record::{media_key, LibraryRecord, MediaType, StatusCounts, WatchStatus};

pub const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");
pub const UPLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("uploads");
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const META_LAST_SYNC: &str = "last_sync_time";
const META_INITIAL_SYNC: &str = "initial_sync_done";
const META_DEVICE_ID: &str = "device_id";

/// Handle to the local watchfolio library database.
pub struct LibraryDb {
    db: Database,
}

impl LibraryDb {
    /// Open or create the library database at the given path.
    pub fn create(path: &Path) -> Result<Self> {
        let db = Database::create(path)
            .with_context(|| format!("failed to create redb at {}", path.display()))?;
        // Ensure tables exist
        {
            let txn = db.begin_write()?;
            txn.open_table(RECORDS)?;
            txn.open_table(UPLOADS)?;
            txn.open_table(META)?;
            txn.commit()?;
        }
        Ok(Self { db })
    }

    /// Default database path: <data_dir>/watchfolio/library.redb
    pub fn default_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .context("Failed to get data directory")?
            .join("watchfolio");
        std::fs::create_dir_all(&data_dir)
            .context("Failed to create data directory")?;
        Ok(data_dir.join("library.redb"))
    }

    // ── Records ──────────────────────────────────────────────────────

    pub fn get(&self, media_type: MediaType, tmdb_id: u64) -> Result<Option<LibraryRecord>> {
        let key = media_key(media_type, tmdb_id);
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RECORDS)?;
        match table.get(key.as_str())? {
            Some(data) => {
                let record: LibraryRecord = serde_json::from_slice(data.value())
                    .context("corrupt library record in redb")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Write a record as-is. An untombstoned record with no user-visible
    /// state is dropped instead of stored.
    pub fn upsert(&self, record: &LibraryRecord) -> Result<()> {
        let key = record.key();
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(RECORDS)?;
            if record.is_empty_of_user_data() && !record.deleted {
                table.remove(key.as_str())?;
            } else {
                let data = serde_json::to_vec(record)?;
                table.insert(key.as_str(), data.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Tombstone a record. Returns false if it wasn't in the library.
    pub fn remove(&self, media_type: MediaType, tmdb_id: u64, now: DateTime<Utc>) -> Result<bool> {
        match self.get(media_type, tmdb_id)? {
            Some(mut record) => {
                record.deleted = true;
                record.last_updated_at = now;
                let data = serde_json::to_vec(&record)?;
                let key = record.key();
                let txn = self.db.begin_write()?;
                {
                    let mut table = txn.open_table(RECORDS)?;
                    table.insert(key.as_str(), data.as_slice())?;
                }
                txn.commit()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// All records, tombstones included.
    pub fn all(&self) -> Result<Vec<LibraryRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(RECORDS)?;
        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            let record: LibraryRecord = serde_json::from_slice(v.value())
                .context("corrupt library record in redb")?;
            records.push(record);
        }
        Ok(records)
    }

    /// Records the user still sees (tombstones filtered out).
    pub fn active(&self) -> Result<Vec<LibraryRecord>> {
        Ok(self.all()?.into_iter().filter(|r| !r.deleted).collect())
    }

    /// Replace the full record set in one transaction. Callers hand in the
    /// already-merged library; no emptiness filtering happens here.
    pub fn replace_all(&self, records: &[LibraryRecord]) -> Result<()> {
        let txn = self.db.begin_write()?;
        txn.delete_table(RECORDS)?;
        {
            let mut table = txn.open_table(RECORDS)?;
            for record in records {
                let data = serde_json::to_vec(record)?;
                table.insert(record.key().as_str(), data.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn counts(&self) -> Result<StatusCounts> {
        let records = self.active()?;
        Ok(StatusCounts::tally(records.iter()))
    }

    // ── Mutation helpers ─────────────────────────────────────────────
    //
    // Each bumps `last_updated_at` and creates the record on first touch,
    // so rating something that isn't in the library yet adds it.

    pub fn set_status(
        &self,
        media_type: MediaType,
        tmdb_id: u64,
        status: WatchStatus,
        now: DateTime<Utc>,
    ) -> Result<LibraryRecord> {
        self.mutate(media_type, tmdb_id, now, |r| r.status = status)
    }

    pub fn set_favorite(
        &self,
        media_type: MediaType,
        tmdb_id: u64,
        favorite: bool,
        now: DateTime<Utc>,
    ) -> Result<LibraryRecord> {
        self.mutate(media_type, tmdb_id, now, |r| r.is_favorite = favorite)
    }

    pub fn set_rating(
        &self,
        media_type: MediaType,
        tmdb_id: u64,
        rating: Option<f32>,
        now: DateTime<Utc>,
    ) -> Result<LibraryRecord> {
        self.mutate(media_type, tmdb_id, now, |r| r.user_rating = rating)
    }

    pub fn set_notes(
        &self,
        media_type: MediaType,
        tmdb_id: u64,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<LibraryRecord> {
        self.mutate(media_type, tmdb_id, now, |r| r.notes = notes)
    }

    fn mutate(
        &self,
        media_type: MediaType,
        tmdb_id: u64,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut LibraryRecord),
    ) -> Result<LibraryRecord> {
        let mut record = self
            .get(media_type, tmdb_id)?
            .unwrap_or_else(|| LibraryRecord::new(media_type, tmdb_id, now));
        apply(&mut record);
        record.deleted = false;
        record.last_updated_at = now;
        self.upsert(&record)?;
        Ok(record)
    }

    // ── Upload dedup hashes ──────────────────────────────────────────

    pub fn last_uploaded_hash(&self, key: &str) -> Result<Option<[u8; 32]>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(UPLOADS)?;
        match table.get(key)? {
            Some(data) => {
                let bytes: [u8; 32] = data
                    .value()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("corrupt upload hash for {}", key))?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    pub fn set_last_uploaded_hash(&self, key: &str, hash: &[u8; 32]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(UPLOADS)?;
            table.insert(key, hash.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    // ── Meta ─────────────────────────────────────────────────────────

    pub fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        match self.meta_get(META_LAST_SYNC)? {
            Some(bytes) => {
                let s = String::from_utf8(bytes).context("corrupt last-sync timestamp")?;
                let ts = DateTime::parse_from_rfc3339(&s)
                    .context("corrupt last-sync timestamp")?
                    .with_timezone(&Utc);
                Ok(Some(ts))
            }
            None => Ok(None),
        }
    }

    pub fn set_last_sync_time(&self, now: DateTime<Utc>) -> Result<()> {
        self.meta_set(META_LAST_SYNC, now.to_rfc3339().as_bytes())
    }

    pub fn initial_sync_done(&self) -> Result<bool> {
        Ok(self.meta_get(META_INITIAL_SYNC)?.is_some())
    }

    pub fn mark_initial_sync_done(&self) -> Result<()> {
        self.meta_set(META_INITIAL_SYNC, &[1])
    }

    /// Stable per-device identifier, derived from the hostname on first use.
    pub fn device_id(&self) -> Result<String> {
        if let Some(bytes) = self.meta_get(META_DEVICE_ID)? {
            return String::from_utf8(bytes).context("corrupt device id");
        }
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".to_string());
        let id = format!("{}-{}", host, std::process::id());
        self.meta_set(META_DEVICE_ID, id.as_bytes())?;
        Ok(id)
    }

    fn meta_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn meta_set(&self, key: &str, value: &[u8]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(META)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, LibraryDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = LibraryDb::create(&dir.path().join("library.redb")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_mutation_creates_and_updates() {
        let (_dir, db) = open_temp();
        let now = Utc::now();

        let record = db
            .set_status(MediaType::Movie, 603, WatchStatus::Watching, now)
            .unwrap();
        assert_eq!(record.status, WatchStatus::Watching);
        assert_eq!(record.added_at, now);

        let later = now + chrono::Duration::seconds(10);
        let record = db.set_favorite(MediaType::Movie, 603, true, later).unwrap();
        assert!(record.is_favorite);
        assert_eq!(record.added_at, now);
        assert_eq!(record.last_updated_at, later);

        let stored = db.get(MediaType::Movie, 603).unwrap().unwrap();
        assert_eq!(stored.status, WatchStatus::Watching);
        assert!(stored.is_favorite);
    }

    #[test]
    fn test_empty_record_is_dropped() {
        let (_dir, db) = open_temp();
        let now = Utc::now();

        db.set_favorite(MediaType::Tv, 1399, true, now).unwrap();
        assert!(db.get(MediaType::Tv, 1399).unwrap().is_some());

        // Unfavoriting the only state drops the row entirely
        db.set_favorite(MediaType::Tv, 1399, false, now).unwrap();
        assert!(db.get(MediaType::Tv, 1399).unwrap().is_none());
    }

    #[test]
    fn test_remove_tombstones_instead_of_deleting() {
        let (_dir, db) = open_temp();
        let now = Utc::now();

        db.set_status(MediaType::Movie, 550, WatchStatus::Completed, now)
            .unwrap();
        let later = now + chrono::Duration::seconds(5);
        assert!(db.remove(MediaType::Movie, 550, later).unwrap());

        let stored = db.get(MediaType::Movie, 550).unwrap().unwrap();
        assert!(stored.deleted);
        assert_eq!(stored.last_updated_at, later);

        // Tombstones are still in `all` but not `active`
        assert_eq!(db.all().unwrap().len(), 1);
        assert!(db.active().unwrap().is_empty());

        // Removing something absent reports false
        assert!(!db.remove(MediaType::Movie, 999, later).unwrap());
    }

    #[test]
    fn test_mutation_revives_tombstone() {
        let (_dir, db) = open_temp();
        let now = Utc::now();

        db.set_status(MediaType::Movie, 550, WatchStatus::Dropped, now)
            .unwrap();
        db.remove(MediaType::Movie, 550, now).unwrap();

        let record = db
            .set_status(MediaType::Movie, 550, WatchStatus::Watching, now)
            .unwrap();
        assert!(!record.deleted);
        assert_eq!(db.active().unwrap().len(), 1);
    }

    #[test]
    fn test_replace_all() {
        let (_dir, db) = open_temp();
        let now = Utc::now();

        db.set_status(MediaType::Movie, 1, WatchStatus::Watching, now)
            .unwrap();
        db.set_status(MediaType::Movie, 2, WatchStatus::Completed, now)
            .unwrap();

        let mut replacement = LibraryRecord::new(MediaType::Tv, 3, now);
        replacement.status = WatchStatus::WillWatch;
        db.replace_all(&[replacement]).unwrap();

        let all = db.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].tmdb_id, 3);

        // An empty replacement empties the library
        db.replace_all(&[]).unwrap();
        assert!(db.all().unwrap().is_empty());
    }

    #[test]
    fn test_counts_skip_tombstones() {
        let (_dir, db) = open_temp();
        let now = Utc::now();

        db.set_status(MediaType::Movie, 1, WatchStatus::Watching, now)
            .unwrap();
        db.set_status(MediaType::Movie, 2, WatchStatus::Watching, now)
            .unwrap();
        db.set_favorite(MediaType::Tv, 3, true, now).unwrap();
        db.remove(MediaType::Movie, 2, now).unwrap();

        let counts = db.counts().unwrap();
        assert_eq!(counts.all, 2);
        assert_eq!(counts.watching, 1);
        assert_eq!(counts.favorites, 1);
    }

    #[test]
    fn test_upload_hashes() {
        let (_dir, db) = open_temp();
        let now = Utc::now();

        let record = db
            .set_status(MediaType::Movie, 603, WatchStatus::Watching, now)
            .unwrap();
        let key = record.key();
        assert!(db.last_uploaded_hash(&key).unwrap().is_none());

        let hash = record.content_hash();
        db.set_last_uploaded_hash(&key, &hash).unwrap();
        assert_eq!(db.last_uploaded_hash(&key).unwrap(), Some(hash));
    }

    #[test]
    fn test_meta_checkpoints() {
        let (_dir, db) = open_temp();

        assert!(db.last_sync_time().unwrap().is_none());
        assert!(!db.initial_sync_done().unwrap());

        let now = Utc::now();
        db.set_last_sync_time(now).unwrap();
        let stored = db.last_sync_time().unwrap().unwrap();
        assert_eq!(stored.timestamp(), now.timestamp());

        db.mark_initial_sync_done().unwrap();
        assert!(db.initial_sync_done().unwrap());

        let id = db.device_id().unwrap();
        assert!(!id.is_empty());
        assert_eq!(db.device_id().unwrap(), id);
    }
}
