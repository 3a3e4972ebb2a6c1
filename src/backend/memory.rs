//! In-memory implementation of [`RemoteBackend`].
//!
//! Deterministic stand-in used by the coordinator, cleanup, and onboarding
//! tests: same contract as the HTTP backend, no I/O. Two failure knobs:
//! `set_offline` makes every call fail like a dead network, `set_fail_writes`
//! makes writes fail with a non-network error.

use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Page, PreferencesDoc, ProfileDoc, RemoteBackend, StoredItem, TombstoneRow};
use crate::mapper::{self, LibraryItemDoc, MediaDoc};
use crate::record::{LibraryRecord, MediaType};

struct ItemRow {
    row_id: String,
    library: String,
    media_row: String,
    item: LibraryItemDoc,
}

#[derive(Default)]
struct State {
    libraries: Vec<(String, String)>,
    media: Vec<(String, MediaDoc)>,
    items: Vec<ItemRow>,
    profiles: Vec<(String, ProfileDoc)>,
    preferences: Vec<(String, PreferencesDoc)>,
    next_id: u64,
    offline: bool,
    fail_writes: bool,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn media_row(&self, media_type: MediaType, tmdb_id: u64) -> Option<&(String, MediaDoc)> {
        self.media
            .iter()
            .find(|(_, doc)| doc.media_type == media_type && doc.tmdb_id == tmdb_id)
    }
}

pub struct MemoryBackend {
    state: Mutex<State>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|e| anyhow::anyhow!("lock poisoned: {e}"))
    }

    fn check_read(state: &State) -> Result<()> {
        if state.offline {
            bail!("connection refused: backend unreachable");
        }
        Ok(())
    }

    fn check_write(state: &State) -> Result<()> {
        Self::check_read(state)?;
        if state.fail_writes {
            bail!("backend rejected write: quota exceeded");
        }
        Ok(())
    }

    /// Make every call fail like a dead network.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.offline = offline;
        }
    }

    /// Make writes fail with a non-network error.
    pub fn set_fail_writes(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_writes = fail;
        }
    }

    pub fn item_count(&self) -> usize {
        self.state.lock().map(|s| s.items.len()).unwrap_or(0)
    }

    pub fn media_count(&self) -> usize {
        self.state.lock().map(|s| s.media.len()).unwrap_or(0)
    }

    pub fn profile_count(&self) -> usize {
        self.state.lock().map(|s| s.profiles.len()).unwrap_or(0)
    }

    /// Seed a remote record directly, bypassing the failure knobs.
    pub fn seed_record(&self, library_id: &str, record: &LibraryRecord) -> Result<String> {
        let (media, item) = mapper::local_to_server(record, library_id);
        let mut state = self.state()?;

        let media_row = match state.media_row(record.media_type, record.tmdb_id) {
            Some((id, _)) => id.clone(),
            None => {
                let id = state.next_id("media");
                state.media.push((id.clone(), media));
                id
            }
        };

        let row_id = state.next_id("item");
        state.items.push(ItemRow {
            row_id: row_id.clone(),
            library: library_id.to_string(),
            media_row,
            item,
        });
        Ok(row_id)
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.state()?.offline)
    }

    async fn find_library(&self, user_id: &str) -> Result<Option<String>> {
        let state = self.state()?;
        Self::check_read(&state)?;
        Ok(state
            .libraries
            .iter()
            .find(|(_, user)| user == user_id)
            .map(|(id, _)| id.clone()))
    }

    async fn create_library(&self, user_id: &str) -> Result<String> {
        let mut state = self.state()?;
        Self::check_write(&state)?;
        let id = state.next_id("lib");
        state.libraries.push((id.clone(), user_id.to_string()));
        Ok(id)
    }

    async fn upsert_media(&self, media: &MediaDoc) -> Result<String> {
        let mut state = self.state()?;
        Self::check_write(&state)?;
        if let Some(pos) = state
            .media
            .iter()
            .position(|(_, doc)| doc.media_type == media.media_type && doc.tmdb_id == media.tmdb_id)
        {
            state.media[pos].1 = media.clone();
            return Ok(state.media[pos].0.clone());
        }
        let id = state.next_id("media");
        state.media.push((id.clone(), media.clone()));
        Ok(id)
    }

    async fn upsert_library_item(
        &self,
        library_id: &str,
        media_row_id: &str,
        item: &LibraryItemDoc,
    ) -> Result<String> {
        let mut state = self.state()?;
        Self::check_write(&state)?;
        if let Some(row) = state
            .items
            .iter_mut()
            .find(|row| row.library == library_id && row.media_row == media_row_id)
        {
            row.item = item.clone();
            return Ok(row.row_id.clone());
        }
        let row_id = state.next_id("item");
        state.items.push(ItemRow {
            row_id: row_id.clone(),
            library: library_id.to_string(),
            media_row: media_row_id.to_string(),
            item: item.clone(),
        });
        Ok(row_id)
    }

    async fn list_library_items(
        &self,
        library_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Page<StoredItem>> {
        let state = self.state()?;
        Self::check_read(&state)?;

        let rows: Vec<&ItemRow> = state
            .items
            .iter()
            .filter(|row| row.library == library_id)
            .collect();
        let total = rows.len();

        let mut items = Vec::new();
        for row in rows.into_iter().skip(offset).take(limit) {
            let media = state
                .media
                .iter()
                .find(|(id, _)| *id == row.media_row)
                .map(|(_, doc)| doc.clone())
                .ok_or_else(|| anyhow::anyhow!("dangling media reference {}", row.media_row))?;
            items.push(StoredItem {
                row_id: row.row_id.clone(),
                item: row.item.clone(),
                media,
            });
        }

        Ok(Page { items, total })
    }

    async fn soft_delete_item(
        &self,
        library_id: &str,
        media_type: MediaType,
        tmdb_id: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state()?;
        Self::check_write(&state)?;

        let media_row = match state.media_row(media_type, tmdb_id) {
            Some((id, _)) => id.clone(),
            None => return Ok(false),
        };
        match state
            .items
            .iter_mut()
            .find(|row| row.library == library_id && row.media_row == media_row)
        {
            Some(row) => {
                row.item.deleted = true;
                row.item.last_updated_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_expired_tombstones(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Page<TombstoneRow>> {
        let state = self.state()?;
        Self::check_read(&state)?;

        let expired: Vec<TombstoneRow> = state
            .items
            .iter()
            .filter_map(|row| {
                let last_updated_at = row.item.last_updated_at.unwrap_or(row.item.added_at);
                (row.item.deleted && last_updated_at < cutoff).then(|| TombstoneRow {
                    row_id: row.row_id.clone(),
                    last_updated_at,
                })
            })
            .collect();
        let total = expired.len();
        let items = expired.into_iter().skip(offset).take(limit).collect();

        Ok(Page { items, total })
    }

    async fn delete_row(&self, row_id: &str) -> Result<()> {
        let mut state = self.state()?;
        Self::check_write(&state)?;
        match state.items.iter().position(|row| row.row_id == row_id) {
            Some(pos) => {
                state.items.remove(pos);
                Ok(())
            }
            None => bail!("row {} not found", row_id),
        }
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<ProfileDoc>> {
        let state = self.state()?;
        Self::check_read(&state)?;
        Ok(state
            .profiles
            .iter()
            .find(|(_, profile)| profile.user_id == user_id)
            .map(|(_, profile)| profile.clone()))
    }

    async fn create_preferences(&self, _user_id: &str, prefs: &PreferencesDoc) -> Result<String> {
        let mut state = self.state()?;
        Self::check_write(&state)?;
        let id = state.next_id("prefs");
        state.preferences.push((id.clone(), prefs.clone()));
        Ok(id)
    }

    async fn create_profile(&self, _user_id: &str, profile: &ProfileDoc) -> Result<String> {
        let mut state = self.state()?;
        Self::check_write(&state)?;
        let id = state.next_id("profile");
        state.profiles.push((id.clone(), profile.clone()));
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::WatchStatus;

    fn record(tmdb_id: u64) -> LibraryRecord {
        let mut r = LibraryRecord::new(MediaType::Movie, tmdb_id, Utc::now());
        r.status = WatchStatus::Watching;
        r
    }

    #[tokio::test]
    async fn test_get_or_create_library_is_stable() {
        let backend = MemoryBackend::new();
        let first = backend.get_or_create_library("user-1").await.unwrap();
        let second = backend.get_or_create_library("user-1").await.unwrap();
        assert_eq!(first, second);

        let other = backend.get_or_create_library("user-2").await.unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn test_upsert_media_dedups_by_key() {
        let backend = MemoryBackend::new();
        let (media, _) = mapper::local_to_server(&record(603), "lib-1");

        let first = backend.upsert_media(&media).await.unwrap();
        let second = backend.upsert_media(&media).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.media_count(), 1);
    }

    #[tokio::test]
    async fn test_item_listing_pages() {
        let backend = MemoryBackend::new();
        let library_id = backend.get_or_create_library("user-1").await.unwrap();
        for i in 0..5 {
            backend.seed_record(&library_id, &record(i)).unwrap();
        }

        let page = backend.list_library_items(&library_id, 2, 0).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);

        let page = backend.list_library_items(&library_id, 2, 4).await.unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn test_soft_delete_then_expire() {
        let backend = MemoryBackend::new();
        let library_id = backend.get_or_create_library("user-1").await.unwrap();
        backend.seed_record(&library_id, &record(603)).unwrap();

        let long_ago = Utc::now() - chrono::Duration::days(60);
        assert!(backend
            .soft_delete_item(&library_id, MediaType::Movie, 603, long_ago)
            .await
            .unwrap());
        assert!(!backend
            .soft_delete_item(&library_id, MediaType::Movie, 999, long_ago)
            .await
            .unwrap());

        let cutoff = Utc::now() - chrono::Duration::days(30);
        let page = backend
            .list_expired_tombstones(cutoff, 100, 0)
            .await
            .unwrap();
        assert_eq!(page.total, 1);

        backend.delete_row(&page.items[0].row_id).await.unwrap();
        assert_eq!(backend.item_count(), 0);
    }

    #[tokio::test]
    async fn test_offline_knob_fails_like_a_network() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);

        assert!(!backend.health_check().await.unwrap());
        let err = backend.find_library("user-1").await.unwrap_err();
        assert!(crate::connectivity::is_network_error(&err));
    }

    #[tokio::test]
    async fn test_fail_writes_is_not_a_network_error() {
        let backend = MemoryBackend::new();
        backend.set_fail_writes(true);

        let err = backend.create_library("user-1").await.unwrap_err();
        assert!(!crate::connectivity::is_network_error(&err));
        // Reads still work
        assert!(backend.find_library("user-1").await.unwrap().is_none());
    }
}
