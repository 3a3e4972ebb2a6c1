//! Remote backend abstraction.
//!
//! - [`http::HttpBackend`]: the hosted BaaS REST API (default)
//! - [`memory::MemoryBackend`]: in-process state for deterministic tests
//!
//! The sync coordinator, the retention cleanup, and user onboarding all hold
//! a `dyn RemoteBackend` and never talk HTTP directly.

pub mod http;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mapper::{LibraryItemDoc, MediaDoc};
use crate::record::MediaType;

/// One page of a listing, with the server-side total for the whole query.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// A library row joined with its catalog row.
#[derive(Debug, Clone)]
pub struct StoredItem {
    pub row_id: String,
    pub item: LibraryItemDoc,
    pub media: MediaDoc,
}

/// Reference to a tombstoned row due for physical deletion.
#[derive(Debug, Clone)]
pub struct TombstoneRow {
    pub row_id: String,
    pub last_updated_at: DateTime<Utc>,
}

/// Preferences row created during onboarding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesDoc {
    pub sign_out_confirmation: String,
    pub remove_from_library_confirmation: String,
    pub clear_library_confirmation: String,
    pub theme: String,
    pub language: String,
}

impl Default for PreferencesDoc {
    fn default() -> Self {
        Self {
            sign_out_confirmation: "enabled".to_string(),
            remove_from_library_confirmation: "enabled".to_string(),
            clear_library_confirmation: "enabled".to_string(),
            theme: "system".to_string(),
            language: "en".to_string(),
        }
    }
}

/// Profile row linking a user to their library and preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDoc {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub username: String,
    pub avatar_url: String,
    pub media_preference: String,
    pub library: String,
    pub preferences: String,
}

/// Row permissions scoping a document to its owning user.
pub fn owner_permissions(user_id: &str) -> Vec<String> {
    vec![
        format!("read(\"user:{}\")", user_id),
        format!("update(\"user:{}\")", user_id),
        format!("delete(\"user:{}\")", user_id),
    ]
}

/// Remote persistence for the synced library and account rows.
///
/// All methods are async; the HTTP implementation suspends on each call and
/// the in-memory one resolves immediately.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Human-readable backend name (e.g., "http", "memory").
    fn backend_name(&self) -> &str;

    /// Cheap reachability check against the backend itself.
    async fn health_check(&self) -> Result<bool>;

    // ── Libraries ────────────────────────────────────────────────────

    /// Find the library row id for a user, if one exists.
    async fn find_library(&self, user_id: &str) -> Result<Option<String>>;

    /// Create a library row owned by the user. Returns the row id.
    async fn create_library(&self, user_id: &str) -> Result<String>;

    /// Find-or-create in one step.
    async fn get_or_create_library(&self, user_id: &str) -> Result<String> {
        if let Some(id) = self.find_library(user_id).await? {
            return Ok(id);
        }
        self.create_library(user_id).await
    }

    // ── Catalog + library rows ───────────────────────────────────────

    /// Create or update the shared catalog row for a title. Returns its id.
    async fn upsert_media(&self, media: &MediaDoc) -> Result<String>;

    /// Create or update the user's library row for a catalog row id.
    /// Returns the library row id.
    async fn upsert_library_item(
        &self,
        library_id: &str,
        media_row_id: &str,
        item: &LibraryItemDoc,
    ) -> Result<String>;

    /// List a library's rows joined with their catalog rows, oldest first.
    async fn list_library_items(
        &self,
        library_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Page<StoredItem>>;

    /// Tombstone a library row by media key. Returns false when the user
    /// has no row for that title.
    async fn soft_delete_item(
        &self,
        library_id: &str,
        media_type: MediaType,
        tmdb_id: u64,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    // ── Retention cleanup ────────────────────────────────────────────

    /// List tombstoned rows last touched before the cutoff.
    async fn list_expired_tombstones(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Page<TombstoneRow>>;

    /// Physically delete a library row.
    async fn delete_row(&self, row_id: &str) -> Result<()>;

    // ── Onboarding ───────────────────────────────────────────────────

    /// Fetch a user's profile row, if they have been onboarded.
    async fn get_profile(&self, user_id: &str) -> Result<Option<ProfileDoc>>;

    /// Create a preferences row owned by the user. Returns the row id.
    async fn create_preferences(&self, user_id: &str, prefs: &PreferencesDoc) -> Result<String>;

    /// Create a profile row owned by the user. Returns the row id.
    async fn create_profile(&self, user_id: &str, profile: &ProfileDoc) -> Result<String>;
}
