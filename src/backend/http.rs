//! HTTP implementation of [`RemoteBackend`] against the hosted BaaS REST
//! surface.
//!
//! Documents live under `/databases/{db}/collections/{table}/documents`;
//! listings take stringified query expressions (`equal(...)`, `limit(...)`)
//! as repeated `queries[]` parameters. Rows come back with their fields
//! flattened next to `$id` / `$updatedAt` server metadata.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    owner_permissions, Page, PreferencesDoc, ProfileDoc, RemoteBackend, StoredItem, TombstoneRow,
};
use crate::config::BackendConfig;
use crate::mapper::{LibraryItemDoc, MediaDoc};
use crate::record::MediaType;

/// Table ids inside the app database.
#[derive(Debug, Clone)]
pub struct TableIds {
    pub media: String,
    pub library_media: String,
    pub libraries: String,
    pub profiles: String,
    pub preferences: String,
}

impl Default for TableIds {
    fn default() -> Self {
        Self {
            media: "media".to_string(),
            library_media: "library_media".to_string(),
            libraries: "libraries".to_string(),
            profiles: "profiles".to_string(),
            preferences: "preferences".to_string(),
        }
    }
}

pub struct HttpBackend {
    client: Client,
    endpoint: String,
    project_id: String,
    api_key: String,
    database_id: String,
    tables: TableIds,
}

/// Server response wrapper for listings.
#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    total: usize,
    documents: Vec<T>,
}

/// A stored document: server metadata plus the flattened column values.
#[derive(Debug, Deserialize)]
struct Row<T> {
    #[serde(rename = "$id")]
    id: String,
    #[serde(rename = "$updatedAt", default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    data: T,
}

#[derive(Debug, Deserialize)]
struct LibraryItemColumns {
    #[serde(flatten)]
    item: LibraryItemDoc,
    /// Catalog row id this entry points at.
    media: String,
}

#[derive(Debug, Deserialize)]
struct TombstoneColumns {
    #[serde(rename = "lastUpdatedAt", default)]
    last_updated_at: Option<DateTime<Utc>>,
}

fn q_equal<T: Serialize>(attr: &str, value: T) -> String {
    format!("equal(\"{}\", [{}])", attr, json!(value))
}

fn q_less_than<T: Serialize>(attr: &str, value: T) -> String {
    format!("lessThan(\"{}\", [{}])", attr, json!(value))
}

fn q_limit(limit: usize) -> String {
    format!("limit({})", limit)
}

fn q_offset(offset: usize) -> String {
    format!("offset({})", offset)
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            client: Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            project_id: config.project_id.clone(),
            api_key: config.api_key.clone(),
            database_id: config.database_id.clone(),
            tables: TableIds::default(),
        }
    }

    fn documents_url(&self, table: &str) -> String {
        format!(
            "{}/databases/{}/collections/{}/documents",
            self.endpoint, self.database_id, table
        )
    }

    fn document_url(&self, table: &str, row_id: &str) -> String {
        format!("{}/{}", self.documents_url(table), row_id)
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("X-Appwrite-Project", &self.project_id)
            .header("X-Appwrite-Key", &self.api_key)
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("backend returned {}: {}", status, body);
        }
        response
            .json()
            .await
            .context("failed to decode backend response")
    }

    async fn list_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        queries: &[String],
    ) -> Result<ListResponse<Row<T>>> {
        let pairs: Vec<(&str, &str)> = queries.iter().map(|q| ("queries[]", q.as_str())).collect();
        let response = self
            .auth(self.client.get(self.documents_url(table)))
            .query(&pairs)
            .send()
            .await
            .with_context(|| format!("failed to list {} rows", table))?;
        Self::parse(response).await
    }

    async fn get_row<T: DeserializeOwned>(&self, table: &str, row_id: &str) -> Result<Row<T>> {
        let response = self
            .auth(self.client.get(self.document_url(table, row_id)))
            .send()
            .await
            .with_context(|| format!("failed to fetch {} row {}", table, row_id))?;
        Self::parse(response).await
    }

    async fn create_row<T: Serialize>(
        &self,
        table: &str,
        data: &T,
        permissions: Vec<String>,
    ) -> Result<String> {
        let body = json!({
            "documentId": "unique()",
            "data": data,
            "permissions": permissions,
        });
        let response = self
            .auth(self.client.post(self.documents_url(table)))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to create {} row", table))?;
        let row: Row<serde_json::Value> = Self::parse(response).await?;
        Ok(row.id)
    }

    async fn update_row<T: Serialize>(&self, table: &str, row_id: &str, data: &T) -> Result<()> {
        let body = json!({ "data": data });
        let response = self
            .auth(self.client.patch(self.document_url(table, row_id)))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to update {} row {}", table, row_id))?;
        let _: Row<serde_json::Value> = Self::parse(response).await?;
        Ok(())
    }

    /// Find the catalog row for a title, if the backend has one.
    async fn find_media_row(
        &self,
        media_type: MediaType,
        tmdb_id: u64,
    ) -> Result<Option<Row<MediaDoc>>> {
        let queries = [
            q_equal("tmdbId", tmdb_id),
            q_equal("mediaType", media_type.to_string()),
            q_limit(1),
        ];
        let mut listing: ListResponse<Row<MediaDoc>> =
            self.list_rows(&self.tables.media, &queries).await?;
        Ok(if listing.documents.is_empty() {
            None
        } else {
            Some(listing.documents.remove(0))
        })
    }

    async fn find_item_row(
        &self,
        library_id: &str,
        media_row_id: &str,
    ) -> Result<Option<Row<LibraryItemColumns>>> {
        let queries = [
            q_equal("library", library_id),
            q_equal("media", media_row_id),
            q_limit(1),
        ];
        let mut listing: ListResponse<Row<LibraryItemColumns>> =
            self.list_rows(&self.tables.library_media, &queries).await?;
        Ok(if listing.documents.is_empty() {
            None
        } else {
            Some(listing.documents.remove(0))
        })
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    fn backend_name(&self) -> &str {
        "http"
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/health", self.endpoint);
        match self.auth(self.client.get(url)).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                tracing::debug!("Backend health check failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn find_library(&self, user_id: &str) -> Result<Option<String>> {
        let queries = [q_equal("user", user_id), q_limit(1)];
        let listing: ListResponse<Row<serde_json::Value>> =
            self.list_rows(&self.tables.libraries, &queries).await?;
        Ok(listing.documents.into_iter().next().map(|row| row.id))
    }

    async fn create_library(&self, user_id: &str) -> Result<String> {
        let data = json!({ "user": user_id });
        self.create_row(&self.tables.libraries, &data, owner_permissions(user_id))
            .await
    }

    async fn upsert_media(&self, media: &MediaDoc) -> Result<String> {
        match self.find_media_row(media.media_type, media.tmdb_id).await? {
            Some(existing) => {
                self.update_row(&self.tables.media, &existing.id, media)
                    .await?;
                Ok(existing.id)
            }
            // Catalog rows are shared across users: no per-user permissions
            None => self.create_row(&self.tables.media, media, Vec::new()).await,
        }
    }

    async fn upsert_library_item(
        &self,
        library_id: &str,
        media_row_id: &str,
        item: &LibraryItemDoc,
    ) -> Result<String> {
        let mut data = serde_json::to_value(item)?;
        if let Some(map) = data.as_object_mut() {
            map.insert("media".to_string(), json!(media_row_id));
        }

        match self.find_item_row(library_id, media_row_id).await? {
            Some(existing) => {
                self.update_row(&self.tables.library_media, &existing.id, &data)
                    .await?;
                Ok(existing.id)
            }
            None => {
                // Item rows are user-scoped; derive the owner from the
                // library permission list via the library's user column.
                let library: Row<serde_json::Value> =
                    self.get_row(&self.tables.libraries, library_id).await?;
                let user_id = library
                    .data
                    .get("user")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                self.create_row(&self.tables.library_media, &data, owner_permissions(&user_id))
                    .await
            }
        }
    }

    async fn list_library_items(
        &self,
        library_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Page<StoredItem>> {
        let queries = [
            q_equal("library", library_id),
            q_limit(limit),
            q_offset(offset),
        ];
        let listing: ListResponse<Row<LibraryItemColumns>> =
            self.list_rows(&self.tables.library_media, &queries).await?;

        // Join each row with its catalog row, fetching every distinct
        // catalog id once per page.
        let mut media_cache: HashMap<String, MediaDoc> = HashMap::new();
        let mut items = Vec::with_capacity(listing.documents.len());
        for row in listing.documents {
            let media = match media_cache.get(&row.data.media) {
                Some(cached) => cached.clone(),
                None => {
                    let fetched: Row<MediaDoc> =
                        self.get_row(&self.tables.media, &row.data.media).await?;
                    media_cache.insert(row.data.media.clone(), fetched.data.clone());
                    fetched.data
                }
            };
            let mut item = row.data.item;
            if item.last_updated_at.is_none() {
                item.last_updated_at = row.updated_at;
            }
            items.push(StoredItem {
                row_id: row.id,
                item,
                media,
            });
        }

        Ok(Page {
            items,
            total: listing.total,
        })
    }

    async fn soft_delete_item(
        &self,
        library_id: &str,
        media_type: MediaType,
        tmdb_id: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let media_row = match self.find_media_row(media_type, tmdb_id).await? {
            Some(row) => row,
            None => return Ok(false),
        };
        let item_row = match self.find_item_row(library_id, &media_row.id).await? {
            Some(row) => row,
            None => return Ok(false),
        };

        let data = json!({
            "deleted": true,
            "lastUpdatedAt": now.to_rfc3339(),
        });
        self.update_row(&self.tables.library_media, &item_row.id, &data)
            .await?;
        Ok(true)
    }

    async fn list_expired_tombstones(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
        offset: usize,
    ) -> Result<Page<TombstoneRow>> {
        let queries = [
            q_equal("deleted", true),
            q_less_than("lastUpdatedAt", cutoff.to_rfc3339()),
            q_limit(limit),
            q_offset(offset),
        ];
        let listing: ListResponse<Row<TombstoneColumns>> =
            self.list_rows(&self.tables.library_media, &queries).await?;

        let items = listing
            .documents
            .into_iter()
            .map(|row| TombstoneRow {
                last_updated_at: row
                    .data
                    .last_updated_at
                    .or(row.updated_at)
                    .unwrap_or(cutoff),
                row_id: row.id,
            })
            .collect();

        Ok(Page {
            items,
            total: listing.total,
        })
    }

    async fn delete_row(&self, row_id: &str) -> Result<()> {
        let response = self
            .auth(
                self.client
                    .delete(self.document_url(&self.tables.library_media, row_id)),
            )
            .send()
            .await
            .with_context(|| format!("failed to delete row {}", row_id))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("backend returned {}: {}", status, body);
        }
        Ok(())
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<ProfileDoc>> {
        let queries = [q_equal("userId", user_id), q_limit(1)];
        let listing: ListResponse<Row<ProfileDoc>> =
            self.list_rows(&self.tables.profiles, &queries).await?;
        Ok(listing.documents.into_iter().next().map(|row| row.data))
    }

    async fn create_preferences(&self, user_id: &str, prefs: &PreferencesDoc) -> Result<String> {
        self.create_row(&self.tables.preferences, prefs, owner_permissions(user_id))
            .await
    }

    async fn create_profile(&self, user_id: &str, profile: &ProfileDoc) -> Result<String> {
        self.create_row(&self.tables.profiles, profile, owner_permissions(user_id))
            .await
    }
}
