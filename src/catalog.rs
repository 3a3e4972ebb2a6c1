//! Read-only client for the third-party content catalog.
//!
//! Search and trending listings feed the denormalized display fields on
//! library records. Detail lookups go through a bounded LRU cache since the
//! same titles get re-opened constantly. The catalog caps paginated queries
//! at page 500; requests beyond that are clamped, not rejected.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use lru::LruCache;
use reqwest::Client;
use serde::Deserialize;

use crate::config::CatalogConfig;
use crate::record::{media_key, LibraryRecord, MediaType};

/// Hard pagination cap imposed by the catalog API.
pub const MAX_PAGE: u32 = 500;

pub fn clamp_page(page: u32) -> u32 {
    page.clamp(1, MAX_PAGE)
}

/// One title in a search or trending listing.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub tmdb_id: u64,
    pub media_type: MediaType,
    pub title: String,
    pub poster_path: Option<String>,
    pub release_date: Option<String>,
    pub rating: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct CatalogPage {
    pub page: u32,
    pub total_pages: u32,
    pub total_results: u64,
    pub entries: Vec<CatalogEntry>,
}

/// Full details for one title.
#[derive(Debug, Clone)]
pub struct CatalogDetails {
    pub tmdb_id: u64,
    pub media_type: MediaType,
    pub title: String,
    pub overview: Option<String>,
    pub poster_path: Option<String>,
    pub release_date: Option<String>,
    pub genres: Vec<String>,
    pub rating: Option<f32>,
}

impl CatalogDetails {
    /// Copy the display fields onto a library record.
    pub fn apply_to(&self, record: &mut LibraryRecord) {
        record.title = Some(self.title.clone());
        record.poster_path = self.poster_path.clone();
        record.release_date = self.release_date.clone();
        record.genres = self.genres.clone();
        record.catalog_rating = self.rating;
    }
}

// API response models
#[derive(Debug, Deserialize)]
struct ListingResponse {
    page: u32,
    results: Vec<ListingResult>,
    total_pages: u32,
    total_results: u64,
}

#[derive(Debug, Deserialize)]
struct ListingResult {
    id: u64,
    // Movies carry `title`/`release_date`, shows `name`/`first_air_date`
    title: Option<String>,
    name: Option<String>,
    poster_path: Option<String>,
    release_date: Option<String>,
    first_air_date: Option<String>,
    vote_average: Option<f32>,
}

impl ListingResult {
    fn into_entry(self, media_type: MediaType) -> CatalogEntry {
        CatalogEntry {
            tmdb_id: self.id,
            media_type,
            title: self.title.or(self.name).unwrap_or_default(),
            poster_path: self.poster_path,
            release_date: self.release_date.or(self.first_air_date),
            rating: self.vote_average,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DetailsResponse {
    id: u64,
    title: Option<String>,
    name: Option<String>,
    overview: Option<String>,
    poster_path: Option<String>,
    release_date: Option<String>,
    first_air_date: Option<String>,
    #[serde(default)]
    genres: Vec<GenreEntry>,
    vote_average: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct GenreEntry {
    name: String,
}

impl DetailsResponse {
    fn into_details(self, media_type: MediaType) -> CatalogDetails {
        CatalogDetails {
            tmdb_id: self.id,
            media_type,
            title: self.title.or(self.name).unwrap_or_default(),
            overview: self.overview,
            poster_path: self.poster_path,
            release_date: self.release_date.or(self.first_air_date),
            genres: self.genres.into_iter().map(|g| g.name).collect(),
            rating: self.vote_average,
        }
    }
}

pub struct CatalogClient {
    client: Client,
    base_url: String,
    api_token: String,
    details_cache: Mutex<LruCache<String, CatalogDetails>>,
}

impl CatalogClient {
    pub fn new(config: &CatalogConfig) -> Self {
        // At least 10 entries to avoid degenerate cache behavior
        let capacity = NonZeroUsize::new(config.cache_capacity.max(10))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            details_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn search(
        &self,
        media_type: MediaType,
        query: &str,
        page: u32,
    ) -> Result<CatalogPage> {
        let url = format!("{}/search/{}", self.base_url, media_type);
        let page = clamp_page(page);
        let response: ListingResponse = self
            .get(&url, &[("query", query), ("page", &page.to_string())])
            .await
            .with_context(|| format!("catalog search for '{}' failed", query))?;
        Ok(Self::into_page(response, media_type))
    }

    pub async fn trending(&self, media_type: MediaType, page: u32) -> Result<CatalogPage> {
        let url = format!("{}/trending/{}/week", self.base_url, media_type);
        let page = clamp_page(page);
        let response: ListingResponse = self
            .get(&url, &[("page", &page.to_string())])
            .await
            .context("catalog trending listing failed")?;
        Ok(Self::into_page(response, media_type))
    }

    /// Fetch full details for one title, cached.
    pub async fn details(&self, media_type: MediaType, tmdb_id: u64) -> Result<CatalogDetails> {
        let key = media_key(media_type, tmdb_id);
        if let Some(cached) = self.cache_get(&key) {
            return Ok(cached);
        }

        let url = format!("{}/{}/{}", self.base_url, media_type, tmdb_id);
        let response: DetailsResponse = self
            .get(&url, &[])
            .await
            .with_context(|| format!("catalog details for {} failed", key))?;
        let details = response.into_details(media_type);
        self.cache_put(key, details.clone());
        Ok(details)
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<T> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_token)
            .query(params)
            .send()
            .await
            .context("catalog request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("catalog returned {}: {}", status, body);
        }
        response
            .json()
            .await
            .context("failed to decode catalog response")
    }

    fn into_page(response: ListingResponse, media_type: MediaType) -> CatalogPage {
        CatalogPage {
            page: response.page,
            total_pages: response.total_pages,
            total_results: response.total_results,
            entries: response
                .results
                .into_iter()
                .map(|r| r.into_entry(media_type))
                .collect(),
        }
    }

    fn cache_get(&self, key: &str) -> Option<CatalogDetails> {
        match self.details_cache.lock() {
            Ok(mut cache) => cache.get(key).cloned(),
            Err(_) => None,
        }
    }

    fn cache_put(&self, key: String, details: CatalogDetails) {
        if let Ok(mut cache) = self.details_cache.lock() {
            cache.put(key, details);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_page_clamping() {
        assert_eq!(clamp_page(0), 1);
        assert_eq!(clamp_page(1), 1);
        assert_eq!(clamp_page(250), 250);
        assert_eq!(clamp_page(500), 500);
        assert_eq!(clamp_page(501), 500);
        assert_eq!(clamp_page(u32::MAX), 500);
    }

    #[test]
    fn test_movie_listing_parses() {
        let payload = r#"{
            "page": 1,
            "results": [
                {"id": 603, "title": "The Matrix", "poster_path": "/matrix.jpg",
                 "release_date": "1999-03-31", "vote_average": 8.2}
            ],
            "total_pages": 1,
            "total_results": 1
        }"#;
        let response: ListingResponse = serde_json::from_str(payload).unwrap();
        let page = CatalogClient::into_page(response, MediaType::Movie);

        assert_eq!(page.total_results, 1);
        let entry = &page.entries[0];
        assert_eq!(entry.tmdb_id, 603);
        assert_eq!(entry.title, "The Matrix");
        assert_eq!(entry.release_date.as_deref(), Some("1999-03-31"));
    }

    #[test]
    fn test_tv_listing_uses_name_and_first_air_date() {
        let payload = r#"{
            "page": 1,
            "results": [
                {"id": 1399, "name": "Game of Thrones", "first_air_date": "2011-04-17"}
            ],
            "total_pages": 1,
            "total_results": 1
        }"#;
        let response: ListingResponse = serde_json::from_str(payload).unwrap();
        let page = CatalogClient::into_page(response, MediaType::Tv);

        let entry = &page.entries[0];
        assert_eq!(entry.title, "Game of Thrones");
        assert_eq!(entry.release_date.as_deref(), Some("2011-04-17"));
        assert!(entry.rating.is_none());
    }

    #[test]
    fn test_details_parse_and_apply() {
        let payload = r#"{
            "id": 603,
            "title": "The Matrix",
            "overview": "A computer hacker learns the truth.",
            "poster_path": "/matrix.jpg",
            "release_date": "1999-03-31",
            "genres": [{"id": 28, "name": "Action"}, {"id": 878, "name": "Science Fiction"}],
            "vote_average": 8.2
        }"#;
        let response: DetailsResponse = serde_json::from_str(payload).unwrap();
        let details = response.into_details(MediaType::Movie);

        assert_eq!(details.genres, vec!["Action", "Science Fiction"]);

        let mut record = LibraryRecord::new(MediaType::Movie, 603, Utc::now());
        details.apply_to(&mut record);
        assert_eq!(record.title.as_deref(), Some("The Matrix"));
        assert_eq!(record.genres.len(), 2);
        assert_eq!(record.catalog_rating, Some(8.2));
    }
}
