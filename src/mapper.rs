//! Mapping between the local record shape and the two remote tables.
//!
//! The remote side splits a tracked entry across a shared catalog row
//! (`media`, one per title across all users) and a user-scoped library row
//! (`library_media`). Both directions are total and synchronous; anything
//! that can fail belongs to the coordinator, not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{LibraryRecord, MediaType, WatchStatus};

/// Shared catalog row. Content metadata only, no user state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDoc {
    pub tmdb_id: u64,
    pub media_type: MediaType,
    /// Empty string when the title is unknown locally.
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f32>,
}

/// User-scoped library row. References the owning library; the backend
/// stamps the media relation when it writes the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryItemDoc {
    pub status: WatchStatus,
    pub is_favorite: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_rating: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub added_at: DateTime<Utc>,
    /// Client-side mutation timestamp. Rows written before this column
    /// existed lack it; the server-assigned row timestamp stands in then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
    pub library: String,
}

/// Clamp a user rating into [1, 10] and round to the nearest integer.
pub fn clamp_rating(rating: f32) -> u8 {
    let rating = if rating.is_finite() { rating } else { 1.0 };
    rating.clamp(1.0, 10.0).round() as u8
}

/// Map a local record to the pair of remote rows.
///
/// Denormalized display fields are copied only when present; absent
/// optionals stay null and genres default to an empty list.
pub fn local_to_server(record: &LibraryRecord, library_id: &str) -> (MediaDoc, LibraryItemDoc) {
    let media = MediaDoc {
        tmdb_id: record.tmdb_id,
        media_type: record.media_type,
        title: record.title.clone().unwrap_or_default(),
        overview: None,
        poster_path: record.poster_path.clone(),
        release_date: record.release_date.clone(),
        genres: record.genres.clone(),
        rating: record.catalog_rating,
    };

    let item = LibraryItemDoc {
        status: record.status,
        is_favorite: record.is_favorite,
        user_rating: record.user_rating.map(clamp_rating),
        notes: record.notes.clone(),
        added_at: record.added_at,
        last_updated_at: Some(record.last_updated_at),
        deleted: record.deleted,
        library: library_id.to_string(),
    };

    (media, item)
}

/// Map a pair of remote rows back to a local record.
///
/// `last_updated_at` falls back to wall-clock time when neither the column
/// nor a server timestamp survived the trip.
pub fn server_to_local(item: &LibraryItemDoc, media: &MediaDoc) -> LibraryRecord {
    LibraryRecord {
        media_type: media.media_type,
        tmdb_id: media.tmdb_id,
        status: item.status,
        is_favorite: item.is_favorite,
        user_rating: item.user_rating.map(f32::from),
        notes: item.notes.clone(),
        added_at: item.added_at,
        last_updated_at: item.last_updated_at.unwrap_or_else(Utc::now),
        deleted: item.deleted,
        title: if media.title.is_empty() {
            None
        } else {
            Some(media.title.clone())
        },
        poster_path: media.poster_path.clone(),
        release_date: media.release_date.clone(),
        genres: media.genres.clone(),
        catalog_rating: media.rating,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_record() -> LibraryRecord {
        let now = Utc::now();
        let mut record = LibraryRecord::new(MediaType::Movie, 603, now);
        record.status = WatchStatus::Completed;
        record.is_favorite = true;
        record.user_rating = Some(9.0);
        record.notes = Some("red pill".to_string());
        record.title = Some("The Matrix".to_string());
        record.poster_path = Some("/matrix.jpg".to_string());
        record.release_date = Some("1999-03-31".to_string());
        record.genres = vec!["Action".to_string(), "Science Fiction".to_string()];
        record.catalog_rating = Some(8.2);
        record
    }

    #[test]
    fn test_rating_clamps_and_rounds() {
        assert_eq!(clamp_rating(0.0), 1);
        assert_eq!(clamp_rating(-3.5), 1);
        assert_eq!(clamp_rating(11.0), 10);
        assert_eq!(clamp_rating(100.0), 10);
        assert_eq!(clamp_rating(7.4), 7);
        assert_eq!(clamp_rating(7.5), 8);
        assert_eq!(clamp_rating(10.0), 10);
        assert_eq!(clamp_rating(1.0), 1);
        assert_eq!(clamp_rating(f32::NAN), 1);
    }

    #[test]
    fn test_out_of_range_rating_is_clamped_on_upload() {
        let mut record = full_record();
        record.user_rating = Some(42.0);
        let (_, item) = local_to_server(&record, "lib-1");
        assert_eq!(item.user_rating, Some(10));

        record.user_rating = Some(-1.0);
        let (_, item) = local_to_server(&record, "lib-1");
        assert_eq!(item.user_rating, Some(1));
    }

    #[test]
    fn test_roundtrip_preserves_shared_fields() {
        let record = full_record();
        let (media, item) = local_to_server(&record, "lib-1");
        let back = server_to_local(&item, &media);

        assert_eq!(back.media_type, record.media_type);
        assert_eq!(back.tmdb_id, record.tmdb_id);
        assert_eq!(back.status, record.status);
        assert_eq!(back.is_favorite, record.is_favorite);
        assert_eq!(back.user_rating, record.user_rating);
        assert_eq!(back.notes, record.notes);
        assert_eq!(back.added_at, record.added_at);
        assert_eq!(back.last_updated_at, record.last_updated_at);
        assert_eq!(back.deleted, record.deleted);
        assert_eq!(back.title, record.title);
        assert_eq!(back.poster_path, record.poster_path);
        assert_eq!(back.release_date, record.release_date);
        assert_eq!(back.genres, record.genres);
        assert_eq!(back.catalog_rating, record.catalog_rating);
    }

    #[test]
    fn test_roundtrip_of_sparse_record() {
        let now = Utc::now();
        let mut record = LibraryRecord::new(MediaType::Tv, 1399, now);
        record.status = WatchStatus::Watching;

        let (media, item) = local_to_server(&record, "lib-1");
        assert_eq!(media.title, "");
        assert!(media.poster_path.is_none());
        assert!(media.genres.is_empty());
        assert!(item.user_rating.is_none());

        let back = server_to_local(&item, &media);
        assert_eq!(back.title, None);
        assert_eq!(back.user_rating, None);
        assert_eq!(back.status, WatchStatus::Watching);
        assert_eq!(back.last_updated_at, record.last_updated_at);
    }

    #[test]
    fn test_tombstone_survives_mapping() {
        let mut record = full_record();
        record.deleted = true;
        let (media, item) = local_to_server(&record, "lib-1");
        assert!(item.deleted);
        assert!(server_to_local(&item, &media).deleted);
    }

    #[test]
    fn test_library_reference_is_stamped() {
        let record = full_record();
        let (_, item) = local_to_server(&record, "lib-42");
        assert_eq!(item.library, "lib-42");
    }

    #[test]
    fn test_missing_timestamp_falls_back_to_now() {
        let record = full_record();
        let (media, mut item) = local_to_server(&record, "lib-1");
        item.last_updated_at = None;

        let before = Utc::now();
        let back = server_to_local(&item, &media);
        let after = Utc::now();
        assert!(back.last_updated_at >= before && back.last_updated_at <= after);
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let record = full_record();
        let (media, item) = local_to_server(&record, "lib-1");

        let media_json = serde_json::to_value(&media).unwrap();
        assert!(media_json.get("tmdbId").is_some());
        assert!(media_json.get("posterPath").is_some());
        assert!(media_json.get("releaseDate").is_some());

        let item_json = serde_json::to_value(&item).unwrap();
        assert!(item_json.get("isFavorite").is_some());
        assert!(item_json.get("userRating").is_some());
        assert!(item_json.get("addedAt").is_some());
        assert!(item_json.get("lastUpdatedAt").is_some());
    }
}
