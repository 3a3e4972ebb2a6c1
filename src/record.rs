use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies which side of the catalog a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Tv,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Movie => write!(f, "movie"),
            MediaType::Tv => write!(f, "tv"),
        }
    }
}

impl std::str::FromStr for MediaType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "movie" => Ok(MediaType::Movie),
            "tv" | "show" => Ok(MediaType::Tv),
            _ => Err(anyhow::anyhow!("Unknown media type: {}", s)),
        }
    }
}

/// Where an entry sits in the user's watch lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WatchStatus {
    #[default]
    None,
    Watching,
    WillWatch,
    Completed,
    OnHold,
    Dropped,
}

impl std::fmt::Display for WatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WatchStatus::None => "none",
            WatchStatus::Watching => "watching",
            WatchStatus::WillWatch => "will-watch",
            WatchStatus::Completed => "completed",
            WatchStatus::OnHold => "on-hold",
            WatchStatus::Dropped => "dropped",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for WatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(WatchStatus::None),
            "watching" => Ok(WatchStatus::Watching),
            "will-watch" | "willwatch" => Ok(WatchStatus::WillWatch),
            "completed" | "watched" => Ok(WatchStatus::Completed),
            "on-hold" | "onhold" => Ok(WatchStatus::OnHold),
            "dropped" => Ok(WatchStatus::Dropped),
            _ => Err(anyhow::anyhow!("Unknown watch status: {}", s)),
        }
    }
}

/// Composite key for a tracked entry, rendered as `"{media_type}-{tmdb_id}"`.
pub fn media_key(media_type: MediaType, tmdb_id: u64) -> String {
    format!("{}-{}", media_type, tmdb_id)
}

/// Parse a `"{media_type}-{tmdb_id}"` key back into its parts.
pub fn parse_media_key(key: &str) -> anyhow::Result<(MediaType, u64)> {
    let (kind, id) = key
        .split_once('-')
        .ok_or_else(|| anyhow::anyhow!("Malformed media key: {}", key))?;
    Ok((kind.parse()?, id.parse()?))
}

/// A single tracked movie or TV show in the user's library.
///
/// Owned by the local store and mutated only through explicit user actions.
/// "Remove" never deletes the row; it flips the `deleted` tombstone so the
/// deletion can propagate to other devices before the retention cleanup
/// purges it remotely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryRecord {
    pub media_type: MediaType,
    pub tmdb_id: u64,
    #[serde(default)]
    pub status: WatchStatus,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_rating: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub added_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,

    // Denormalized display fields, filled from the catalog when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poster_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub genres: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_rating: Option<f32>,
}

impl LibraryRecord {
    pub fn new(media_type: MediaType, tmdb_id: u64, now: DateTime<Utc>) -> Self {
        Self {
            media_type,
            tmdb_id,
            status: WatchStatus::None,
            is_favorite: false,
            user_rating: None,
            notes: None,
            added_at: now,
            last_updated_at: now,
            deleted: false,
            title: None,
            poster_path: None,
            release_date: None,
            genres: Vec::new(),
            catalog_rating: None,
        }
    }

    pub fn key(&self) -> String {
        media_key(self.media_type, self.tmdb_id)
    }

    /// True when the record carries no user-visible state worth keeping.
    pub fn is_empty_of_user_data(&self) -> bool {
        !self.is_favorite
            && self.user_rating.is_none()
            && self.status == WatchStatus::None
            && self.notes.as_deref().map_or(true, str::is_empty)
    }

    /// Content hash over the sync-relevant fields. Two records with the
    /// same hash do not need re-uploading.
    pub fn content_hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.key().as_bytes());
        hasher.update(self.last_updated_at.to_rfc3339().as_bytes());
        hasher.update(self.status.to_string().as_bytes());
        hasher.update(&[self.is_favorite as u8, self.deleted as u8]);
        if let Some(r) = self.user_rating {
            hasher.update(&r.to_le_bytes());
        }
        if let Some(ref n) = self.notes {
            hasher.update(n.as_bytes());
        }
        *hasher.finalize().as_bytes()
    }
}

/// Per-status tallies for the library overview.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub all: usize,
    pub watching: usize,
    pub will_watch: usize,
    pub completed: usize,
    pub on_hold: usize,
    pub dropped: usize,
    pub favorites: usize,
}

impl StatusCounts {
    pub fn tally<'a>(records: impl Iterator<Item = &'a LibraryRecord>) -> Self {
        let mut counts = Self::default();
        for record in records {
            counts.all += 1;
            match record.status {
                WatchStatus::Watching => counts.watching += 1,
                WatchStatus::WillWatch => counts.will_watch += 1,
                WatchStatus::Completed => counts.completed += 1,
                WatchStatus::OnHold => counts.on_hold += 1,
                WatchStatus::Dropped => counts.dropped += 1,
                WatchStatus::None => {}
            }
            if record.is_favorite {
                counts.favorites += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_key_roundtrip() {
        let key = media_key(MediaType::Movie, 603);
        assert_eq!(key, "movie-603");
        let (kind, id) = parse_media_key(&key).unwrap();
        assert_eq!(kind, MediaType::Movie);
        assert_eq!(id, 603);

        let (kind, id) = parse_media_key("tv-1399").unwrap();
        assert_eq!(kind, MediaType::Tv);
        assert_eq!(id, 1399);
    }

    #[test]
    fn test_parse_media_key_rejects_garbage() {
        assert!(parse_media_key("movie603").is_err());
        assert!(parse_media_key("book-12").is_err());
        assert!(parse_media_key("movie-abc").is_err());
    }

    #[test]
    fn test_watch_status_wire_format() {
        let json = serde_json::to_string(&WatchStatus::WillWatch).unwrap();
        assert_eq!(json, "\"will-watch\"");
        let parsed: WatchStatus = serde_json::from_str("\"on-hold\"").unwrap();
        assert_eq!(parsed, WatchStatus::OnHold);
    }

    #[test]
    fn test_watch_status_accepts_legacy_names() {
        assert_eq!("watched".parse::<WatchStatus>().unwrap(), WatchStatus::Completed);
        assert_eq!("willWatch".parse::<WatchStatus>().unwrap(), WatchStatus::WillWatch);
    }

    #[test]
    fn test_empty_of_user_data() {
        let now = Utc::now();
        let mut record = LibraryRecord::new(MediaType::Movie, 1, now);
        assert!(record.is_empty_of_user_data());

        record.is_favorite = true;
        assert!(!record.is_empty_of_user_data());

        record.is_favorite = false;
        record.notes = Some(String::new());
        assert!(record.is_empty_of_user_data());

        record.notes = Some("rewatch with commentary".to_string());
        assert!(!record.is_empty_of_user_data());
    }

    #[test]
    fn test_content_hash_tracks_sync_fields() {
        let now = Utc::now();
        let mut a = LibraryRecord::new(MediaType::Tv, 42, now);
        let b = a.clone();
        assert_eq!(a.content_hash(), b.content_hash());

        a.status = WatchStatus::Watching;
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_content_hash_ignores_display_fields() {
        let now = Utc::now();
        let mut a = LibraryRecord::new(MediaType::Movie, 7, now);
        let hash = a.content_hash();
        a.title = Some("Se7en".to_string());
        a.genres = vec!["Thriller".to_string()];
        assert_eq!(a.content_hash(), hash);
    }

    #[test]
    fn test_status_counts() {
        let now = Utc::now();
        let mut records = Vec::new();
        for (i, status) in [
            WatchStatus::Watching,
            WatchStatus::Watching,
            WatchStatus::Completed,
            WatchStatus::Dropped,
        ]
        .iter()
        .enumerate()
        {
            let mut r = LibraryRecord::new(MediaType::Movie, i as u64, now);
            r.status = *status;
            r.is_favorite = i == 0;
            records.push(r);
        }

        let counts = StatusCounts::tally(records.iter());
        assert_eq!(counts.all, 4);
        assert_eq!(counts.watching, 2);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.dropped, 1);
        assert_eq!(counts.favorites, 1);
        assert_eq!(counts.will_watch, 0);
    }
}
