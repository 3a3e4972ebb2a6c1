//! Library sync coordinator.
//!
//! Reconciles the local store against the remote backend. One pass:
//! connectivity check → drain the offline queue in order → compare the two
//! sets → upload newer local records → fold newer remote records in via the
//! configured merge strategy.
//!
//! At most one pass runs at a time. A trigger landing mid-pass is neither
//! dropped nor queued; it collapses into a single pending flag and one
//! follow-up pass runs when the current one finishes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::backend::RemoteBackend;
use crate::config::SyncConfig;
use crate::connectivity::{is_network_error, ConnectivityProbe};
use crate::library_db::LibraryDb;
use crate::mapper;
use crate::record::{parse_media_key, LibraryRecord};

/// Where the coordinator currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Checking,
    Syncing,
    Offline,
    Error,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncState::Idle => "idle",
            SyncState::Checking => "checking",
            SyncState::Syncing => "syncing",
            SyncState::Offline => "offline",
            SyncState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Transient process-wide sync status. Not persisted, except the last-sync
/// checkpoint which lives in the library database.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub state: SyncState,
    pub pending_operations: usize,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// How downloaded records fold into the local set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeStrategy {
    /// Per key, the most recently updated side wins.
    #[default]
    Smart,
    /// The incoming set wins wholesale; an empty incoming set empties local.
    Overwrite,
    /// Local wins; only novel incoming keys are added.
    Skip,
}

impl std::str::FromStr for MergeStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "smart" => Ok(MergeStrategy::Smart),
            "overwrite" => Ok(MergeStrategy::Overwrite),
            "skip" => Ok(MergeStrategy::Skip),
            _ => Err(anyhow::anyhow!("Unknown merge strategy: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MergeOptions {
    pub strategy: MergeStrategy,
    /// Keep a locally-favorited entry favorited even when the winning copy
    /// isn't.
    pub keep_existing_favorites: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::Smart,
            keep_existing_favorites: true,
        }
    }
}

/// A mutation waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOperation {
    Upsert(String),
    Delete(String),
}

impl SyncOperation {
    pub fn key(&self) -> &str {
        match self {
            SyncOperation::Upsert(key) | SyncOperation::Delete(key) => key,
        }
    }
}

/// Outcome of comparing the local and remote sets.
#[derive(Debug, Clone, Default)]
pub struct SyncComparison {
    pub local_count: usize,
    pub remote_count: usize,
    /// Keys where local is newer or the remote copy is missing.
    pub needs_upload: Vec<String>,
    /// Keys where remote is newer or the local copy is missing.
    pub needs_download: Vec<String>,
}

impl SyncComparison {
    pub fn in_sync(&self) -> bool {
        self.needs_upload.is_empty() && self.needs_download.is_empty()
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub uploaded: usize,
    pub downloaded: usize,
    pub skipped_unchanged: usize,
    pub drained_operations: usize,
}

/// How a trigger resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Offline,
    NotAuthenticated,
    /// A pass was already in flight; this trigger collapsed into the
    /// pending flag.
    Coalesced,
    /// The one-shot initial sync has already run.
    InitialAlreadyRan,
    Failed(String),
}

/// Result of folding an incoming record set into the local one.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub merged: Vec<LibraryRecord>,
    /// Keys whose stored value changed relative to local.
    pub changes: Vec<String>,
}

/// Fold `incoming` into `local` under the given options. Pure; callers
/// persist the result.
pub fn merge_records(
    local: &[LibraryRecord],
    incoming: &[LibraryRecord],
    options: MergeOptions,
) -> MergeOutcome {
    let local_map: HashMap<String, &LibraryRecord> =
        local.iter().map(|r| (r.key(), r)).collect();

    let mut merged = Vec::new();
    let mut changes = Vec::new();

    match options.strategy {
        MergeStrategy::Overwrite => {
            // Incoming wins wholesale; local keys absent from it are dropped
            for record in incoming {
                let key = record.key();
                let mut kept = record.clone();
                if let Some(existing) = local_map.get(&key) {
                    if options.keep_existing_favorites {
                        kept.is_favorite = kept.is_favorite || existing.is_favorite;
                    }
                    if existing.content_hash() != kept.content_hash() {
                        changes.push(key);
                    }
                } else {
                    changes.push(key);
                }
                merged.push(kept);
            }
            let incoming_keys: HashMap<String, ()> =
                incoming.iter().map(|r| (r.key(), ())).collect();
            for record in local {
                if !incoming_keys.contains_key(&record.key()) {
                    changes.push(record.key());
                }
            }
        }
        MergeStrategy::Skip => {
            merged.extend(local.iter().cloned());
            for record in incoming {
                if !local_map.contains_key(&record.key()) {
                    changes.push(record.key());
                    merged.push(record.clone());
                }
            }
        }
        MergeStrategy::Smart => {
            let mut seen: HashMap<String, ()> = HashMap::new();
            for record in incoming {
                let key = record.key();
                seen.insert(key.clone(), ());
                match local_map.get(&key) {
                    Some(existing) => {
                        let mut winner = if record.last_updated_at > existing.last_updated_at {
                            record.clone()
                        } else {
                            (*existing).clone()
                        };
                        if options.keep_existing_favorites {
                            winner.is_favorite =
                                winner.is_favorite || existing.is_favorite || record.is_favorite;
                        }
                        winner.added_at = existing.added_at.min(record.added_at);
                        if winner.content_hash() != existing.content_hash() {
                            changes.push(key);
                        }
                        merged.push(winner);
                    }
                    None => {
                        changes.push(key);
                        merged.push(record.clone());
                    }
                }
            }
            for record in local {
                if !seen.contains_key(&record.key()) {
                    merged.push(record.clone());
                }
            }
        }
    }

    MergeOutcome { merged, changes }
}

/// Classify each side's keys by comparing mutation timestamps. Pure.
pub fn compare_sets(
    local: &[LibraryRecord],
    remote: &HashMap<String, LibraryRecord>,
) -> SyncComparison {
    let mut comparison = SyncComparison {
        local_count: local.len(),
        remote_count: remote.len(),
        ..SyncComparison::default()
    };

    let local_map: HashMap<String, &LibraryRecord> =
        local.iter().map(|r| (r.key(), r)).collect();

    for record in local {
        let key = record.key();
        match remote.get(&key) {
            None => comparison.needs_upload.push(key),
            Some(remote_record) => {
                if record.last_updated_at > remote_record.last_updated_at {
                    comparison.needs_upload.push(key);
                } else if remote_record.last_updated_at > record.last_updated_at {
                    comparison.needs_download.push(key);
                }
            }
        }
    }

    for key in remote.keys() {
        if !local_map.contains_key(key) {
            comparison.needs_download.push(key.clone());
        }
    }

    comparison.needs_upload.sort();
    comparison.needs_download.sort();
    comparison
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

const REMOTE_PAGE_SIZE: usize = 100;

pub struct SyncCoordinator {
    db: Arc<LibraryDb>,
    backend: Arc<dyn RemoteBackend>,
    probe: Arc<ConnectivityProbe>,

    auto_sync: bool,
    debounce: Duration,
    poll_interval: Duration,
    default_merge: MergeOptions,

    user_id: Mutex<Option<String>>,
    library_id: Mutex<Option<String>>,
    status: Mutex<SyncStatus>,
    queue: Mutex<VecDeque<SyncOperation>>,

    in_flight: AtomicBool,
    pending: AtomicBool,
    dirty_since: Mutex<Option<Instant>>,
    last_poll: Mutex<Option<Instant>>,
}

impl SyncCoordinator {
    pub fn new(
        db: Arc<LibraryDb>,
        backend: Arc<dyn RemoteBackend>,
        probe: Arc<ConnectivityProbe>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let strategy: MergeStrategy = config
            .merge_strategy
            .parse()
            .context("invalid merge_strategy in sync config")?;
        let last_sync_time = db.last_sync_time()?;

        Ok(Self {
            db,
            backend,
            probe,
            auto_sync: config.auto_sync,
            debounce: Duration::from_millis(config.debounce_ms),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            default_merge: MergeOptions {
                strategy,
                keep_existing_favorites: config.keep_existing_favorites,
            },
            user_id: Mutex::new(None),
            library_id: Mutex::new(None),
            status: Mutex::new(SyncStatus {
                state: SyncState::Idle,
                pending_operations: 0,
                last_sync_time,
                error: None,
            }),
            queue: Mutex::new(VecDeque::new()),
            in_flight: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            dirty_since: Mutex::new(None),
            last_poll: Mutex::new(None),
        })
    }

    pub fn default_merge_options(&self) -> MergeOptions {
        self.default_merge
    }

    pub fn status(&self) -> SyncStatus {
        lock(&self.status).clone()
    }

    /// Start or end the authenticated session. The cached library id is
    /// invalidated either way.
    pub fn set_session(&self, user_id: Option<String>) {
        *lock(&self.user_id) = user_id;
        *lock(&self.library_id) = None;
    }

    /// Record a local mutation for the next pass.
    ///
    /// Ops coalesce per key (latest wins); the debounce clock restarts; a
    /// pass already in flight gets a follow-up scheduled instead of losing
    /// this mutation.
    pub fn note_mutation(&self, operation: SyncOperation) {
        {
            let mut queue = lock(&self.queue);
            queue.retain(|op| op.key() != operation.key());
            queue.push_back(operation);
            lock(&self.status).pending_operations = queue.len();
        }
        *lock(&self.dirty_since) = Some(Instant::now());
        if self.in_flight.load(Ordering::SeqCst) {
            self.pending.store(true, Ordering::SeqCst);
        }
    }

    pub fn pending_operations(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Periodic driver, called roughly once a second by the run loop.
    /// Fires a pass when the debounce window closes, the poll interval
    /// elapses, or a coalesced trigger is waiting.
    pub async fn tick(&self) -> Option<SyncOutcome> {
        if !self.auto_sync {
            return None;
        }

        let mut fire = self.pending.load(Ordering::SeqCst);
        if let Some(dirty) = *lock(&self.dirty_since) {
            if dirty.elapsed() >= self.debounce {
                fire = true;
            }
        }
        match *lock(&self.last_poll) {
            Some(at) if at.elapsed() < self.poll_interval => {}
            _ => fire = true,
        }

        if !fire {
            return None;
        }
        *lock(&self.dirty_since) = None;
        *lock(&self.last_poll) = Some(Instant::now());
        Some(self.sync_now(self.default_merge).await)
    }

    /// Run one reconciliation pass now (or coalesce into the one in flight).
    pub async fn sync_now(&self, options: MergeOptions) -> SyncOutcome {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.pending.store(true, Ordering::SeqCst);
            return SyncOutcome::Coalesced;
        }

        let mut outcome = self.run_pass(options).await;
        while self.pending.swap(false, Ordering::SeqCst) {
            tracing::debug!("Trigger arrived mid-pass; running follow-up");
            outcome = self.run_pass(options).await;
        }
        self.in_flight.store(false, Ordering::SeqCst);
        outcome
    }

    /// One-shot first-session sync, guarded by a persisted has-run flag.
    pub async fn initial_sync(&self, options: MergeOptions) -> SyncOutcome {
        match self.db.initial_sync_done() {
            Ok(true) => return SyncOutcome::InitialAlreadyRan,
            Ok(false) => {}
            Err(e) => return SyncOutcome::Failed(format!("{:#}", e)),
        }

        let outcome = self.sync_now(options).await;
        if let SyncOutcome::Completed(_) = outcome {
            if let Err(e) = self.db.mark_initial_sync_done() {
                tracing::warn!("Could not persist initial-sync flag: {:#}", e);
            }
        }
        outcome
    }

    /// Compare local and remote sets without transferring anything.
    pub async fn check_sync_status(&self) -> Result<SyncComparison> {
        let user_id = lock(&self.user_id)
            .clone()
            .context("not authenticated")?;
        let library_id = self.library_id(&user_id).await?;
        let remote = self.fetch_remote(&library_id).await?;
        let local = self.db.all()?;
        Ok(compare_sets(&local, &remote))
    }

    async fn run_pass(&self, options: MergeOptions) -> SyncOutcome {
        self.set_state(SyncState::Checking, None);

        let user_id = match lock(&self.user_id).clone() {
            Some(id) => id,
            None => {
                tracing::debug!("Skipping sync pass: not authenticated");
                self.set_state(SyncState::Offline, None);
                return SyncOutcome::NotAuthenticated;
            }
        };

        if !self.probe.is_actually_online().await {
            tracing::debug!("Skipping sync pass: offline");
            self.set_state(SyncState::Offline, None);
            return SyncOutcome::Offline;
        }

        match self.reconcile(&user_id, options).await {
            Ok(report) => {
                let now = Utc::now();
                if let Err(e) = self.db.set_last_sync_time(now) {
                    tracing::warn!("Could not persist sync checkpoint: {:#}", e);
                }
                {
                    let pending = lock(&self.queue).len();
                    let mut status = lock(&self.status);
                    status.state = SyncState::Idle;
                    status.last_sync_time = Some(now);
                    status.error = None;
                    status.pending_operations = pending;
                }
                tracing::info!(
                    uploaded = report.uploaded,
                    downloaded = report.downloaded,
                    drained = report.drained_operations,
                    "Sync pass completed"
                );
                SyncOutcome::Completed(report)
            }
            Err(e) if is_network_error(&e) => {
                tracing::warn!("Sync pass lost connectivity: {:#}", e);
                self.set_state(SyncState::Offline, None);
                SyncOutcome::Offline
            }
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::error!("Sync pass failed: {}", message);
                self.set_state(SyncState::Error, Some(message.clone()));
                SyncOutcome::Failed(message)
            }
        }
    }

    async fn reconcile(&self, user_id: &str, options: MergeOptions) -> Result<SyncReport> {
        self.set_state(SyncState::Syncing, None);
        let library_id = self.library_id(user_id).await?;

        let mut report = SyncReport {
            drained_operations: self.drain_queue(&library_id).await?,
            ..SyncReport::default()
        };

        let remote = self.fetch_remote(&library_id).await?;
        let local = self.db.all()?;
        let comparison = compare_sets(&local, &remote);
        if comparison.in_sync() && options.strategy != MergeStrategy::Overwrite {
            return Ok(report);
        }

        // Upload local-newer records, except under overwrite where the
        // remote set is about to win wholesale anyway.
        if options.strategy != MergeStrategy::Overwrite {
            let local_map: HashMap<String, &LibraryRecord> =
                local.iter().map(|r| (r.key(), r)).collect();
            for key in &comparison.needs_upload {
                let record = match local_map.get(key) {
                    Some(record) => *record,
                    None => continue,
                };
                let hash = record.content_hash();
                if remote.contains_key(key) && self.db.last_uploaded_hash(key)? == Some(hash) {
                    report.skipped_unchanged += 1;
                    continue;
                }
                self.upload_record(&library_id, record)
                    .await
                    .with_context(|| format!("failed to upload {}", key))?;
                self.db.set_last_uploaded_hash(key, &hash)?;
                report.uploaded += 1;
            }
        }

        let apply_merge =
            !comparison.needs_download.is_empty() || options.strategy == MergeStrategy::Overwrite;
        if apply_merge {
            let incoming: Vec<LibraryRecord> = remote.values().cloned().collect();
            let outcome = merge_records(&local, &incoming, options);
            self.db.replace_all(&outcome.merged)?;
            report.downloaded = outcome.changes.len();
        }

        Ok(report)
    }

    async fn drain_queue(&self, library_id: &str) -> Result<usize> {
        let mut drained = 0;
        loop {
            let operation = lock(&self.queue).front().cloned();
            let Some(operation) = operation else {
                break;
            };

            // A failing op stays at the front for the next trigger
            self.execute_operation(library_id, &operation)
                .await
                .with_context(|| format!("failed to sync queued change for {}", operation.key()))?;

            let mut queue = lock(&self.queue);
            queue.pop_front();
            lock(&self.status).pending_operations = queue.len();
            drained += 1;
        }
        Ok(drained)
    }

    async fn execute_operation(&self, library_id: &str, operation: &SyncOperation) -> Result<()> {
        match operation {
            SyncOperation::Upsert(key) => {
                let (media_type, tmdb_id) = parse_media_key(key)?;
                match self.db.get(media_type, tmdb_id)? {
                    Some(record) => {
                        let hash = record.content_hash();
                        self.upload_record(library_id, &record).await?;
                        self.db.set_last_uploaded_hash(key, &hash)?;
                    }
                    // Dropped locally before the queue drained; nothing to push
                    None => {}
                }
                Ok(())
            }
            SyncOperation::Delete(key) => {
                let (media_type, tmdb_id) = parse_media_key(key)?;
                match self.db.get(media_type, tmdb_id)? {
                    Some(record) => {
                        let hash = record.content_hash();
                        self.upload_record(library_id, &record).await?;
                        self.db.set_last_uploaded_hash(key, &hash)?;
                    }
                    None => {
                        self.backend
                            .soft_delete_item(library_id, media_type, tmdb_id, Utc::now())
                            .await?;
                    }
                }
                Ok(())
            }
        }
    }

    async fn upload_record(&self, library_id: &str, record: &LibraryRecord) -> Result<()> {
        let (media, item) = mapper::local_to_server(record, library_id);
        let media_row_id = self.backend.upsert_media(&media).await?;
        self.backend
            .upsert_library_item(library_id, &media_row_id, &item)
            .await?;
        Ok(())
    }

    async fn fetch_remote(&self, library_id: &str) -> Result<HashMap<String, LibraryRecord>> {
        let mut records = HashMap::new();
        let mut offset = 0;
        loop {
            let page = self
                .backend
                .list_library_items(library_id, REMOTE_PAGE_SIZE, offset)
                .await?;
            let fetched = page.items.len();
            for stored in page.items {
                let record = mapper::server_to_local(&stored.item, &stored.media);
                records.insert(record.key(), record);
            }
            offset += fetched;
            if fetched == 0 || offset >= page.total {
                break;
            }
        }
        Ok(records)
    }

    async fn library_id(&self, user_id: &str) -> Result<String> {
        if let Some(id) = lock(&self.library_id).clone() {
            return Ok(id);
        }
        let id = self.backend.get_or_create_library(user_id).await?;
        *lock(&self.library_id) = Some(id.clone());
        Ok(id)
    }

    // Lock order is queue then status, matching note_mutation
    fn set_state(&self, state: SyncState, error: Option<String>) {
        let pending = lock(&self.queue).len();
        let mut status = lock(&self.status);
        status.state = state;
        status.error = error;
        status.pending_operations = pending;
    }
}
