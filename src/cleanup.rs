//! Retention cleanup for tombstoned rows.
//!
//! "Remove" only ever tombstones a library row so the deletion can reach
//! every device. This pass physically deletes rows whose tombstone is older
//! than the retention window. Intended to run on a schedule (see the
//! watchfolio-cleanup binary); one failing row does not abort the batch.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::backend::RemoteBackend;

/// Days a tombstone survives before physical deletion.
pub const RETENTION_DAYS: i64 = 30;

/// Rows fetched per listing request.
pub const CLEANUP_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted_count: usize,
    pub failure_count: usize,
    pub total_processed: usize,
}

pub async fn run_cleanup(backend: &dyn RemoteBackend, now: DateTime<Utc>) -> Result<CleanupReport> {
    let cutoff = now - Duration::days(RETENTION_DAYS);
    tracing::info!("Cleanup started, cutoff {}", cutoff.to_rfc3339());

    // Collect every expired row first; deleting while paging would shift
    // the offsets under us.
    let mut rows = Vec::new();
    let mut offset = 0;
    loop {
        let page = backend
            .list_expired_tombstones(cutoff, CLEANUP_PAGE_SIZE, offset)
            .await?;
        let fetched = page.items.len();
        rows.extend(page.items);
        offset += fetched;
        if fetched == 0 || rows.len() >= page.total {
            break;
        }
    }

    if rows.is_empty() {
        tracing::info!("No expired tombstones to clean up");
        return Ok(CleanupReport::default());
    }
    tracing::info!("Found {} rows to permanently delete", rows.len());

    let mut report = CleanupReport {
        total_processed: rows.len(),
        ..CleanupReport::default()
    };
    for row in &rows {
        match backend.delete_row(&row.row_id).await {
            Ok(()) => report.deleted_count += 1,
            Err(e) => {
                tracing::error!("Failed to delete row {}: {:#}", row.row_id, e);
                report.failure_count += 1;
            }
        }
    }

    tracing::info!(
        "Cleanup completed. Deleted: {}, failures: {}",
        report.deleted_count,
        report.failure_count
    );
    Ok(report)
}
