//! Self-healing and retirement tasks run on every maintenance tick.
//!
//! # Overview
//!
//! - [`GeneratePageBundleReconcileTask`] - SENT_GENERATE_PAGE_BUNDLE items
//!   whose request was lost
//! - [`SentGetOperationCleanupTask`] - SENT_GET_OPERATION items whose poll
//!   was lost
//! - [`DownloadCleanupTask`] - DOWNLOADING items without a running download
//! - [`ImportCleanupTask`] - IMPORTING items without a running import
//! - [`StaleEntryFinalizerTask`] - time-boxes every waiting state
//! - [`MetricsFinalizationTask`] - reports FINISHED items and retires them
//! - [`ArchiveFileReconcileTask`] - matches archive files against rows
//!
//! The cleanup tasks compare items claimed in flight with what the
//! collaborator reports as still outstanding. An unmatched item goes back one
//! stage while its attempt counter is below [`MAX_ATTEMPTS`]; otherwise it
//! finishes with the stage's MAX_ATTEMPTS_REACHED code. Running any of them
//! twice without an external event in between changes nothing the second
//! time.
//!
//! [`MAX_ATTEMPTS`]: crate::item::MAX_ATTEMPTS

mod archive_files;
mod download_cleanup;
mod generate_bundle;
mod import_cleanup;
mod metrics_finalization;
mod sent_get_operation;
mod stale_entries;

pub use archive_files::ArchiveFileReconcileTask;
pub use download_cleanup::DownloadCleanupTask;
pub use generate_bundle::GeneratePageBundleReconcileTask;
pub use import_cleanup::ImportCleanupTask;
pub use metrics_finalization::MetricsFinalizationTask;
pub use sent_get_operation::SentGetOperationCleanupTask;
pub use stale_entries::{DefaultStalenessPolicy, StaleRule, StaleEntryFinalizerTask, StalenessPolicy};

use sqlx::SqliteConnection;
use time::OffsetDateTime;

use crate::item::{MAX_ATTEMPTS, PrefetchItemErrorCode, PrefetchItemState};
use crate::store::{StoreError, items};

/// Result of retrying or finalizing a set of unmatched items.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryCounts {
    pub retried: usize,
    pub finalized: usize,
}

/// One in-flight stage: where unmatched items sit, where they retry from,
/// and the code they finish with once attempts run out.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryStage {
    pub in_flight: PrefetchItemState,
    pub retry_to: PrefetchItemState,
    pub exhausted: PrefetchItemErrorCode,
}

impl RetryStage {
    /// Sends an unmatched item back to `retry_to`, or finishes it once
    /// `attempts` reached the ceiling.
    pub(crate) async fn retry_or_finalize(
        &self,
        conn: &mut SqliteConnection,
        offline_id: i64,
        attempts: i64,
        now: OffsetDateTime,
        counts: &mut RetryCounts,
    ) -> Result<(), StoreError> {
        if attempts >= MAX_ATTEMPTS {
            if items::finalize_item(conn, offline_id, self.in_flight, self.exhausted).await? {
                counts.finalized += 1;
            }
        } else if items::move_item(conn, offline_id, self.in_flight, self.retry_to, now).await? {
            counts.retried += 1;
        }
        Ok(())
    }
}
