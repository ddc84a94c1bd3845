//! Pipeline tasks.
//!
//! # Overview
//!
//! Action tasks move items forward one edge of the state machine:
//!
//! - [`AddUniqueUrlsTask`] - candidate URLs become NEW_REQUEST rows
//! - [`GeneratePageBundleTask`] - NEW_REQUEST items are sent for rendering
//! - [`PageBundleUpdateTask`] - records a bundle response per page
//! - [`MarkOperationDoneTask`] - a push marks an operation's items RECEIVED_GCM
//! - [`GetOperationTask`] - RECEIVED_GCM items are polled
//! - [`DownloadArchivesTask`] - RECEIVED_BUNDLE items start downloading
//! - [`DownloadCompletedTask`] - records a download outcome
//! - [`ImportArchivesTask`] - DOWNLOADED items are handed to the importer
//! - [`ImportCompletedTask`] - records an import outcome
//! - [`RemoveUrlsTask`] - client-driven invalidation and removal
//!
//! Reconciliation tasks (see [`reconcile`]) repair items whose external
//! operation was lost, time-box every state and retire finished items.
//!
//! Every task does its store work in one transaction, calls collaborators
//! only after the commit, and never waits for their results.

mod add_unique_urls;
mod download_archives;
mod download_completed;
mod generate_page_bundle;
mod get_operation;
mod import_archives;
mod mark_operation_done;
mod page_bundle_update;
pub mod reconcile;
mod remove_urls;

pub use add_unique_urls::{AddUniqueUrlsTask, PrefetchUrl};
pub use download_archives::{DEFAULT_MAX_CONCURRENT_DOWNLOADS, DownloadArchivesTask};
pub use download_completed::DownloadCompletedTask;
pub use generate_page_bundle::{DEFAULT_MAX_URLS_PER_BUNDLE, GeneratePageBundleTask};
pub use get_operation::GetOperationTask;
pub use import_archives::{ImportArchivesTask, ImportCompletedTask};
pub use mark_operation_done::MarkOperationDoneTask;
pub use page_bundle_update::PageBundleUpdateTask;
pub use remove_urls::{RemovalScope, RemoveUrlsTask};

use std::fmt;
use std::sync::Arc;

use time::OffsetDateTime;
use tracing::warn;

use crate::clock::Clock;
use crate::store::{PrefetchStore, StoreError};

/// Store handle and clock shared by every task.
#[derive(Clone)]
pub struct TaskContext {
    pub store: PrefetchStore,
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    #[must_use]
    pub fn new(store: PrefetchStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub(crate) fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }
}

/// Logs a failed store step. The transaction was already rolled back.
pub(crate) fn log_store_failure(task: &'static str, err: &StoreError) {
    warn!(task, error = %err, "store step failed; no changes were made");
}

/// Items and clock used by task unit tests.
#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use time::OffsetDateTime;

    use super::TaskContext;
    use crate::clock::TestClock;
    use crate::item::{ClientId, PrefetchItem, PrefetchItemState};
    use crate::store::PrefetchStore;

    pub const T0: i64 = 1_700_000_000;

    pub fn context() -> (TaskContext, Arc<TestClock>) {
        let clock = Arc::new(TestClock::at_unix(T0));
        let ctx = TaskContext::new(PrefetchStore::in_memory(), clock.clone());
        (ctx, clock)
    }

    pub fn t0() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(T0).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    pub fn item(offline_id: i64, state: PrefetchItemState) -> PrefetchItem {
        let mut item = PrefetchItem::new_request(
            offline_id,
            ClientId::new("ns", format!("c{offline_id}")),
            format!("https://site.test/{offline_id}"),
            format!("Page {offline_id}"),
            t0(),
        );
        item.state = state;
        item
    }
}
