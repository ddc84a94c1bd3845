//! Deterministic collaborator doubles and store seeding helpers.
//!
//! The doubles record every call and keep their own "outstanding" sets, which
//! tests adjust to simulate lost requests, crashes and late completions.
//! Nothing here talks to the network or spawns work.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::download::{DownloadRequest, DownloadResult, Downloader};
use crate::import::{Importer, PrefetchArchiveInfo};
use crate::item::PrefetchItem;
use crate::network::RequestFactory;
use crate::store::{PrefetchStore, StoreError, items};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Request factory that records calls instead of sending them.
#[derive(Debug, Default)]
pub struct FakeRequestFactory {
    generate_requests: Mutex<Vec<(Vec<String>, String)>>,
    get_operation_requests: Mutex<Vec<String>>,
    outstanding_urls: Mutex<BTreeSet<String>>,
    outstanding_operations: Mutex<BTreeSet<String>>,
}

impl FakeRequestFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every GeneratePageBundle call as `(urls, token)`.
    #[must_use]
    pub fn generate_requests(&self) -> Vec<(Vec<String>, String)> {
        lock(&self.generate_requests).clone()
    }

    /// Every GetOperation call.
    #[must_use]
    pub fn get_operation_requests(&self) -> Vec<String> {
        lock(&self.get_operation_requests).clone()
    }

    /// Forgets every in-flight request, as if they were lost.
    pub fn clear_outstanding(&self) {
        lock(&self.outstanding_urls).clear();
        lock(&self.outstanding_operations).clear();
    }
}

impl RequestFactory for FakeRequestFactory {
    fn make_generate_page_bundle_request(&self, urls: Vec<String>, gcm_token: String) {
        lock(&self.outstanding_urls).extend(urls.iter().cloned());
        lock(&self.generate_requests).push((urls, gcm_token));
    }

    fn make_get_operation_request(&self, operation_name: String) {
        lock(&self.outstanding_operations).insert(operation_name.clone());
        lock(&self.get_operation_requests).push(operation_name);
    }

    fn outstanding_generate_urls(&self) -> Vec<String> {
        lock(&self.outstanding_urls).iter().cloned().collect()
    }

    fn outstanding_operation_names(&self) -> Vec<String> {
        lock(&self.outstanding_operations).iter().cloned().collect()
    }
}

/// Downloader that records requests and reports whatever the test sets up.
#[derive(Debug, Default)]
pub struct FakeDownloader {
    started: Mutex<Vec<DownloadRequest>>,
    cancelled: Mutex<Vec<String>>,
    outstanding: Mutex<BTreeSet<String>>,
    completed: Mutex<Vec<DownloadResult>>,
}

impl FakeDownloader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every started download.
    #[must_use]
    pub fn started(&self) -> Vec<DownloadRequest> {
        lock(&self.started).clone()
    }

    /// Every cancelled download id.
    #[must_use]
    pub fn cancelled(&self) -> Vec<String> {
        lock(&self.cancelled).clone()
    }

    /// Forgets every running download, as if the process restarted.
    pub fn clear_outstanding(&self) {
        lock(&self.outstanding).clear();
    }

    /// Marks `download_id` as finished on disk without a reported completion.
    pub fn add_completed(&self, result: DownloadResult) {
        lock(&self.outstanding).remove(&result.download_id);
        lock(&self.completed).push(result);
    }
}

impl Downloader for FakeDownloader {
    fn start_download(&self, request: DownloadRequest) {
        lock(&self.outstanding).insert(request.download_id.clone());
        lock(&self.started).push(request);
    }

    fn cancel_download(&self, download_id: &str) {
        lock(&self.outstanding).remove(download_id);
        lock(&self.cancelled).push(download_id.to_string());
    }

    fn outstanding_download_ids(&self) -> Vec<String> {
        lock(&self.outstanding).iter().cloned().collect()
    }

    fn completed_downloads(&self) -> Vec<DownloadResult> {
        lock(&self.completed).clone()
    }
}

/// Importer that records archives and keeps them "ongoing" until cleared.
#[derive(Debug, Default)]
pub struct FakeImporter {
    imported: Mutex<Vec<PrefetchArchiveInfo>>,
    ongoing: Mutex<BTreeSet<i64>>,
}

impl FakeImporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every archive handed over for import.
    #[must_use]
    pub fn imported(&self) -> Vec<PrefetchArchiveInfo> {
        lock(&self.imported).clone()
    }

    /// Forgets every running import, as if the process restarted.
    pub fn clear_ongoing(&self) {
        lock(&self.ongoing).clear();
    }
}

impl Importer for FakeImporter {
    fn import_archive(&self, archive: PrefetchArchiveInfo) {
        lock(&self.ongoing).insert(archive.offline_id);
        lock(&self.imported).push(archive);
    }

    fn ongoing_imports(&self) -> Vec<i64> {
        lock(&self.ongoing).iter().copied().collect()
    }
}

/// Inserts `items` in one transaction.
///
/// # Errors
///
/// Returns the store error if any insert fails; nothing is written then.
pub async fn seed_items(store: &PrefetchStore, seeded: Vec<PrefetchItem>) -> Result<(), StoreError> {
    store
        .execute(move |conn| {
            Box::pin(async move {
                use sqlx::Connection;
                let mut tx = conn.begin().await?;
                for item in &seeded {
                    items::insert_item(&mut tx, item).await?;
                }
                tx.commit().await?;
                Ok(())
            })
        })
        .await
}

/// Reads one item.
///
/// # Errors
///
/// Returns the store error if the read fails.
pub async fn read_item(store: &PrefetchStore, offline_id: i64) -> Result<Option<PrefetchItem>, StoreError> {
    store
        .execute(move |conn| Box::pin(async move { items::get_item(conn, offline_id).await }))
        .await
}

/// Reads every item, oldest first.
///
/// # Errors
///
/// Returns the store error if the read fails.
pub async fn read_all(store: &PrefetchStore) -> Result<Vec<PrefetchItem>, StoreError> {
    store
        .execute(|conn| Box::pin(async move { items::list_items(conn).await }))
        .await
}
