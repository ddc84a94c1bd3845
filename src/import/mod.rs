//! Archive import capability.
//!
//! Importing turns a downloaded archive into a permanent offline page.
//! Completions are reported as
//! [`PipelineEvent::ImportFinished`](crate::events::PipelineEvent).

mod file;

pub use file::{FileImporter, ImportError, PageManifest};

use std::path::PathBuf;

use crate::item::{ClientId, PrefetchItem};

/// Everything the importer needs to know about one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchArchiveInfo {
    /// Item being imported.
    pub offline_id: i64,
    /// Suggesting client.
    pub client_id: ClientId,
    /// URL as suggested.
    pub url: String,
    /// URL the archive was captured from.
    pub final_archived_url: String,
    /// Page title.
    pub title: String,
    /// Downloaded archive.
    pub file_path: PathBuf,
    /// Archive size in bytes.
    pub file_size: i64,
}

impl From<&PrefetchItem> for PrefetchArchiveInfo {
    fn from(item: &PrefetchItem) -> Self {
        Self {
            offline_id: item.offline_id,
            client_id: item.client_id.clone(),
            url: item.requested_url.clone(),
            final_archived_url: item.effective_url().to_string(),
            title: item.title.clone(),
            file_path: PathBuf::from(&item.file_path),
            file_size: item.file_size,
        }
    }
}

/// Importer capability.
pub trait Importer: Send + Sync {
    /// Starts importing one archive; returns without waiting for it.
    fn import_archive(&self, archive: PrefetchArchiveInfo);

    /// Offline ids of imports still running.
    fn ongoing_imports(&self) -> Vec<i64>;
}
