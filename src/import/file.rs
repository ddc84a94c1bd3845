//! Filesystem importer: moves archives into the pages directory and writes a
//! JSON manifest next to each.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::{Importer, PrefetchArchiveInfo};
use crate::events::{EventSender, PipelineEvent};

/// Errors from one import.
#[derive(Debug, Error)]
pub enum ImportError {
    /// The archive to import is gone.
    #[error("archive not found: {path}")]
    MissingArchive {
        /// Expected archive path.
        path: PathBuf,
    },

    /// Filesystem failure.
    #[error("IO error importing to {path}: {source}")]
    Io {
        /// Path being written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The manifest could not be serialized.
    #[error("cannot write manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

impl ImportError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Metadata stored beside each imported page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageManifest {
    pub offline_id: i64,
    pub client_namespace: String,
    pub client_id: String,
    pub url: String,
    pub final_url: String,
    pub title: String,
    pub file_size: i64,
    pub archive_file: String,
}

/// Imports archives into `pages_dir`.
#[derive(Debug, Clone)]
pub struct FileImporter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    pages_dir: PathBuf,
    events: EventSender,
    ongoing: DashSet<i64>,
}

impl FileImporter {
    #[must_use]
    pub fn new(pages_dir: impl Into<PathBuf>, events: EventSender) -> Self {
        Self {
            inner: Arc::new(Inner {
                pages_dir: pages_dir.into(),
                events,
                ongoing: DashSet::new(),
            }),
        }
    }

    /// Where the page for `offline_id` ends up.
    #[must_use]
    pub fn page_path(&self, offline_id: i64) -> PathBuf {
        self.inner.pages_dir.join(format!("{offline_id}.mhtml"))
    }
}

impl Importer for FileImporter {
    #[instrument(skip(self, archive), fields(offline_id = archive.offline_id))]
    fn import_archive(&self, archive: PrefetchArchiveInfo) {
        if !self.inner.ongoing.insert(archive.offline_id) {
            debug!("import already running");
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let offline_id = archive.offline_id;
            let success = match import(&inner.pages_dir, &archive).await {
                Ok(path) => {
                    info!(offline_id, path = %path.display(), "page imported");
                    true
                }
                Err(err) => {
                    warn!(offline_id, error = %err, "import failed");
                    false
                }
            };
            if inner
                .events
                .send(PipelineEvent::ImportFinished {
                    offline_id,
                    success,
                })
                .is_err()
            {
                debug!(offline_id, "event receiver closed");
            }
            inner.ongoing.remove(&offline_id);
        });
    }

    fn ongoing_imports(&self) -> Vec<i64> {
        self.inner.ongoing.iter().map(|id| *id.key()).collect()
    }
}

async fn import(pages_dir: &Path, archive: &PrefetchArchiveInfo) -> Result<PathBuf, ImportError> {
    if !tokio::fs::try_exists(&archive.file_path).await.unwrap_or(false) {
        return Err(ImportError::MissingArchive {
            path: archive.file_path.clone(),
        });
    }
    tokio::fs::create_dir_all(pages_dir)
        .await
        .map_err(|e| ImportError::io(pages_dir, e))?;

    let page_path = pages_dir.join(format!("{}.mhtml", archive.offline_id));
    move_file(&archive.file_path, &page_path).await?;

    let manifest = PageManifest {
        offline_id: archive.offline_id,
        client_namespace: archive.client_id.name_space.clone(),
        client_id: archive.client_id.id.clone(),
        url: archive.url.clone(),
        final_url: archive.final_archived_url.clone(),
        title: archive.title.clone(),
        file_size: archive.file_size,
        archive_file: page_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    let manifest_path = pages_dir.join(format!("{}.json", archive.offline_id));
    let json = serde_json::to_vec_pretty(&manifest)?;
    tokio::fs::write(&manifest_path, json)
        .await
        .map_err(|e| ImportError::io(&manifest_path, e))?;

    Ok(page_path)
}

/// Renames, falling back to copy-and-delete across filesystems.
async fn move_file(from: &Path, to: &Path) -> Result<(), ImportError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| ImportError::io(to, e))?;
    tokio::fs::remove_file(from)
        .await
        .map_err(|e| ImportError::io(from, e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::events;
    use crate::item::ClientId;

    fn archive(offline_id: i64, file_path: PathBuf) -> PrefetchArchiveInfo {
        PrefetchArchiveInfo {
            offline_id,
            client_id: ClientId::new("ns", "c1"),
            url: "https://a.test/".to_string(),
            final_archived_url: "https://a.test/final".to_string(),
            title: "A".to_string(),
            file_path,
            file_size: 5,
        }
    }

    #[tokio::test]
    async fn test_import_moves_archive_and_writes_manifest() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("g1.mhtml");
        std::fs::write(&source, b"hello").unwrap();
        let pages = dir.path().join("pages");

        let (sender, mut receiver) = events::channel();
        let importer = FileImporter::new(&pages, sender);
        importer.import_archive(archive(7, source.clone()));

        let event = receiver.recv().await.unwrap();
        assert_eq!(
            event,
            PipelineEvent::ImportFinished {
                offline_id: 7,
                success: true
            }
        );
        assert!(!source.exists());
        assert_eq!(std::fs::read(importer.page_path(7)).unwrap(), b"hello");
        let manifest: PageManifest =
            serde_json::from_slice(&std::fs::read(pages.join("7.json")).unwrap()).unwrap();
        assert_eq!(manifest.final_url, "https://a.test/final");
        assert_eq!(manifest.archive_file, "7.mhtml");
    }

    #[tokio::test]
    async fn test_import_of_missing_archive_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let (sender, mut receiver) = events::channel();
        let importer = FileImporter::new(dir.path().join("pages"), sender);
        importer.import_archive(archive(8, dir.path().join("gone.mhtml")));

        let event = receiver.recv().await.unwrap();
        assert_eq!(
            event,
            PipelineEvent::ImportFinished {
                offline_id: 8,
                success: false
            }
        );
    }
}
