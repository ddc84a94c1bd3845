//! Archive download capability.
//!
//! The pipeline talks to a [`Downloader`]: it starts downloads and asks
//! which ones are still running. Finished downloads are reported as
//! [`PipelineEvent::DownloadFinished`](crate::events::PipelineEvent) carrying a
//! [`DownloadResult`].
//!
//! # Features
//!
//! - [`HttpDownloader`] streams archives to `{archives_dir}/{guid}.mhtml`
//!   through a `.part` file, so a finished file on disk always means a
//!   complete download
//! - Failures are classified with [`classify_error`] into retryable and
//!   permanent outcomes
//!
//! # Example
//!
//! ```no_run
//! use prefetch_core::download::{DownloadRequest, Downloader, HttpDownloader, HttpDownloaderConfig};
//! use prefetch_core::events;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sender, _receiver) = events::channel();
//! let downloader = HttpDownloader::new(
//!     HttpDownloaderConfig::new("https://offlinepages.example.com/v1/media", "./archives"),
//!     sender,
//! )?;
//! downloader.start_download(DownloadRequest {
//!     download_id: "guid-1".to_string(),
//!     archive_body_name: "body-1".to_string(),
//!     expected_size: -1,
//! });
//! # Ok(())
//! # }
//! ```

pub(crate) mod constants;
mod error;
mod http;
mod retry;

pub use error::DownloadError;
pub use http::{HttpDownloader, HttpDownloaderConfig};
pub use retry::{FailureType, classify_error, classify_http_status};

use std::path::PathBuf;

/// A download the pipeline wants started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// The item's guid for this download cycle.
    pub download_id: String,
    /// Archive identity on the service.
    pub archive_body_name: String,
    /// Announced size in bytes, `-1` when unknown.
    pub expected_size: i64,
}

/// How a download ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The archive is complete on disk.
    Succeeded {
        /// Final archive path.
        file_path: PathBuf,
        /// Archive size in bytes.
        file_size: i64,
    },
    /// The download failed.
    Failed {
        /// Whether trying again later may succeed.
        retryable: bool,
    },
}

/// Completion report for one download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    /// Guid the download was started with.
    pub download_id: String,
    /// How it ended.
    pub outcome: DownloadOutcome,
}

impl DownloadResult {
    #[must_use]
    pub fn succeeded(download_id: impl Into<String>, file_path: impl Into<PathBuf>, file_size: i64) -> Self {
        Self {
            download_id: download_id.into(),
            outcome: DownloadOutcome::Succeeded {
                file_path: file_path.into(),
                file_size,
            },
        }
    }

    #[must_use]
    pub fn failed(download_id: impl Into<String>, retryable: bool) -> Self {
        Self {
            download_id: download_id.into(),
            outcome: DownloadOutcome::Failed { retryable },
        }
    }
}

/// Download engine capability.
pub trait Downloader: Send + Sync {
    /// Starts a download; returns without waiting for it.
    fn start_download(&self, request: DownloadRequest);

    /// Cancels a running download. No completion is reported for it.
    fn cancel_download(&self, download_id: &str);

    /// Guids of downloads still running.
    fn outstanding_download_ids(&self) -> Vec<String>;

    /// Completed archives on disk whose completion may never have been
    /// reported (for example after a crash).
    fn completed_downloads(&self) -> Vec<DownloadResult> {
        Vec::new()
    }
}
