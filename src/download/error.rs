//! Why an archive download failed.

use std::path::PathBuf;

use thiserror::Error;

/// Failure while fetching one archive body to disk.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The request never produced a response (DNS, connect, TLS, body read).
    #[error("archive request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("archive download from {url} timed out")]
    TimedOut { url: String },

    /// The media endpoint answered with a non-success status.
    #[error("media service answered {status} for {url}")]
    Rejected { url: String, status: u16 },

    /// Creating, writing or renaming the archive file failed.
    #[error("cannot write archive {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot build an archive URL from {url}")]
    BadUrl { url: String },

    /// Bytes on disk differ from the body length the service announced.
    #[error("archive {path} has {actual_bytes} bytes, service announced {expected_bytes}")]
    SizeMismatch {
        path: PathBuf,
        expected_bytes: u64,
        actual_bytes: u64,
    },
}

impl DownloadError {
    pub fn transport(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            url: url.into(),
            source,
        }
    }

    pub fn timed_out(url: impl Into<String>) -> Self {
        Self::TimedOut { url: url.into() }
    }

    pub fn rejected(url: impl Into<String>, status: u16) -> Self {
        Self::Rejected {
            url: url.into(),
            status,
        }
    }

    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }

    pub fn bad_url(url: impl Into<String>) -> Self {
        Self::BadUrl { url: url.into() }
    }

    pub fn size_mismatch(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::SizeMismatch {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }
}
