//! HTTP implementation of [`Downloader`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::future::{AbortHandle, Abortable};
use reqwest::Client;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::constants::{
    ARCHIVE_EXTENSION, CONNECT_TIMEOUT_SECS, PARTIAL_EXTENSION, READ_TIMEOUT_SECS,
};
use super::retry::classify_error;
use super::{DownloadError, DownloadRequest, DownloadResult, Downloader};
use crate::events::{EventSender, PipelineEvent};
use crate::user_agent;

/// Settings for [`HttpDownloader`].
#[derive(Debug, Clone)]
pub struct HttpDownloaderConfig {
    /// Base URL archives are fetched from; the body name is appended.
    pub download_base_url: String,
    /// Destination directory.
    pub archives_dir: PathBuf,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Read timeout.
    pub read_timeout: Duration,
}

impl HttpDownloaderConfig {
    #[must_use]
    pub fn new(download_base_url: impl Into<String>, archives_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_base_url: download_base_url.into(),
            archives_dir: archives_dir.into(),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
        }
    }

    #[must_use]
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

/// Streams archives over HTTP and reports completions as events.
///
/// Cheap to clone; clones share outstanding-download bookkeeping.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    client: Client,
    config: HttpDownloaderConfig,
    events: EventSender,
    outstanding: DashMap<String, AbortHandle>,
}

impl HttpDownloader {
    /// Builds the HTTP client.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error when the TLS backend cannot be
    /// initialized.
    pub fn new(config: HttpDownloaderConfig, events: EventSender) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .gzip(true)
            .user_agent(user_agent::default_user_agent())
            .build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                config,
                events,
                outstanding: DashMap::new(),
            }),
        })
    }

    /// Final archive path for a guid.
    #[must_use]
    pub fn archive_path(&self, download_id: &str) -> PathBuf {
        archive_path(&self.inner.config.archives_dir, download_id)
    }
}

fn archive_path(dir: &Path, download_id: &str) -> PathBuf {
    dir.join(format!("{download_id}.{ARCHIVE_EXTENSION}"))
}

fn partial_path(dir: &Path, download_id: &str) -> PathBuf {
    dir.join(format!("{download_id}.{PARTIAL_EXTENSION}"))
}

impl Downloader for HttpDownloader {
    #[instrument(skip(self, request), fields(download_id = %request.download_id))]
    fn start_download(&self, request: DownloadRequest) {
        let (handle, registration) = AbortHandle::new_pair();
        if self
            .inner
            .outstanding
            .insert(request.download_id.clone(), handle)
            .is_some()
        {
            warn!("download id already outstanding; replacing");
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let download_id = request.download_id.clone();
            let download = Abortable::new(download_archive(&inner, &request), registration);
            let Ok(result) = download.await else {
                debug!(%download_id, "download cancelled");
                return;
            };

            let report = match result {
                Ok((file_path, file_size)) => {
                    DownloadResult::succeeded(download_id.clone(), file_path, file_size)
                }
                Err(err) => {
                    let retryable = classify_error(&err).is_retryable();
                    warn!(%download_id, error = %err, retryable, "archive download failed");
                    DownloadResult::failed(download_id.clone(), retryable)
                }
            };
            // The id stays outstanding until its completion is queued.
            if inner.events.send(PipelineEvent::DownloadFinished(report)).is_err() {
                debug!(%download_id, "event receiver closed");
            }
            inner.outstanding.remove(&download_id);
        });
    }

    fn cancel_download(&self, download_id: &str) {
        if let Some((_, handle)) = self.inner.outstanding.remove(download_id) {
            handle.abort();
            let partial = partial_path(&self.inner.config.archives_dir, download_id);
            if let Err(err) = std::fs::remove_file(&partial) {
                debug!(path = %partial.display(), error = %err, "no partial file to remove");
            }
            info!(download_id, "download cancelled");
        }
    }

    fn outstanding_download_ids(&self) -> Vec<String> {
        self.inner
            .outstanding
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn completed_downloads(&self) -> Vec<DownloadResult> {
        let Ok(entries) = std::fs::read_dir(&self.inner.config.archives_dir) else {
            return Vec::new();
        };
        let suffix = format!(".{ARCHIVE_EXTENSION}");
        entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let download_id = name.strip_suffix(&suffix)?.to_string();
                if self.inner.outstanding.contains_key(&download_id) {
                    return None;
                }
                let size = entry.metadata().ok()?.len();
                Some(DownloadResult::succeeded(
                    download_id,
                    entry.path(),
                    i64::try_from(size).unwrap_or(i64::MAX),
                ))
            })
            .collect()
    }
}

#[instrument(skip(inner, request), fields(download_id = %request.download_id))]
async fn download_archive(
    inner: &Inner,
    request: &DownloadRequest,
) -> Result<(PathBuf, i64), DownloadError> {
    let base = inner.config.download_base_url.trim_end_matches('/');
    let url_string = format!("{base}/{}", request.archive_body_name);
    let url = Url::parse(&url_string).map_err(|_| DownloadError::bad_url(url_string.clone()))?;

    let dir = &inner.config.archives_dir;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| DownloadError::write(dir.clone(), e))?;

    let response = inner.client.get(url.clone()).send().await.map_err(|e| {
        if e.is_timeout() {
            DownloadError::timed_out(url.as_str())
        } else {
            DownloadError::transport(url.as_str(), e)
        }
    })?;
    if !response.status().is_success() {
        return Err(DownloadError::rejected(url.as_str(), response.status().as_u16()));
    }

    let partial = partial_path(dir, &request.download_id);
    let mut file = File::create(&partial)
        .await
        .map_err(|e| DownloadError::write(partial.clone(), e))?;

    let streamed = stream_to_file(&mut file, response, url.as_str(), &partial).await;
    drop(file);
    let bytes_written = match streamed {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(path = %partial.display(), "cleaning up partial file after error");
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err);
        }
    };

    let expected = u64::try_from(request.expected_size).ok();
    if let Some(expected) = expected.filter(|expected| *expected != bytes_written) {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(DownloadError::size_mismatch(partial, expected, bytes_written));
    }

    let final_path = archive_path(dir, &request.download_id);
    tokio::fs::rename(&partial, &final_path)
        .await
        .map_err(|e| DownloadError::write(final_path.clone(), e))?;

    info!(path = %final_path.display(), bytes = bytes_written, "archive downloaded");
    Ok((final_path, i64::try_from(bytes_written).unwrap_or(i64::MAX)))
}

/// Streams response body to file, returning bytes written.
async fn stream_to_file(
    file: &mut File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| DownloadError::transport(url, e))?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::write(file_path.to_path_buf(), e))?;

        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::write(file_path.to_path_buf(), e))?;

    Ok(bytes_written)
}
