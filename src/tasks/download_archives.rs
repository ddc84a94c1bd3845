use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Connection;
use tracing::{debug, info, instrument};

use super::{TaskContext, log_store_failure};
use crate::download::{DownloadRequest, Downloader};
use crate::ids::IdProvider;
use crate::item::{PrefetchItemState, to_micros};
use crate::store::schema::ITEMS_TABLE;
use crate::store::{DownloaderQuota, items};
use crate::task::Task;

/// Default ceiling on items DOWNLOADING at once.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 2;

/// Claims RECEIVED_BUNDLE items for download.
///
/// In one transaction: every item that fits the free download slots and the
/// replenished quota gets a fresh guid, moves to DOWNLOADING with its attempt
/// counter incremented, and has its announced size debited from the quota.
/// Only after the commit is one download started per claimed item, so an
/// item is never DOWNLOADING without a request having been issued or the
/// crash between the two being visible to download cleanup.
pub struct DownloadArchivesTask {
    ctx: TaskContext,
    downloader: Arc<dyn Downloader>,
    ids: Arc<dyn IdProvider>,
    quota: DownloaderQuota,
    max_concurrent: usize,
}

impl DownloadArchivesTask {
    #[must_use]
    pub fn new(
        ctx: TaskContext,
        downloader: Arc<dyn Downloader>,
        ids: Arc<dyn IdProvider>,
        quota: DownloaderQuota,
        max_concurrent: usize,
    ) -> Self {
        Self {
            ctx,
            downloader,
            ids,
            quota,
            max_concurrent,
        }
    }
}

#[async_trait]
impl Task for DownloadArchivesTask {
    fn name(&self) -> &'static str {
        "download_archives"
    }

    #[instrument(skip(self), fields(max_concurrent = self.max_concurrent))]
    async fn run(&mut self) {
        let now = self.ctx.now();
        let ids = Arc::clone(&self.ids);
        let quota = self.quota;
        let max_concurrent = i64::try_from(self.max_concurrent).unwrap_or(i64::MAX);

        let result = self
            .ctx
            .store
            .execute(move |conn| {
                Box::pin(async move {
                    let mut tx = conn.begin().await?;
                    let downloading: i64 = sqlx::query_scalar(&format!(
                        "SELECT COUNT(*) FROM {ITEMS_TABLE} WHERE state = ?"
                    ))
                    .bind(PrefetchItemState::Downloading.to_db())
                    .fetch_one(&mut *tx)
                    .await?;
                    let mut slots = max_concurrent.saturating_sub(downloading);
                    if slots <= 0 {
                        debug!(downloading, "no free download slots");
                        return Ok(Vec::new());
                    }

                    let mut available = quota.get_available_quota(&mut tx, now).await?;
                    let mut scheduled = Vec::new();
                    for item in items::items_in_state(&mut tx, PrefetchItemState::ReceivedBundle).await? {
                        let size = item.archive_body_length.max(0);
                        if size > available {
                            debug!(offline_id = item.offline_id, size, available, "archive exceeds quota");
                            continue;
                        }
                        let guid = ids.next_guid();
                        sqlx::query(&format!(
                            "UPDATE {ITEMS_TABLE} SET state = ?, guid = ?, freshness_time = ?, \
                             download_initiation_attempts = download_initiation_attempts + 1 \
                             WHERE offline_id = ?"
                        ))
                        .bind(PrefetchItemState::Downloading.to_db())
                        .bind(&guid)
                        .bind(to_micros(now))
                        .bind(item.offline_id)
                        .execute(&mut *tx)
                        .await?;

                        available -= size;
                        scheduled.push(DownloadRequest {
                            download_id: guid,
                            archive_body_name: item.archive_body_name,
                            expected_size: item.archive_body_length,
                        });
                        slots -= 1;
                        if slots == 0 {
                            break;
                        }
                    }

                    if !scheduled.is_empty() {
                        quota.set_available_quota(&mut tx, now, available).await?;
                    }
                    tx.commit().await?;
                    Ok(scheduled)
                })
            })
            .await;

        match result {
            Ok(scheduled) => {
                if !scheduled.is_empty() {
                    info!(downloads = scheduled.len(), "starting archive downloads");
                }
                for request in scheduled {
                    self.downloader.start_download(request);
                }
            }
            Err(err) => log_store_failure(self.name(), &err),
        }
    }
}
