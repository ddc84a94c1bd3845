use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Connection;
use tracing::{info, instrument};

use super::{RetryCounts, RetryStage};
use crate::download::{DownloadResult, Downloader};
use crate::item::{PrefetchItemErrorCode, PrefetchItemState};
use crate::store::items;
use crate::task::Task;
use crate::tasks::download_completed::{CompletionEffect, apply_download_result};
use crate::tasks::{TaskContext, log_store_failure};

const STAGE: RetryStage = RetryStage {
    in_flight: PrefetchItemState::Downloading,
    retry_to: PrefetchItemState::ReceivedBundle,
    exhausted: PrefetchItemErrorCode::DownloadMaxAttemptsReached,
};

/// Reconciles DOWNLOADING items with the downloader.
///
/// Items whose guid is still downloading are left alone. Items whose archive
/// finished without the completion being recorded (a crash in between) are
/// marked DOWNLOADED. The rest are retried or finalized by attempt count.
pub struct DownloadCleanupTask {
    ctx: TaskContext,
    downloader: Arc<dyn Downloader>,
}

impl DownloadCleanupTask {
    #[must_use]
    pub fn new(ctx: TaskContext, downloader: Arc<dyn Downloader>) -> Self {
        Self { ctx, downloader }
    }
}

#[async_trait]
impl Task for DownloadCleanupTask {
    fn name(&self) -> &'static str {
        "download_cleanup"
    }

    #[instrument(skip(self))]
    async fn run(&mut self) {
        let now = self.ctx.now();
        let outstanding: HashSet<String> = self.downloader.outstanding_download_ids().into_iter().collect();
        let completed: HashMap<String, DownloadResult> = self
            .downloader
            .completed_downloads()
            .into_iter()
            .map(|result| (result.download_id.clone(), result))
            .collect();

        let result = self
            .ctx
            .store
            .execute(move |conn| {
                Box::pin(async move {
                    let mut tx = conn.begin().await?;
                    let mut counts = RetryCounts::default();
                    let mut recovered = 0_usize;
                    for item in items::items_in_state(&mut tx, STAGE.in_flight).await? {
                        if outstanding.contains(&item.guid) {
                            continue;
                        }
                        if let Some(finished) = completed.get(&item.guid) {
                            if apply_download_result(&mut tx, finished, now).await?
                                == CompletionEffect::Downloaded
                            {
                                recovered += 1;
                            }
                            continue;
                        }
                        STAGE
                            .retry_or_finalize(
                                &mut tx,
                                item.offline_id,
                                item.download_initiation_attempts,
                                now,
                                &mut counts,
                            )
                            .await?;
                    }
                    tx.commit().await?;
                    Ok((counts, recovered))
                })
            })
            .await;

        match result {
            Ok((counts, 0)) if counts == RetryCounts::default() => {}
            Ok((counts, recovered)) => info!(
                retried = counts.retried,
                finalized = counts.finalized,
                recovered,
                "lost downloads reconciled"
            ),
            Err(err) => log_store_failure(self.name(), &err),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::DownloadRequest;
    use crate::item::MAX_ATTEMPTS;
    use crate::tasks::test_support::{context, item};
    use crate::testing::{FakeDownloader, read_all, read_item, seed_items};

    fn downloading(offline_id: i64, guid: &str, attempts: i64) -> crate::item::PrefetchItem {
        let mut it = item(offline_id, PrefetchItemState::Downloading);
        it.guid = guid.to_string();
        it.download_initiation_attempts = attempts;
        it
    }

    #[tokio::test]
    async fn test_unmatched_download_below_ceiling_reverts() {
        let (ctx, _clock) = context();
        seed_items(&ctx.store, vec![downloading(1, "g1", MAX_ATTEMPTS - 1)]).await.unwrap();

        DownloadCleanupTask::new(ctx.clone(), Arc::new(FakeDownloader::new())).run().await;

        let reverted = read_item(&ctx.store, 1).await.unwrap().unwrap();
        assert_eq!(reverted.state, PrefetchItemState::ReceivedBundle);
        assert_eq!(reverted.download_initiation_attempts, MAX_ATTEMPTS - 1);
    }

    #[tokio::test]
    async fn test_unmatched_download_at_ceiling_finishes() {
        let (ctx, _clock) = context();
        seed_items(&ctx.store, vec![downloading(1, "g1", MAX_ATTEMPTS)]).await.unwrap();

        DownloadCleanupTask::new(ctx.clone(), Arc::new(FakeDownloader::new())).run().await;

        let done = read_item(&ctx.store, 1).await.unwrap().unwrap();
        assert_eq!(done.state, PrefetchItemState::Finished);
        assert_eq!(done.error_code, PrefetchItemErrorCode::DownloadMaxAttemptsReached);
    }

    #[tokio::test]
    async fn test_running_download_is_left_alone_and_rerun_is_idempotent() {
        let (ctx, _clock) = context();
        seed_items(
            &ctx.store,
            vec![downloading(1, "g1", 1), downloading(2, "g2", 1)],
        )
        .await
        .unwrap();
        let downloader = Arc::new(FakeDownloader::new());
        downloader.start_download(DownloadRequest {
            download_id: "g1".to_string(),
            archive_body_name: "b".to_string(),
            expected_size: -1,
        });

        let mut task = DownloadCleanupTask::new(ctx.clone(), downloader.clone());
        task.run().await;
        assert_eq!(
            read_item(&ctx.store, 1).await.unwrap().unwrap().state,
            PrefetchItemState::Downloading
        );
        assert_eq!(
            read_item(&ctx.store, 2).await.unwrap().unwrap().state,
            PrefetchItemState::ReceivedBundle
        );

        let before = read_all(&ctx.store).await.unwrap();
        task.run().await;
        assert_eq!(read_all(&ctx.store).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_finished_archive_on_disk_is_recovered() {
        let (ctx, _clock) = context();
        seed_items(&ctx.store, vec![downloading(1, "g1", 1)]).await.unwrap();
        let downloader = Arc::new(FakeDownloader::new());
        downloader.add_completed(DownloadResult::succeeded("g1", "/archives/g1.mhtml", 77));

        DownloadCleanupTask::new(ctx.clone(), downloader).run().await;

        let recovered = read_item(&ctx.store, 1).await.unwrap().unwrap();
        assert_eq!(recovered.state, PrefetchItemState::Downloaded);
        assert_eq!(recovered.file_size, 77);
    }
}
