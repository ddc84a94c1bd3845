use async_trait::async_trait;
use sqlx::{Connection, SqliteConnection};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use super::{TaskContext, log_store_failure};
use crate::download::{DownloadOutcome, DownloadResult};
use crate::item::{MAX_ATTEMPTS, PrefetchItem, PrefetchItemErrorCode, PrefetchItemState, to_micros};
use crate::store::schema::ITEMS_TABLE;
use crate::store::{StoreError, items};
use crate::task::Task;

/// What a download completion did to its item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompletionEffect {
    Downloaded,
    Retry,
    Finished(PrefetchItemErrorCode),
    Ignored,
}

/// Applies one download result to the item carrying its guid.
///
/// A success is accepted from DOWNLOADING and also from RECEIVED_BUNDLE, so a
/// completion arriving after download cleanup already reverted the item
/// still wins. Failures only apply to DOWNLOADING items.
pub(crate) async fn apply_download_result(
    conn: &mut SqliteConnection,
    result: &DownloadResult,
    now: OffsetDateTime,
) -> Result<CompletionEffect, StoreError> {
    let item = sqlx::query_as::<_, PrefetchItem>(&format!(
        "SELECT * FROM {ITEMS_TABLE} WHERE guid = ? AND state IN (?, ?)"
    ))
    .bind(&result.download_id)
    .bind(PrefetchItemState::Downloading.to_db())
    .bind(PrefetchItemState::ReceivedBundle.to_db())
    .fetch_optional(&mut *conn)
    .await?;
    let Some(item) = item else {
        return Ok(CompletionEffect::Ignored);
    };

    match &result.outcome {
        DownloadOutcome::Succeeded {
            file_path,
            file_size,
        } => {
            sqlx::query(&format!(
                "UPDATE {ITEMS_TABLE} SET state = ?, freshness_time = ?, file_path = ?, file_size = ? \
                 WHERE offline_id = ?"
            ))
            .bind(PrefetchItemState::Downloaded.to_db())
            .bind(to_micros(now))
            .bind(file_path.to_string_lossy().into_owned())
            .bind(*file_size)
            .bind(item.offline_id)
            .execute(&mut *conn)
            .await?;
            Ok(CompletionEffect::Downloaded)
        }
        DownloadOutcome::Failed { .. } if item.state != PrefetchItemState::Downloading => {
            Ok(CompletionEffect::Ignored)
        }
        DownloadOutcome::Failed { retryable: true } if item.download_initiation_attempts < MAX_ATTEMPTS => {
            items::move_item(
                conn,
                item.offline_id,
                PrefetchItemState::Downloading,
                PrefetchItemState::ReceivedBundle,
                now,
            )
            .await?;
            Ok(CompletionEffect::Retry)
        }
        DownloadOutcome::Failed { retryable } => {
            let code = if *retryable {
                PrefetchItemErrorCode::DownloadMaxAttemptsReached
            } else {
                PrefetchItemErrorCode::DownloadError
            };
            items::finalize_item(conn, item.offline_id, PrefetchItemState::Downloading, code).await?;
            Ok(CompletionEffect::Finished(code))
        }
    }
}

/// Records the outcome of one download.
pub struct DownloadCompletedTask {
    ctx: TaskContext,
    result: DownloadResult,
}

impl DownloadCompletedTask {
    #[must_use]
    pub fn new(ctx: TaskContext, result: DownloadResult) -> Self {
        Self { ctx, result }
    }
}

#[async_trait]
impl Task for DownloadCompletedTask {
    fn name(&self) -> &'static str {
        "download_completed"
    }

    #[instrument(skip(self), fields(download_id = %self.result.download_id))]
    async fn run(&mut self) {
        let now = self.ctx.now();
        let result = self.result.clone();
        let applied = self
            .ctx
            .store
            .execute(move |conn| {
                Box::pin(async move {
                    let mut tx = conn.begin().await?;
                    let effect = apply_download_result(&mut tx, &result, now).await?;
                    tx.commit().await?;
                    Ok(effect)
                })
            })
            .await;

        match applied {
            Ok(CompletionEffect::Downloaded) => info!("archive recorded as downloaded"),
            Ok(CompletionEffect::Retry) => info!("download will be retried"),
            Ok(CompletionEffect::Finished(code)) => warn!(error_code = %code, "download failed permanently"),
            Ok(CompletionEffect::Ignored) => debug!("no item waiting for this download"),
            Err(err) => log_store_failure(self.name(), &err),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::tasks::test_support::{context, item};
    use crate::testing::{read_item, seed_items};

    fn downloading(offline_id: i64, guid: &str, attempts: i64) -> PrefetchItem {
        let mut it = item(offline_id, PrefetchItemState::Downloading);
        it.guid = guid.to_string();
        it.archive_body_name = "body".to_string();
        it.download_initiation_attempts = attempts;
        it
    }

    async fn complete(ctx: &TaskContext, result: DownloadResult) {
        DownloadCompletedTask::new(ctx.clone(), result).run().await;
    }

    // ==================== Success Tests ====================

    #[tokio::test]
    async fn test_success_records_file() {
        let (ctx, _clock) = context();
        seed_items(&ctx.store, vec![downloading(1, "g1", 1)]).await.unwrap();

        complete(&ctx, DownloadResult::succeeded("g1", "/tmp/g1.mhtml", 42)).await;

        let done = read_item(&ctx.store, 1).await.unwrap().unwrap();
        assert_eq!(done.state, PrefetchItemState::Downloaded);
        assert_eq!(done.file_path, "/tmp/g1.mhtml");
        assert_eq!(done.file_size, 42);
    }

    #[tokio::test]
    async fn test_late_success_wins_after_revert() {
        let (ctx, _clock) = context();
        let mut reverted = downloading(1, "g1", 1);
        reverted.state = PrefetchItemState::ReceivedBundle;
        seed_items(&ctx.store, vec![reverted]).await.unwrap();

        complete(&ctx, DownloadResult::succeeded("g1", "/tmp/g1.mhtml", 42)).await;

        assert_eq!(
            read_item(&ctx.store, 1).await.unwrap().unwrap().state,
            PrefetchItemState::Downloaded
        );
    }

    #[tokio::test]
    async fn test_unknown_guid_is_ignored() {
        let (ctx, _clock) = context();
        seed_items(&ctx.store, vec![downloading(1, "g1", 1)]).await.unwrap();

        complete(&ctx, DownloadResult::succeeded("other", "/tmp/x.mhtml", 1)).await;

        assert_eq!(
            read_item(&ctx.store, 1).await.unwrap().unwrap().state,
            PrefetchItemState::Downloading
        );
    }

    // ==================== Failure Tests ====================

    #[tokio::test]
    async fn test_retryable_failure_below_ceiling_retries() {
        let (ctx, _clock) = context();
        seed_items(&ctx.store, vec![downloading(1, "g1", MAX_ATTEMPTS - 1)]).await.unwrap();

        complete(&ctx, DownloadResult::failed("g1", true)).await;

        assert_eq!(
            read_item(&ctx.store, 1).await.unwrap().unwrap().state,
            PrefetchItemState::ReceivedBundle
        );
    }

    #[tokio::test]
    async fn test_retryable_failure_at_ceiling_finishes() {
        let (ctx, _clock) = context();
        seed_items(&ctx.store, vec![downloading(1, "g1", MAX_ATTEMPTS)]).await.unwrap();

        complete(&ctx, DownloadResult::failed("g1", true)).await;

        let done = read_item(&ctx.store, 1).await.unwrap().unwrap();
        assert_eq!(done.state, PrefetchItemState::Finished);
        assert_eq!(done.error_code, PrefetchItemErrorCode::DownloadMaxAttemptsReached);
    }

    #[tokio::test]
    async fn test_permanent_failure_finishes_with_download_error() {
        let (ctx, _clock) = context();
        seed_items(&ctx.store, vec![downloading(1, "g1", 1)]).await.unwrap();

        complete(&ctx, DownloadResult::failed("g1", false)).await;

        let done = read_item(&ctx.store, 1).await.unwrap().unwrap();
        assert_eq!(done.state, PrefetchItemState::Finished);
        assert_eq!(done.error_code, PrefetchItemErrorCode::DownloadError);
    }
}
