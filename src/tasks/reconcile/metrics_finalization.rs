use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Connection;
use time::OffsetDateTime;
use tracing::{debug, info, instrument};

use crate::item::{PrefetchItem, PrefetchItemState, to_micros};
use crate::metrics::{
    ARCHIVE_SIZE_RATIO_PERCENT, DOWNLOAD_INITIATION_ATTEMPTS, FINISHED_ERROR_CODE,
    GENERATE_BUNDLE_ATTEMPTS, GET_OPERATION_ATTEMPTS, ITEM_LIFETIME_SECONDS, MetricsRecorder,
};
use crate::store::items;
use crate::store::schema::ITEMS_TABLE;
use crate::task::Task;
use crate::tasks::{TaskContext, log_store_failure};

/// Reports every FINISHED item once and retires it to ZOMBIE.
///
/// The zombie row keeps its URL so the same suggestion is not accepted
/// again; its freshness is reset to the retirement time.
pub struct MetricsFinalizationTask {
    ctx: TaskContext,
    metrics: Arc<dyn MetricsRecorder>,
}

impl MetricsFinalizationTask {
    #[must_use]
    pub fn new(ctx: TaskContext, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self { ctx, metrics }
    }

    #[allow(clippy::cast_precision_loss)]
    fn report(&self, item: &PrefetchItem, now: OffsetDateTime) {
        let lifetime = (now - item.creation_time).as_seconds_f64().max(0.0);
        self.metrics.record_histogram(ITEM_LIFETIME_SECONDS, lifetime);
        self.metrics
            .record_histogram(FINISHED_ERROR_CODE, item.error_code.to_db() as f64);
        self.metrics
            .record_histogram(GENERATE_BUNDLE_ATTEMPTS, item.generate_bundle_attempts as f64);
        self.metrics
            .record_histogram(GET_OPERATION_ATTEMPTS, item.get_operation_attempts as f64);
        self.metrics.record_histogram(
            DOWNLOAD_INITIATION_ATTEMPTS,
            item.download_initiation_attempts as f64,
        );
        if item.archive_body_length > 0 && item.file_size >= 0 {
            let ratio = item.file_size as f64 * 100.0 / item.archive_body_length as f64;
            self.metrics.record_histogram(ARCHIVE_SIZE_RATIO_PERCENT, ratio);
        }
    }
}

#[async_trait]
impl Task for MetricsFinalizationTask {
    fn name(&self) -> &'static str {
        "metrics_finalization"
    }

    #[instrument(skip(self))]
    async fn run(&mut self) {
        let now = self.ctx.now();
        let result = self
            .ctx
            .store
            .execute(move |conn| {
                Box::pin(async move {
                    let mut tx = conn.begin().await?;
                    let finished = items::items_in_state(&mut tx, PrefetchItemState::Finished).await?;
                    sqlx::query(&format!(
                        "UPDATE {ITEMS_TABLE} SET state = ?, freshness_time = ? WHERE state = ?"
                    ))
                    .bind(PrefetchItemState::Zombie.to_db())
                    .bind(to_micros(now))
                    .bind(PrefetchItemState::Finished.to_db())
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    Ok(finished)
                })
            })
            .await;

        match result {
            Ok(finished) if finished.is_empty() => debug!("no finished items to report"),
            Ok(finished) => {
                for item in &finished {
                    self.report(item, now);
                }
                info!(reported = finished.len(), "finished items retired");
            }
            Err(err) => log_store_failure(self.name(), &err),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::item::PrefetchItemErrorCode;
    use crate::metrics::RecordingMetrics;
    use crate::tasks::test_support::{context, item, t0};
    use crate::testing::{read_all, read_item, seed_items};

    fn finished(offline_id: i64, code: PrefetchItemErrorCode) -> PrefetchItem {
        let mut it = item(offline_id, PrefetchItemState::Finished);
        it.error_code = code;
        it.generate_bundle_attempts = 1;
        it.get_operation_attempts = 1;
        it.download_initiation_attempts = 1;
        it
    }

    #[tokio::test]
    async fn test_finished_items_are_reported_once_and_retired() {
        let (ctx, clock) = context();
        let mut imported = finished(1, PrefetchItemErrorCode::Success);
        imported.archive_body_length = 200;
        imported.file_size = 100;
        seed_items(
            &ctx.store,
            vec![
                imported,
                finished(2, PrefetchItemErrorCode::DownloadError),
                finished(3, PrefetchItemErrorCode::StaleAtNewRequest),
                item(4, PrefetchItemState::NewRequest),
            ],
        )
        .await
        .unwrap();
        clock.advance(time::Duration::hours(1));
        let metrics = Arc::new(RecordingMetrics::new());

        let mut task = MetricsFinalizationTask::new(ctx.clone(), metrics.clone());
        task.run().await;

        assert_eq!(metrics.count(FINISHED_ERROR_CODE), 3);
        assert_eq!(metrics.count(ITEM_LIFETIME_SECONDS), 3);
        assert_eq!(metrics.count(DOWNLOAD_INITIATION_ATTEMPTS), 3);
        assert_eq!(metrics.values(ARCHIVE_SIZE_RATIO_PERCENT), vec![50.0]);
        assert!(metrics.values(ITEM_LIFETIME_SECONDS).iter().all(|v| (*v - 3600.0).abs() < 1e-6));
        let mut codes = metrics.values(FINISHED_ERROR_CODE);
        codes.sort_by(f64::total_cmp);
        assert_eq!(codes, vec![0.0, 200.0, 600.0]);

        for id in 1..=3 {
            let zombie = read_item(&ctx.store, id).await.unwrap().unwrap();
            assert_eq!(zombie.state, PrefetchItemState::Zombie);
            assert_eq!(zombie.freshness_time, t0() + time::Duration::hours(1));
        }
        assert_eq!(
            read_item(&ctx.store, 4).await.unwrap().unwrap().state,
            PrefetchItemState::NewRequest
        );

        let before = read_all(&ctx.store).await.unwrap();
        task.run().await;
        assert_eq!(metrics.count(FINISHED_ERROR_CODE), 3);
        assert_eq!(read_all(&ctx.store).await.unwrap(), before);
    }
}
