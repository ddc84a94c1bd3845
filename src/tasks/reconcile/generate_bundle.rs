use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Connection;
use tracing::{info, instrument};

use super::{RetryCounts, RetryStage};
use crate::item::{PrefetchItemErrorCode, PrefetchItemState};
use crate::network::RequestFactory;
use crate::store::items;
use crate::task::Task;
use crate::tasks::{TaskContext, log_store_failure};

const STAGE: RetryStage = RetryStage {
    in_flight: PrefetchItemState::SentGeneratePageBundle,
    retry_to: PrefetchItemState::NewRequest,
    exhausted: PrefetchItemErrorCode::GeneratePageBundleRequestMaxAttemptsReached,
};

/// Retries or finalizes SENT_GENERATE_PAGE_BUNDLE items whose URL is not
/// part of any GeneratePageBundle request still in flight.
pub struct GeneratePageBundleReconcileTask {
    ctx: TaskContext,
    requests: Arc<dyn RequestFactory>,
}

impl GeneratePageBundleReconcileTask {
    #[must_use]
    pub fn new(ctx: TaskContext, requests: Arc<dyn RequestFactory>) -> Self {
        Self { ctx, requests }
    }
}

#[async_trait]
impl Task for GeneratePageBundleReconcileTask {
    fn name(&self) -> &'static str {
        "generate_page_bundle_reconcile"
    }

    #[instrument(skip(self))]
    async fn run(&mut self) {
        let now = self.ctx.now();
        let outstanding: HashSet<String> = self.requests.outstanding_generate_urls().into_iter().collect();
        let result = self
            .ctx
            .store
            .execute(move |conn| {
                Box::pin(async move {
                    let mut tx = conn.begin().await?;
                    let mut counts = RetryCounts::default();
                    for item in items::items_in_state(&mut tx, STAGE.in_flight).await? {
                        if outstanding.contains(&item.requested_url) {
                            continue;
                        }
                        STAGE
                            .retry_or_finalize(&mut tx, item.offline_id, item.generate_bundle_attempts, now, &mut counts)
                            .await?;
                    }
                    tx.commit().await?;
                    Ok(counts)
                })
            })
            .await;

        match result {
            Ok(counts) if counts == RetryCounts::default() => {}
            Ok(counts) => info!(
                retried = counts.retried,
                finalized = counts.finalized,
                "lost bundle requests reconciled"
            ),
            Err(err) => log_store_failure(self.name(), &err),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::item::MAX_ATTEMPTS;
    use crate::tasks::test_support::{context, item};
    use crate::testing::{FakeRequestFactory, read_item, seed_items};

    fn sent(offline_id: i64, attempts: i64) -> crate::item::PrefetchItem {
        let mut it = item(offline_id, PrefetchItemState::SentGeneratePageBundle);
        it.generate_bundle_attempts = attempts;
        it
    }

    #[tokio::test]
    async fn test_lost_requests_retry_or_finish_at_ceiling() {
        let (ctx, _clock) = context();
        seed_items(&ctx.store, vec![sent(1, MAX_ATTEMPTS - 1), sent(2, MAX_ATTEMPTS), sent(3, 1)])
            .await
            .unwrap();
        let requests = Arc::new(FakeRequestFactory::new());
        requests.make_generate_page_bundle_request(vec!["https://site.test/3".to_string()], "tok".to_string());

        let mut task = GeneratePageBundleReconcileTask::new(ctx.clone(), requests.clone());
        task.run().await;

        assert_eq!(
            read_item(&ctx.store, 1).await.unwrap().unwrap().state,
            PrefetchItemState::NewRequest
        );
        let exhausted = read_item(&ctx.store, 2).await.unwrap().unwrap();
        assert_eq!(exhausted.state, PrefetchItemState::Finished);
        assert_eq!(
            exhausted.error_code,
            PrefetchItemErrorCode::GeneratePageBundleRequestMaxAttemptsReached
        );
        assert_eq!(
            read_item(&ctx.store, 3).await.unwrap().unwrap().state,
            PrefetchItemState::SentGeneratePageBundle
        );

        let before = crate::testing::read_all(&ctx.store).await.unwrap();
        task.run().await;
        assert_eq!(crate::testing::read_all(&ctx.store).await.unwrap(), before);
    }
}
