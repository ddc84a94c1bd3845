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
    in_flight: PrefetchItemState::SentGetOperation,
    retry_to: PrefetchItemState::ReceivedGcm,
    exhausted: PrefetchItemErrorCode::GetOperationMaxAttemptsReached,
};

/// Retries or finalizes SENT_GET_OPERATION items whose operation is not
/// being polled.
///
/// Retried items return to RECEIVED_GCM, where the next GetOperation task
/// picks them up.
pub struct SentGetOperationCleanupTask {
    ctx: TaskContext,
    requests: Arc<dyn RequestFactory>,
}

impl SentGetOperationCleanupTask {
    #[must_use]
    pub fn new(ctx: TaskContext, requests: Arc<dyn RequestFactory>) -> Self {
        Self { ctx, requests }
    }
}

#[async_trait]
impl Task for SentGetOperationCleanupTask {
    fn name(&self) -> &'static str {
        "sent_get_operation_cleanup"
    }

    #[instrument(skip(self))]
    async fn run(&mut self) {
        let now = self.ctx.now();
        let outstanding: HashSet<String> = self.requests.outstanding_operation_names().into_iter().collect();
        let result = self
            .ctx
            .store
            .execute(move |conn| {
                Box::pin(async move {
                    let mut tx = conn.begin().await?;
                    let mut counts = RetryCounts::default();
                    for item in items::items_in_state(&mut tx, STAGE.in_flight).await? {
                        if outstanding.contains(&item.operation_name) {
                            continue;
                        }
                        STAGE
                            .retry_or_finalize(&mut tx, item.offline_id, item.get_operation_attempts, now, &mut counts)
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
                "lost operation polls reconciled"
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
    use crate::testing::{FakeRequestFactory, read_all, read_item, seed_items};

    fn polling(offline_id: i64, operation: &str, attempts: i64) -> crate::item::PrefetchItem {
        let mut it = item(offline_id, PrefetchItemState::SentGetOperation);
        it.operation_name = operation.to_string();
        it.get_operation_attempts = attempts;
        it
    }

    #[tokio::test]
    async fn test_attempt_ceiling_boundary() {
        let (ctx, _clock) = context();
        seed_items(
            &ctx.store,
            vec![polling(1, "op-a", MAX_ATTEMPTS - 1), polling(2, "op-b", MAX_ATTEMPTS)],
        )
        .await
        .unwrap();

        let mut task =
            SentGetOperationCleanupTask::new(ctx.clone(), Arc::new(FakeRequestFactory::new()));
        task.run().await;

        assert_eq!(
            read_item(&ctx.store, 1).await.unwrap().unwrap().state,
            PrefetchItemState::ReceivedGcm
        );
        let exhausted = read_item(&ctx.store, 2).await.unwrap().unwrap();
        assert_eq!(exhausted.state, PrefetchItemState::Finished);
        assert_eq!(exhausted.error_code, PrefetchItemErrorCode::GetOperationMaxAttemptsReached);

        let before = read_all(&ctx.store).await.unwrap();
        task.run().await;
        assert_eq!(read_all(&ctx.store).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_items_of_outstanding_operation_are_left_alone() {
        let (ctx, _clock) = context();
        seed_items(&ctx.store, vec![polling(1, "op-a", 1)]).await.unwrap();
        let requests = Arc::new(FakeRequestFactory::new());
        requests.make_get_operation_request("op-a".to_string());

        SentGetOperationCleanupTask::new(ctx.clone(), requests).run().await;

        assert_eq!(
            read_item(&ctx.store, 1).await.unwrap().unwrap().state,
            PrefetchItemState::SentGetOperation
        );
    }
}
