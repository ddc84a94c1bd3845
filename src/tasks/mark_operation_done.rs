use async_trait::async_trait;
use tracing::{info, instrument};

use super::{TaskContext, log_store_failure};
use crate::item::{PrefetchItemState, to_micros};
use crate::store::schema::ITEMS_TABLE;
use crate::task::Task;

/// Handles a push announcing that `operation_name` completed: its
/// AWAITING_GCM items move to RECEIVED_GCM, ready to be polled.
pub struct MarkOperationDoneTask {
    ctx: TaskContext,
    operation_name: String,
}

impl MarkOperationDoneTask {
    #[must_use]
    pub fn new(ctx: TaskContext, operation_name: impl Into<String>) -> Self {
        Self {
            ctx,
            operation_name: operation_name.into(),
        }
    }
}

#[async_trait]
impl Task for MarkOperationDoneTask {
    fn name(&self) -> &'static str {
        "mark_operation_done"
    }

    #[instrument(skip(self), fields(operation = %self.operation_name))]
    async fn run(&mut self) {
        if self.operation_name.is_empty() {
            return;
        }
        let now = self.ctx.now();
        let operation_name = self.operation_name.clone();
        let result = self
            .ctx
            .store
            .execute(move |conn| {
                Box::pin(async move {
                    let updated = sqlx::query(&format!(
                        "UPDATE {ITEMS_TABLE} SET state = ?, freshness_time = ? \
                         WHERE operation_name = ? AND state = ?"
                    ))
                    .bind(PrefetchItemState::ReceivedGcm.to_db())
                    .bind(to_micros(now))
                    .bind(&operation_name)
                    .bind(PrefetchItemState::AwaitingGcm.to_db())
                    .execute(&mut *conn)
                    .await?;
                    Ok(updated.rows_affected())
                })
            })
            .await;

        match result {
            Ok(updated) => info!(updated, "operation marked done"),
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

    #[tokio::test]
    async fn test_awaiting_items_of_operation_are_received() {
        let (ctx, clock) = context();
        let mut waiting = item(1, PrefetchItemState::AwaitingGcm);
        waiting.operation_name = "op-1".to_string();
        let mut other_op = item(2, PrefetchItemState::AwaitingGcm);
        other_op.operation_name = "op-2".to_string();
        let mut already_sent = item(3, PrefetchItemState::SentGetOperation);
        already_sent.operation_name = "op-1".to_string();
        seed_items(&ctx.store, vec![waiting, other_op, already_sent]).await.unwrap();

        clock.advance(time::Duration::minutes(3));
        MarkOperationDoneTask::new(ctx.clone(), "op-1").run().await;

        let received = read_item(&ctx.store, 1).await.unwrap().unwrap();
        assert_eq!(received.state, PrefetchItemState::ReceivedGcm);
        assert_eq!(received.freshness_time, ctx.now());
        assert_eq!(
            read_item(&ctx.store, 2).await.unwrap().unwrap().state,
            PrefetchItemState::AwaitingGcm
        );
        assert_eq!(
            read_item(&ctx.store, 3).await.unwrap().unwrap().state,
            PrefetchItemState::SentGetOperation
        );
    }
}
