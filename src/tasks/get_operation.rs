use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Connection;
use tracing::{info, instrument};

use super::{TaskContext, log_store_failure};
use crate::item::{PrefetchItemState, to_micros};
use crate::network::RequestFactory;
use crate::store::schema::ITEMS_TABLE;
use crate::task::Task;

/// Polls every operation that has RECEIVED_GCM items.
///
/// The items move to SENT_GET_OPERATION with their attempt counter
/// incremented; one GetOperation request goes out per distinct operation.
pub struct GetOperationTask {
    ctx: TaskContext,
    requests: Arc<dyn RequestFactory>,
}

impl GetOperationTask {
    #[must_use]
    pub fn new(ctx: TaskContext, requests: Arc<dyn RequestFactory>) -> Self {
        Self { ctx, requests }
    }
}

#[async_trait]
impl Task for GetOperationTask {
    fn name(&self) -> &'static str {
        "get_operation"
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
                    let operations: Vec<String> = sqlx::query_scalar(&format!(
                        "SELECT DISTINCT operation_name FROM {ITEMS_TABLE} \
                         WHERE state = ? ORDER BY operation_name"
                    ))
                    .bind(PrefetchItemState::ReceivedGcm.to_db())
                    .fetch_all(&mut *tx)
                    .await?;

                    sqlx::query(&format!(
                        "UPDATE {ITEMS_TABLE} SET state = ?, freshness_time = ?, \
                         get_operation_attempts = get_operation_attempts + 1 WHERE state = ?"
                    ))
                    .bind(PrefetchItemState::SentGetOperation.to_db())
                    .bind(to_micros(now))
                    .bind(PrefetchItemState::ReceivedGcm.to_db())
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    Ok(operations)
                })
            })
            .await;

        match result {
            Ok(operations) => {
                if !operations.is_empty() {
                    info!(operations = operations.len(), "polling operations");
                }
                for operation_name in operations {
                    self.requests.make_get_operation_request(operation_name);
                }
            }
            Err(err) => log_store_failure(self.name(), &err),
        }
    }
}
