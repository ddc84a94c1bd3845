use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Connection;
use tracing::{info, instrument};

use super::{TaskContext, log_store_failure};
use crate::download::Downloader;
use crate::item::{ClientId, PrefetchItemErrorCode, PrefetchItemState};
use crate::store::schema::ITEMS_TABLE;
use crate::task::Task;

/// Which suggestions a client withdraws.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalScope {
    /// NEW_REQUEST items of a namespace finish with SUGGESTION_INVALIDATED.
    UnprocessedInNamespace(String),
    /// Every row of one client is deleted.
    Client(ClientId),
}

/// Withdraws suggestions on a client's behalf.
///
/// Deleting a client's rows also cancels their running downloads.
pub struct RemoveUrlsTask {
    ctx: TaskContext,
    downloader: Arc<dyn Downloader>,
    scope: RemovalScope,
}

impl RemoveUrlsTask {
    #[must_use]
    pub fn new(ctx: TaskContext, downloader: Arc<dyn Downloader>, scope: RemovalScope) -> Self {
        Self {
            ctx,
            downloader,
            scope,
        }
    }
}

#[async_trait]
impl Task for RemoveUrlsTask {
    fn name(&self) -> &'static str {
        "remove_urls"
    }

    #[instrument(skip(self), fields(scope = ?self.scope))]
    async fn run(&mut self) {
        let scope = self.scope.clone();
        let result = self
            .ctx
            .store
            .execute(move |conn| {
                Box::pin(async move {
                    match scope {
                        RemovalScope::UnprocessedInNamespace(name_space) => {
                            let result = sqlx::query(&format!(
                                "UPDATE {ITEMS_TABLE} SET state = ?, error_code = ? \
                                 WHERE client_namespace = ? AND state = ?"
                            ))
                            .bind(PrefetchItemState::Finished.to_db())
                            .bind(PrefetchItemErrorCode::SuggestionInvalidated.to_db())
                            .bind(&name_space)
                            .bind(PrefetchItemState::NewRequest.to_db())
                            .execute(&mut *conn)
                            .await?;
                            Ok((result.rows_affected(), Vec::new()))
                        }
                        RemovalScope::Client(client_id) => {
                            let mut tx = conn.begin().await?;
                            let downloads: Vec<String> = sqlx::query_scalar(&format!(
                                "SELECT guid FROM {ITEMS_TABLE} \
                                 WHERE client_namespace = ? AND client_id = ? AND state = ?"
                            ))
                            .bind(&client_id.name_space)
                            .bind(&client_id.id)
                            .bind(PrefetchItemState::Downloading.to_db())
                            .fetch_all(&mut *tx)
                            .await?;
                            let result = sqlx::query(&format!(
                                "DELETE FROM {ITEMS_TABLE} WHERE client_namespace = ? AND client_id = ?"
                            ))
                            .bind(&client_id.name_space)
                            .bind(&client_id.id)
                            .execute(&mut *tx)
                            .await?;
                            tx.commit().await?;
                            Ok((result.rows_affected(), downloads))
                        }
                    }
                })
            })
            .await;

        match result {
            Ok((removed, downloads)) => {
                for download_id in &downloads {
                    self.downloader.cancel_download(download_id);
                }
                info!(removed, cancelled = downloads.len(), "suggestions withdrawn");
            }
            Err(err) => log_store_failure(self.name(), &err),
        }
    }
}
