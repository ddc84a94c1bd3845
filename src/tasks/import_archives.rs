use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Connection;
use tracing::{info, instrument, warn};

use super::{TaskContext, log_store_failure};
use crate::import::{Importer, PrefetchArchiveInfo};
use crate::item::{PrefetchItemErrorCode, PrefetchItemState, to_micros};
use crate::store::items;
use crate::store::schema::ITEMS_TABLE;
use crate::task::Task;

/// Claims DOWNLOADED items and hands their archives to the importer.
pub struct ImportArchivesTask {
    ctx: TaskContext,
    importer: Arc<dyn Importer>,
}

impl ImportArchivesTask {
    #[must_use]
    pub fn new(ctx: TaskContext, importer: Arc<dyn Importer>) -> Self {
        Self { ctx, importer }
    }
}

#[async_trait]
impl Task for ImportArchivesTask {
    fn name(&self) -> &'static str {
        "import_archives"
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
                    let downloaded = items::items_in_state(&mut tx, PrefetchItemState::Downloaded).await?;
                    sqlx::query(&format!(
                        "UPDATE {ITEMS_TABLE} SET state = ?, freshness_time = ? WHERE state = ?"
                    ))
                    .bind(PrefetchItemState::Importing.to_db())
                    .bind(to_micros(now))
                    .bind(PrefetchItemState::Downloaded.to_db())
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    Ok(downloaded)
                })
            })
            .await;

        match result {
            Ok(downloaded) => {
                if !downloaded.is_empty() {
                    info!(archives = downloaded.len(), "importing archives");
                }
                for item in &downloaded {
                    self.importer.import_archive(PrefetchArchiveInfo::from(item));
                }
            }
            Err(err) => log_store_failure(self.name(), &err),
        }
    }
}

/// Finishes an IMPORTING item once its import reported back.
pub struct ImportCompletedTask {
    ctx: TaskContext,
    offline_id: i64,
    success: bool,
}

impl ImportCompletedTask {
    #[must_use]
    pub fn new(ctx: TaskContext, offline_id: i64, success: bool) -> Self {
        Self {
            ctx,
            offline_id,
            success,
        }
    }
}

#[async_trait]
impl Task for ImportCompletedTask {
    fn name(&self) -> &'static str {
        "import_completed"
    }

    #[instrument(skip(self), fields(offline_id = self.offline_id, success = self.success))]
    async fn run(&mut self) {
        let offline_id = self.offline_id;
        let code = if self.success {
            PrefetchItemErrorCode::Success
        } else {
            PrefetchItemErrorCode::ImportError
        };
        let result = self
            .ctx
            .store
            .execute(move |conn| {
                Box::pin(async move {
                    items::finalize_item(conn, offline_id, PrefetchItemState::Importing, code).await
                })
            })
            .await;

        match result {
            Ok(true) if self.success => info!("page imported"),
            Ok(true) => warn!("import failed"),
            Ok(false) => info!("item was no longer importing"),
            Err(err) => log_store_failure(self.name(), &err),
        }
    }
}
