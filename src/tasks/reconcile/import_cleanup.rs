use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Connection;
use tracing::{instrument, warn};

use crate::import::Importer;
use crate::item::{PrefetchItemErrorCode, PrefetchItemState};
use crate::store::items;
use crate::task::Task;
use crate::tasks::{TaskContext, log_store_failure};

/// Finishes IMPORTING items the importer no longer knows about with
/// IMPORT_ABORTED.
pub struct ImportCleanupTask {
    ctx: TaskContext,
    importer: Arc<dyn Importer>,
}

impl ImportCleanupTask {
    #[must_use]
    pub fn new(ctx: TaskContext, importer: Arc<dyn Importer>) -> Self {
        Self { ctx, importer }
    }
}

#[async_trait]
impl Task for ImportCleanupTask {
    fn name(&self) -> &'static str {
        "import_cleanup"
    }

    #[instrument(skip(self))]
    async fn run(&mut self) {
        let ongoing: HashSet<i64> = self.importer.ongoing_imports().into_iter().collect();
        let result = self
            .ctx
            .store
            .execute(move |conn| {
                Box::pin(async move {
                    let mut tx = conn.begin().await?;
                    let mut aborted = 0_usize;
                    for item in items::items_in_state(&mut tx, PrefetchItemState::Importing).await? {
                        if ongoing.contains(&item.offline_id) {
                            continue;
                        }
                        if items::finalize_item(
                            &mut tx,
                            item.offline_id,
                            PrefetchItemState::Importing,
                            PrefetchItemErrorCode::ImportAborted,
                        )
                        .await?
                        {
                            aborted += 1;
                        }
                    }
                    tx.commit().await?;
                    Ok(aborted)
                })
            })
            .await;

        match result {
            Ok(0) => {}
            Ok(aborted) => warn!(aborted, "interrupted imports finalized"),
            Err(err) => log_store_failure(self.name(), &err),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::import::PrefetchArchiveInfo;
    use crate::tasks::test_support::{context, item};
    use crate::testing::{FakeImporter, read_all, read_item, seed_items};

    #[tokio::test]
    async fn test_interrupted_imports_are_aborted() {
        let (ctx, _clock) = context();
        let running = item(1, PrefetchItemState::Importing);
        seed_items(&ctx.store, vec![running.clone(), item(2, PrefetchItemState::Importing)])
            .await
            .unwrap();
        let importer = Arc::new(FakeImporter::new());
        importer.import_archive(PrefetchArchiveInfo::from(&running));

        let mut task = ImportCleanupTask::new(ctx.clone(), importer);
        task.run().await;

        assert_eq!(
            read_item(&ctx.store, 1).await.unwrap().unwrap().state,
            PrefetchItemState::Importing
        );
        let aborted = read_item(&ctx.store, 2).await.unwrap().unwrap();
        assert_eq!(aborted.state, PrefetchItemState::Finished);
        assert_eq!(aborted.error_code, PrefetchItemErrorCode::ImportAborted);

        let before = read_all(&ctx.store).await.unwrap();
        task.run().await;
        assert_eq!(read_all(&ctx.store).await.unwrap(), before);
    }
}
