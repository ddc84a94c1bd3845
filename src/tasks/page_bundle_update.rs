use async_trait::async_trait;
use sqlx::{Connection, SqliteConnection};
use time::OffsetDateTime;
use tracing::{debug, info, instrument};

use super::{TaskContext, log_store_failure};
use crate::item::{PrefetchItemErrorCode, PrefetchItemState, to_micros};
use crate::network::{RenderPageInfo, RenderStatus};
use crate::store::schema::ITEMS_TABLE;
use crate::store::{StoreError, items};
use crate::task::Task;

/// States in which an item already belongs to an operation and waits for
/// its result.
const AWAITING_OPERATION: [PrefetchItemState; 3] = [
    PrefetchItemState::AwaitingGcm,
    PrefetchItemState::ReceivedGcm,
    PrefetchItemState::SentGetOperation,
];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct UpdateCounts {
    rendered: usize,
    pending: usize,
    failed: usize,
}

/// Records the per-page results of a GeneratePageBundle or GetOperation
/// response.
///
/// Pages are matched to items by requested URL. An item still in
/// SENT_GENERATE_PAGE_BUNDLE matches on URL alone; an item that already
/// carries an operation name only matches responses for that operation.
/// RENDERED pages move to RECEIVED_BUNDLE with the archive
/// identity; PENDING pages wait in AWAITING_GCM for the push; FAILED and
/// EXCEEDED_LIMIT pages finish the item.
pub struct PageBundleUpdateTask {
    ctx: TaskContext,
    operation_name: String,
    pages: Vec<RenderPageInfo>,
}

impl PageBundleUpdateTask {
    #[must_use]
    pub fn new(ctx: TaskContext, operation_name: impl Into<String>, pages: Vec<RenderPageInfo>) -> Self {
        Self {
            ctx,
            operation_name: operation_name.into(),
            pages,
        }
    }
}

async fn waiting_items(
    conn: &mut SqliteConnection,
    operation_name: &str,
    url: &str,
) -> Result<Vec<(i64, PrefetchItemState)>, StoreError> {
    let operation_states = AWAITING_OPERATION
        .iter()
        .map(|s| s.to_db().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let rows: Vec<(i64, i64)> = sqlx::query_as(&format!(
        "SELECT offline_id, state FROM {ITEMS_TABLE} WHERE requested_url = ? AND \
         (state = ? OR (state IN ({operation_states}) AND operation_name <> '' AND operation_name = ?))"
    ))
    .bind(url)
    .bind(PrefetchItemState::SentGeneratePageBundle.to_db())
    .bind(operation_name)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .filter_map(|(id, state)| PrefetchItemState::from_db(state).map(|s| (id, s)))
        .collect())
}

async fn apply_page(
    conn: &mut SqliteConnection,
    operation_name: &str,
    page: &RenderPageInfo,
    now: OffsetDateTime,
    counts: &mut UpdateCounts,
) -> Result<(), StoreError> {
    for (offline_id, state) in waiting_items(conn, operation_name, &page.url).await? {
        let applied = match page.status {
            RenderStatus::Rendered => {
                sqlx::query(&format!(
                    "UPDATE {ITEMS_TABLE} SET state = ?, freshness_time = ?, operation_name = ?, \
                     archive_body_name = ?, archive_body_length = ?, final_archived_url = ? \
                     WHERE offline_id = ?"
                ))
                .bind(PrefetchItemState::ReceivedBundle.to_db())
                .bind(to_micros(now))
                .bind(operation_name)
                .bind(&page.body_name)
                .bind(page.body_length)
                .bind(&page.redirect_url)
                .bind(offline_id)
                .execute(&mut *conn)
                .await?;
                counts.rendered += 1;
                true
            }
            RenderStatus::Pending => {
                if matches!(
                    state,
                    PrefetchItemState::SentGeneratePageBundle | PrefetchItemState::SentGetOperation
                ) {
                    sqlx::query(&format!(
                        "UPDATE {ITEMS_TABLE} SET state = ?, freshness_time = ?, operation_name = ? \
                         WHERE offline_id = ?"
                    ))
                    .bind(PrefetchItemState::AwaitingGcm.to_db())
                    .bind(to_micros(now))
                    .bind(operation_name)
                    .bind(offline_id)
                    .execute(&mut *conn)
                    .await?;
                    counts.pending += 1;
                    true
                } else {
                    false
                }
            }
            RenderStatus::Failed | RenderStatus::ExceededLimit => {
                let code = if page.status == RenderStatus::Failed {
                    PrefetchItemErrorCode::ArchivingFailed
                } else {
                    PrefetchItemErrorCode::ArchivingLimitExceeded
                };
                let finalized = items::finalize_item(conn, offline_id, state, code).await?;
                if finalized {
                    counts.failed += 1;
                }
                finalized
            }
        };
        if applied {
            debug!(offline_id, status = ?page.status, "bundle update applied");
        }
    }
    Ok(())
}

#[async_trait]
impl Task for PageBundleUpdateTask {
    fn name(&self) -> &'static str {
        "page_bundle_update"
    }

    #[instrument(skip(self), fields(operation = %self.operation_name, pages = self.pages.len()))]
    async fn run(&mut self) {
        if self.pages.is_empty() {
            return;
        }
        let now = self.ctx.now();
        let operation_name = self.operation_name.clone();
        let pages = std::mem::take(&mut self.pages);

        let result = self
            .ctx
            .store
            .execute(move |conn| {
                Box::pin(async move {
                    let mut tx = conn.begin().await?;
                    let mut counts = UpdateCounts::default();
                    for page in &pages {
                        apply_page(&mut tx, &operation_name, page, now, &mut counts).await?;
                    }
                    tx.commit().await?;
                    Ok(counts)
                })
            })
            .await;

        match result {
            Ok(counts) => info!(
                rendered = counts.rendered,
                pending = counts.pending,
                failed = counts.failed,
                "bundle update recorded"
            ),
            Err(err) => log_store_failure(self.name(), &err),
        }
    }
}
