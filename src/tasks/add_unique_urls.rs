use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{Connection, Row, SqliteConnection};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{TaskContext, log_store_failure};
use crate::ids::IdProvider;
use crate::item::{ClientId, PrefetchItem, PrefetchItemState, to_micros};
use crate::store::{StoreError, items};
use crate::store::schema::ITEMS_TABLE;
use crate::task::Task;

/// One suggested URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchUrl {
    /// Client-chosen id, unique within the namespace.
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub title: String,
}

impl PrefetchUrl {
    #[must_use]
    pub fn new(id: impl Into<String>, url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            title: title.into(),
        }
    }
}

/// How many rows one run created or refreshed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AddOutcome {
    pub added: usize,
    pub refreshed: usize,
    pub skipped: usize,
}

/// Turns candidate URLs into NEW_REQUEST items, one per URL per namespace.
///
/// URLs already tracked in the namespace are skipped; a ZOMBIE entry for a
/// re-suggested URL has its freshness renewed so it keeps blocking
/// re-prefetching. Non-HTTP(S) URLs are ignored.
pub struct AddUniqueUrlsTask {
    ctx: TaskContext,
    ids: Arc<dyn IdProvider>,
    name_space: String,
    urls: Vec<PrefetchUrl>,
}

impl AddUniqueUrlsTask {
    #[must_use]
    pub fn new(
        ctx: TaskContext,
        ids: Arc<dyn IdProvider>,
        name_space: impl Into<String>,
        urls: Vec<PrefetchUrl>,
    ) -> Self {
        Self {
            ctx,
            ids,
            name_space: name_space.into(),
            urls,
        }
    }
}

/// Draws per candidate before giving up on an id provider that keeps
/// returning ids already in use.
const MAX_ID_DRAWS: usize = 8;

/// Draws offline ids until one is unused.
async fn unused_offline_id(
    conn: &mut SqliteConnection,
    ids: &dyn IdProvider,
) -> Result<Option<i64>, StoreError> {
    for _ in 0..MAX_ID_DRAWS {
        let offline_id = ids.next_offline_id();
        if !items::offline_id_exists(conn, offline_id).await? {
            return Ok(Some(offline_id));
        }
        debug!(offline_id, "offline id already taken");
    }
    Ok(None)
}

fn is_fetchable(url: &str) -> bool {
    Url::parse(url)
        .map(|parsed| matches!(parsed.scheme(), "http" | "https"))
        .unwrap_or(false)
}

#[async_trait]
impl Task for AddUniqueUrlsTask {
    fn name(&self) -> &'static str {
        "add_unique_urls"
    }

    #[instrument(skip(self), fields(name_space = %self.name_space, candidates = self.urls.len()))]
    async fn run(&mut self) {
        let now = self.ctx.now();
        let name_space = self.name_space.clone();
        let ids = Arc::clone(&self.ids);

        let mut seen = HashSet::new();
        let candidates: Vec<PrefetchUrl> = std::mem::take(&mut self.urls)
            .into_iter()
            .filter(|candidate| {
                if !is_fetchable(&candidate.url) {
                    debug!(url = %candidate.url, "skipping non-http url");
                    return false;
                }
                seen.insert(candidate.url.clone())
            })
            .collect();
        if candidates.is_empty() {
            return;
        }

        let result = self
            .ctx
            .store
            .execute(move |conn| {
                Box::pin(async move {
                    let mut tx = conn.begin().await?;
                    let rows = sqlx::query(&format!(
                        "SELECT offline_id, requested_url, state FROM {ITEMS_TABLE} \
                         WHERE client_namespace = ?"
                    ))
                    .bind(&name_space)
                    .fetch_all(&mut *tx)
                    .await?;

                    let mut existing = HashMap::new();
                    for row in &rows {
                        let url: String = row.try_get("requested_url")?;
                        let offline_id: i64 = row.try_get("offline_id")?;
                        let state: i64 = row.try_get("state")?;
                        existing.insert(url, (offline_id, state));
                    }

                    let mut outcome = AddOutcome::default();
                    for candidate in candidates {
                        match existing.get(&candidate.url) {
                            Some(&(offline_id, state)) if state == PrefetchItemState::Zombie.to_db() => {
                                sqlx::query(&format!(
                                    "UPDATE {ITEMS_TABLE} SET freshness_time = ? WHERE offline_id = ?"
                                ))
                                .bind(to_micros(now))
                                .bind(offline_id)
                                .execute(&mut *tx)
                                .await?;
                                outcome.refreshed += 1;
                            }
                            Some(_) => {}
                            None => {
                                let Some(offline_id) = unused_offline_id(&mut tx, ids.as_ref()).await?
                                else {
                                    warn!(url = %candidate.url, "no unused offline id, skipping url");
                                    outcome.skipped += 1;
                                    continue;
                                };
                                let item = PrefetchItem::new_request(
                                    offline_id,
                                    ClientId::new(name_space.clone(), candidate.id),
                                    candidate.url,
                                    candidate.title,
                                    now,
                                );
                                items::insert_item(&mut tx, &item).await?;
                                outcome.added += 1;
                            }
                        }
                    }
                    tx.commit().await?;
                    Ok(outcome)
                })
            })
            .await;

        match result {
            Ok(outcome) => info!(
                added = outcome.added,
                refreshed = outcome.refreshed,
                skipped = outcome.skipped,
                "candidate urls recorded"
            ),
            Err(err) => log_store_failure(self.name(), &err),
        }
    }
}
