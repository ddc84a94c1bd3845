use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Connection;
use tracing::{info, instrument, warn};

use super::{TaskContext, log_store_failure};
use crate::item::{PrefetchItemState, to_micros};
use crate::network::RequestFactory;
use crate::push::PushHandler;
use crate::store::schema::ITEMS_TABLE;
use crate::task::Task;

/// Default number of URLs sent in one GeneratePageBundle request.
pub const DEFAULT_MAX_URLS_PER_BUNDLE: usize = 20;

/// Sends the newest NEW_REQUEST items for rendering.
///
/// The push token is fetched first; without one nothing is sent. Selected
/// items move to SENT_GENERATE_PAGE_BUNDLE with their attempt counter
/// incremented, then one request carries all their URLs.
pub struct GeneratePageBundleTask {
    ctx: TaskContext,
    push: Arc<dyn PushHandler>,
    requests: Arc<dyn RequestFactory>,
    max_urls: usize,
}

impl GeneratePageBundleTask {
    #[must_use]
    pub fn new(
        ctx: TaskContext,
        push: Arc<dyn PushHandler>,
        requests: Arc<dyn RequestFactory>,
        max_urls: usize,
    ) -> Self {
        Self {
            ctx,
            push,
            requests,
            max_urls: max_urls.max(1),
        }
    }
}

#[async_trait]
impl Task for GeneratePageBundleTask {
    fn name(&self) -> &'static str {
        "generate_page_bundle"
    }

    #[instrument(skip(self), fields(max_urls = self.max_urls))]
    async fn run(&mut self) {
        let Some(token) = self.push.get_token().await else {
            warn!("no push token available; bundle generation postponed");
            return;
        };

        let now = self.ctx.now();
        let limit = i64::try_from(self.max_urls).unwrap_or(i64::MAX);
        let result = self
            .ctx
            .store
            .execute(move |conn| {
                Box::pin(async move {
                    let mut tx = conn.begin().await?;
                    let selected: Vec<(i64, String)> = sqlx::query_as(&format!(
                        "SELECT offline_id, requested_url FROM {ITEMS_TABLE} WHERE state = ? \
                         ORDER BY creation_time DESC, offline_id DESC LIMIT ?"
                    ))
                    .bind(PrefetchItemState::NewRequest.to_db())
                    .bind(limit)
                    .fetch_all(&mut *tx)
                    .await?;

                    for (offline_id, _) in &selected {
                        sqlx::query(&format!(
                            "UPDATE {ITEMS_TABLE} SET state = ?, freshness_time = ?, \
                             generate_bundle_attempts = generate_bundle_attempts + 1 \
                             WHERE offline_id = ?"
                        ))
                        .bind(PrefetchItemState::SentGeneratePageBundle.to_db())
                        .bind(to_micros(now))
                        .bind(*offline_id)
                        .execute(&mut *tx)
                        .await?;
                    }
                    tx.commit().await?;

                    let mut urls: Vec<String> = selected.into_iter().map(|(_, url)| url).collect();
                    urls.sort();
                    urls.dedup();
                    Ok(urls)
                })
            })
            .await;

        match result {
            Ok(urls) if urls.is_empty() => {}
            Ok(urls) => {
                info!(urls = urls.len(), "requesting page bundle");
                self.requests.make_generate_page_bundle_request(urls, token);
            }
            Err(err) => log_store_failure(self.name(), &err),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::push::StaticTokenHandler;
    use crate::tasks::test_support::{context, item};
    use crate::testing::{FakeRequestFactory, read_all, read_item, seed_items};

    #[tokio::test]
    async fn test_new_requests_are_sent_with_token() {
        let (ctx, _clock) = context();
        seed_items(
            &ctx.store,
            vec![item(1, PrefetchItemState::NewRequest), item(2, PrefetchItemState::Zombie)],
        )
        .await
        .unwrap();
        let requests = Arc::new(FakeRequestFactory::new());

        GeneratePageBundleTask::new(
            ctx.clone(),
            Arc::new(StaticTokenHandler::new(Some("tok".to_string()))),
            requests.clone(),
            20,
        )
        .run()
        .await;

        assert_eq!(
            requests.generate_requests(),
            vec![(vec!["https://site.test/1".to_string()], "tok".to_string())]
        );
        let sent = read_item(&ctx.store, 1).await.unwrap().unwrap();
        assert_eq!(sent.state, PrefetchItemState::SentGeneratePageBundle);
        assert_eq!(sent.generate_bundle_attempts, 1);
    }

    #[tokio::test]
    async fn test_missing_token_leaves_items_untouched() {
        let (ctx, _clock) = context();
        seed_items(&ctx.store, vec![item(1, PrefetchItemState::NewRequest)]).await.unwrap();
        let requests = Arc::new(FakeRequestFactory::new());

        GeneratePageBundleTask::new(
            ctx.clone(),
            Arc::new(StaticTokenHandler::new(None)),
            requests.clone(),
            20,
        )
        .run()
        .await;

        assert!(requests.generate_requests().is_empty());
        let unchanged = read_item(&ctx.store, 1).await.unwrap().unwrap();
        assert_eq!(unchanged.state, PrefetchItemState::NewRequest);
        assert_eq!(unchanged.generate_bundle_attempts, 0);
    }

    #[tokio::test]
    async fn test_batch_takes_newest_items_first() {
        let (ctx, _clock) = context();
        let mut seeded = Vec::new();
        for id in 1..=3 {
            let mut it = item(id, PrefetchItemState::NewRequest);
            it.creation_time += time::Duration::minutes(id);
            seeded.push(it);
        }
        seed_items(&ctx.store, seeded).await.unwrap();
        let requests = Arc::new(FakeRequestFactory::new());

        GeneratePageBundleTask::new(
            ctx.clone(),
            Arc::new(StaticTokenHandler::new(Some("tok".to_string()))),
            requests.clone(),
            2,
        )
        .run()
        .await;

        let (urls, _) = requests.generate_requests().remove(0);
        assert_eq!(urls, vec!["https://site.test/2".to_string(), "https://site.test/3".to_string()]);
        let states: Vec<_> = read_all(&ctx.store).await.unwrap().into_iter().map(|i| i.state).collect();
        assert_eq!(
            states,
            vec![
                PrefetchItemState::NewRequest,
                PrefetchItemState::SentGeneratePageBundle,
                PrefetchItemState::SentGeneratePageBundle
            ]
        );
    }
}
