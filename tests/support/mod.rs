//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod socket_guard;

use std::sync::Arc;
use std::time::Duration;

use prefetch_core::testing::{FakeDownloader, FakeImporter, FakeRequestFactory, read_all};
use prefetch_core::{
    DispatcherSettings, PrefetchDispatcher, PrefetchItem, PrefetchServices, PrefetchStore,
    PrefetchUrl, RecordingMetrics, SequentialIds, StaticTokenHandler, TestClock,
};

/// Unix time every test clock starts at.
pub const T0_UNIX: i64 = 1_700_000_000;

/// Dispatcher wired to in-process fakes.
pub struct FakePipeline {
    pub dispatcher: PrefetchDispatcher,
    pub requests: Arc<FakeRequestFactory>,
    pub downloader: Arc<FakeDownloader>,
    pub importer: Arc<FakeImporter>,
    pub metrics: Arc<RecordingMetrics>,
    pub clock: Arc<TestClock>,
}

impl FakePipeline {
    pub fn new(store: PrefetchStore, settings: DispatcherSettings) -> Self {
        let requests = Arc::new(FakeRequestFactory::new());
        let downloader = Arc::new(FakeDownloader::new());
        let importer = Arc::new(FakeImporter::new());
        let metrics = Arc::new(RecordingMetrics::new());
        let clock = Arc::new(TestClock::at_unix(T0_UNIX));
        let services = PrefetchServices::new(
            requests.clone(),
            downloader.clone(),
            importer.clone(),
            Arc::new(StaticTokenHandler::new(Some("push-token".to_string()))),
            metrics.clone(),
        )
        .with_clock(clock.clone())
        .with_ids(Arc::new(SequentialIds::new()));
        let dispatcher = PrefetchDispatcher::new(store, services, settings);
        Self {
            dispatcher,
            requests,
            downloader,
            importer,
            metrics,
            clock,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(PrefetchStore::in_memory(), DispatcherSettings::default())
    }

    pub async fn items(&self) -> Vec<PrefetchItem> {
        read_all(self.dispatcher.store()).await.expect("read items")
    }
}

/// `n` distinct candidate URLs with client ids `c0..cn`.
pub fn urls(n: u32) -> Vec<PrefetchUrl> {
    (0..n)
        .map(|i| PrefetchUrl::new(format!("c{i}"), format!("https://site.test/{i}"), format!("Page {i}")))
        .collect()
}

/// Polls `store` until `done` holds for its items, or panics after `timeout`.
pub async fn wait_for_items<F>(store: &PrefetchStore, timeout: Duration, done: F) -> Vec<PrefetchItem>
where
    F: Fn(&[PrefetchItem]) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let items = read_all(store).await.expect("read items");
        if done(&items) {
            return items;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "items never reached the expected state: {items:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
