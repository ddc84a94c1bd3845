//! Pipeline coordinator.
//!
//! # Overview
//!
//! [`PrefetchDispatcher`] owns the [`TaskQueue`] and the collaborator
//! handles. It exposes the pipeline's entry points (candidate intake,
//! removal, push notifications, maintenance ticks) and turns each
//! [`PipelineEvent`] reported by a collaborator into its follow-up tasks.
//!
//! Nothing here touches the store directly; every transition is a task
//! that waits its turn on the queue.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use prefetch_core::dispatcher::{DispatcherSettings, PrefetchDispatcher, PrefetchServices};
//! use prefetch_core::store::PrefetchStore;
//! use prefetch_core::tasks::PrefetchUrl;
//! use prefetch_core::testing::{FakeDownloader, FakeImporter, FakeRequestFactory};
//! use prefetch_core::{RecordingMetrics, StaticTokenHandler};
//!
//! # async fn example() {
//! let services = PrefetchServices::new(
//!     Arc::new(FakeRequestFactory::new()),
//!     Arc::new(FakeDownloader::new()),
//!     Arc::new(FakeImporter::new()),
//!     Arc::new(StaticTokenHandler::new(Some("token".to_string()))),
//!     Arc::new(RecordingMetrics::new()),
//! );
//! let dispatcher = PrefetchDispatcher::new(
//!     PrefetchStore::in_memory(),
//!     services,
//!     DispatcherSettings::default(),
//! );
//! dispatcher.add_candidate_urls(
//!     "suggested_articles",
//!     vec![PrefetchUrl::new("a1", "https://example.com/a", "A")],
//! );
//! dispatcher.wait_until_idle().await;
//! # }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::download::{DownloadOutcome, Downloader};
use crate::events::{EventReceiver, PipelineEvent};
use crate::ids::{IdProvider, RandomIdProvider};
use crate::import::Importer;
use crate::item::ClientId;
use crate::metrics::MetricsRecorder;
use crate::network::{PrefetchRequestStatus, RenderPageInfo, RequestFactory};
use crate::push::PushHandler;
use crate::store::{DEFAULT_DAILY_QUOTA_BYTES, DownloaderQuota, PrefetchStore};
use crate::task::{Task, TaskQueue};
use crate::tasks::reconcile::{
    ArchiveFileReconcileTask, DefaultStalenessPolicy, DownloadCleanupTask,
    GeneratePageBundleReconcileTask, ImportCleanupTask, MetricsFinalizationTask,
    SentGetOperationCleanupTask, StaleEntryFinalizerTask, StalenessPolicy,
};
use crate::tasks::{
    AddUniqueUrlsTask, DEFAULT_MAX_CONCURRENT_DOWNLOADS, DEFAULT_MAX_URLS_PER_BUNDLE,
    DownloadArchivesTask, DownloadCompletedTask, GeneratePageBundleTask, GetOperationTask,
    ImportArchivesTask, ImportCompletedTask, MarkOperationDoneTask, PageBundleUpdateTask,
    PrefetchUrl, RemovalScope, RemoveUrlsTask, TaskContext,
};

/// Default period between maintenance ticks (15 minutes).
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(900);

/// Default pause after the service asks clients to suspend (1 day).
pub const DEFAULT_SUSPEND: Duration = Duration::from_secs(86_400);

/// Collaborators the pipeline talks to, plus the injected clock and ids.
#[derive(Clone)]
pub struct PrefetchServices {
    pub requests: Arc<dyn RequestFactory>,
    pub downloader: Arc<dyn Downloader>,
    pub importer: Arc<dyn Importer>,
    pub push: Arc<dyn PushHandler>,
    pub metrics: Arc<dyn MetricsRecorder>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdProvider>,
    pub staleness: Arc<dyn StalenessPolicy>,
}

impl PrefetchServices {
    /// Bundles the collaborators with the system clock, random ids and the
    /// default staleness buckets.
    #[must_use]
    pub fn new(
        requests: Arc<dyn RequestFactory>,
        downloader: Arc<dyn Downloader>,
        importer: Arc<dyn Importer>,
        push: Arc<dyn PushHandler>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            requests,
            downloader,
            importer,
            push,
            metrics,
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomIdProvider),
            staleness: Arc::new(DefaultStalenessPolicy),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_ids(mut self, ids: Arc<dyn IdProvider>) -> Self {
        self.ids = ids;
        self
    }

    #[must_use]
    pub fn with_staleness_policy(mut self, staleness: Arc<dyn StalenessPolicy>) -> Self {
        self.staleness = staleness;
        self
    }
}

impl fmt::Debug for PrefetchServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefetchServices").finish_non_exhaustive()
    }
}

/// Tunables for the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherSettings {
    pub max_urls_per_bundle: usize,
    pub max_concurrent_downloads: usize,
    pub daily_quota_bytes: i64,
    pub suspend: Duration,
    pub maintenance_interval: Duration,
    pub archives_dir: PathBuf,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            max_urls_per_bundle: DEFAULT_MAX_URLS_PER_BUNDLE,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            daily_quota_bytes: DEFAULT_DAILY_QUOTA_BYTES,
            suspend: DEFAULT_SUSPEND,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            archives_dir: PathBuf::from("archives"),
        }
    }
}

struct Inner {
    ctx: TaskContext,
    queue: TaskQueue,
    services: PrefetchServices,
    settings: DispatcherSettings,
    suspended_until: Mutex<Option<OffsetDateTime>>,
}

/// Entry point into the prefetch pipeline.
///
/// Cheap to clone; clones share the queue and collaborators. Must be
/// created inside a tokio runtime.
#[derive(Clone)]
pub struct PrefetchDispatcher {
    inner: Arc<Inner>,
}

impl fmt::Debug for PrefetchDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefetchDispatcher")
            .field("queue", &self.inner.queue)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl PrefetchDispatcher {
    #[must_use]
    pub fn new(store: PrefetchStore, services: PrefetchServices, settings: DispatcherSettings) -> Self {
        let ctx = TaskContext::new(store, Arc::clone(&services.clock));
        Self {
            inner: Arc::new(Inner {
                ctx,
                queue: TaskQueue::new(),
                services,
                settings,
                suspended_until: Mutex::new(None),
            }),
        }
    }

    /// The store tasks run against.
    #[must_use]
    pub fn store(&self) -> &PrefetchStore {
        &self.inner.ctx.store
    }

    /// The queue tasks run on.
    #[must_use]
    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    fn ctx(&self) -> TaskContext {
        self.inner.ctx.clone()
    }

    fn enqueue(&self, task: impl Task + 'static) {
        self.inner.queue.add_task(Box::new(task));
    }

    // ==================== Entry Points ====================

    /// Accepts candidate URLs for `name_space` and requests bundles for them.
    #[instrument(skip(self, urls), fields(urls = urls.len()))]
    pub fn add_candidate_urls(&self, name_space: &str, urls: Vec<PrefetchUrl>) {
        self.enqueue(AddUniqueUrlsTask::new(
            self.ctx(),
            Arc::clone(&self.inner.services.ids),
            name_space,
            urls,
        ));
        self.enqueue_generate_bundle();
    }

    /// Invalidates every NEW_REQUEST item of `name_space`.
    #[instrument(skip(self))]
    pub fn remove_all_unprocessed_urls(&self, name_space: &str) {
        self.enqueue(RemoveUrlsTask::new(
            self.ctx(),
            Arc::clone(&self.inner.services.downloader),
            RemovalScope::UnprocessedInNamespace(name_space.to_string()),
        ));
    }

    /// Deletes every item suggested by `client_id`.
    #[instrument(skip(self), fields(client = %client_id))]
    pub fn remove_urls_by_client_id(&self, client_id: ClientId) {
        self.enqueue(RemoveUrlsTask::new(
            self.ctx(),
            Arc::clone(&self.inner.services.downloader),
            RemovalScope::Client(client_id),
        ));
    }

    /// Handles an inbound "operation completed" push.
    #[instrument(skip(self))]
    pub fn operation_completed(&self, operation_name: &str) {
        self.enqueue(MarkOperationDoneTask::new(self.ctx(), operation_name));
        self.enqueue_get_operation();
    }

    /// Queues one forward pass over every stage.
    pub fn schedule_pipeline_processing(&self) {
        self.enqueue_generate_bundle();
        self.enqueue_get_operation();
        self.enqueue_download_archives();
        self.enqueue(ImportArchivesTask::new(
            self.ctx(),
            Arc::clone(&self.inner.services.importer),
        ));
    }

    /// Queues every reconciliation and expiration task, then a forward pass.
    ///
    /// Staleness runs first so expired items are not retried; metrics
    /// finalization runs last so items finished by this tick are reported
    /// in it.
    #[instrument(skip(self))]
    pub fn run_maintenance(&self) {
        let services = &self.inner.services;
        self.enqueue(StaleEntryFinalizerTask::new(
            self.ctx(),
            Arc::clone(&services.staleness),
        ));
        self.enqueue(GeneratePageBundleReconcileTask::new(
            self.ctx(),
            Arc::clone(&services.requests),
        ));
        self.enqueue(SentGetOperationCleanupTask::new(
            self.ctx(),
            Arc::clone(&services.requests),
        ));
        self.enqueue(DownloadCleanupTask::new(
            self.ctx(),
            Arc::clone(&services.downloader),
        ));
        self.enqueue(ImportCleanupTask::new(self.ctx(), Arc::clone(&services.importer)));
        self.enqueue(ArchiveFileReconcileTask::new(
            self.ctx(),
            self.inner.settings.archives_dir.clone(),
        ));
        self.enqueue(MetricsFinalizationTask::new(self.ctx(), Arc::clone(&services.metrics)));
        self.schedule_pipeline_processing();
        info!("maintenance scheduled");
    }

    /// Waits until every queued task has run.
    pub async fn wait_until_idle(&self) {
        self.inner.queue.wait_until_idle().await;
    }

    // ==================== Events ====================

    /// Turns one collaborator completion into its follow-up tasks.
    pub fn handle_event(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::GeneratePageBundleFinished {
                status,
                operation_name,
                pages,
            } => self.bundle_response("generate_page_bundle", status, operation_name, pages),
            PipelineEvent::GetOperationFinished {
                status,
                operation_name,
                pages,
            } => self.bundle_response("get_operation", status, operation_name, pages),
            PipelineEvent::OperationCompleted { operation_name } => {
                self.operation_completed(&operation_name);
            }
            PipelineEvent::DownloadFinished(result) => {
                let succeeded = matches!(result.outcome, DownloadOutcome::Succeeded { .. });
                self.enqueue(DownloadCompletedTask::new(self.ctx(), result));
                if succeeded {
                    self.enqueue(ImportArchivesTask::new(
                        self.ctx(),
                        Arc::clone(&self.inner.services.importer),
                    ));
                } else {
                    self.enqueue_download_archives();
                }
            }
            PipelineEvent::ImportFinished { offline_id, success } => {
                self.enqueue(ImportCompletedTask::new(self.ctx(), offline_id, success));
            }
        }
    }

    fn bundle_response(
        &self,
        rpc: &'static str,
        status: PrefetchRequestStatus,
        operation_name: String,
        pages: Vec<RenderPageInfo>,
    ) {
        match status {
            PrefetchRequestStatus::Success => {
                self.enqueue(PageBundleUpdateTask::new(self.ctx(), operation_name, pages));
                self.enqueue_download_archives();
            }
            PrefetchRequestStatus::Suspend => self.suspend(),
            PrefetchRequestStatus::RetryWithoutBackoff | PrefetchRequestStatus::RetryWithBackoff => {
                // Items stay in flight; reconciliation retries them.
                warn!(rpc, %status, operation = %operation_name, "request failed");
            }
        }
    }

    /// Consumes events until every sender is dropped.
    pub fn spawn_event_loop(&self, mut events: EventReceiver) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!(?event, "pipeline event");
                dispatcher.handle_event(event);
            }
            debug!("event channel closed");
        })
    }

    /// Runs [`run_maintenance`](Self::run_maintenance) every maintenance
    /// interval, starting immediately.
    pub fn spawn_maintenance_ticker(&self) -> JoinHandle<()> {
        let dispatcher = self.clone();
        let period = self.inner.settings.maintenance_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                dispatcher.run_maintenance();
            }
        })
    }

    // ==================== Suspension ====================

    /// True while the service's suspend request is in effect.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        let until = *self
            .inner
            .suspended_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        until.is_some_and(|until| self.inner.services.clock.now() < until)
    }

    fn suspend(&self) {
        let until = self.inner.services.clock.now() + self.inner.settings.suspend;
        *self
            .inner
            .suspended_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(until);
        warn!(%until, "service asked to suspend; bundle requests paused");
    }

    fn enqueue_generate_bundle(&self) {
        if self.is_suspended() {
            debug!("suspended; skipping bundle generation");
            return;
        }
        let services = &self.inner.services;
        self.enqueue(GeneratePageBundleTask::new(
            self.ctx(),
            Arc::clone(&services.push),
            Arc::clone(&services.requests),
            self.inner.settings.max_urls_per_bundle,
        ));
    }

    fn enqueue_get_operation(&self) {
        if self.is_suspended() {
            debug!("suspended; skipping operation polls");
            return;
        }
        self.enqueue(GetOperationTask::new(
            self.ctx(),
            Arc::clone(&self.inner.services.requests),
        ));
    }

    fn enqueue_download_archives(&self) {
        let services = &self.inner.services;
        self.enqueue(DownloadArchivesTask::new(
            self.ctx(),
            Arc::clone(&services.downloader),
            Arc::clone(&services.ids),
            DownloaderQuota::new(self.inner.settings.daily_quota_bytes),
            self.inner.settings.max_concurrent_downloads,
        ));
    }
}
