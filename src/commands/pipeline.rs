//! Commands that feed the pipeline: intake, removal, push notifications,
//! maintenance and the long-running service.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use prefetch_core::events;
use prefetch_core::{
    ClientId, Downloader, FileImporter, HttpDownloader, HttpDownloaderConfig, HttpRequestFactory,
    HttpRequestFactoryConfig, Importer, PrefetchConfig, PrefetchDispatcher, PrefetchServices,
    PrefetchUrl, PrometheusMetrics, RequestFactory, StaticTokenHandler,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::open_store;
use crate::cli::AddArgs;

const SETTLE_POLL: Duration = Duration::from_millis(100);

/// Dispatcher wired to the HTTP and filesystem collaborators.
struct PipelineRuntime {
    dispatcher: PrefetchDispatcher,
    requests: Arc<HttpRequestFactory>,
    downloader: Arc<HttpDownloader>,
    importer: Arc<FileImporter>,
    event_loop: JoinHandle<()>,
}

impl PipelineRuntime {
    async fn start(config: &PrefetchConfig) -> Result<Self> {
        let store = open_store(config).await?;
        let (sender, receiver) = events::channel();

        let requests = Arc::new(
            HttpRequestFactory::new(
                HttpRequestFactoryConfig::new(&config.service_url)
                    .with_request_timeout(config.request_timeout()),
                sender.clone(),
            )
            .context("failed to build service client")?,
        );
        let downloader = Arc::new(
            HttpDownloader::new(
                HttpDownloaderConfig::new(config.download_base_url(), &config.archives_dir)
                    .with_read_timeout(config.download_timeout()),
                sender.clone(),
            )
            .context("failed to build download client")?,
        );
        let importer = Arc::new(FileImporter::new(&config.pages_dir, sender));
        let metrics = Arc::new(PrometheusMetrics::new().context("failed to register histograms")?);
        let push = Arc::new(StaticTokenHandler::new(config.push_token.clone()));

        let services = PrefetchServices::new(
            requests.clone(),
            downloader.clone(),
            importer.clone(),
            push,
            metrics,
        );
        let dispatcher = PrefetchDispatcher::new(store, services, config.dispatcher_settings());
        let event_loop = dispatcher.spawn_event_loop(receiver);

        Ok(Self {
            dispatcher,
            requests,
            downloader,
            importer,
            event_loop,
        })
    }

    fn in_flight(&self) -> usize {
        self.requests.outstanding_generate_urls().len()
            + self.requests.outstanding_operation_names().len()
            + self.downloader.outstanding_download_ids().len()
            + self.importer.ongoing_imports().len()
    }

    /// Drains the task queue, then waits up to `wait` for RPCs, downloads
    /// and imports to report back. Returns whether everything settled.
    async fn settle(&self, wait: Duration) -> bool {
        self.dispatcher.wait_until_idle().await;
        if wait.is_zero() {
            return self.in_flight() == 0;
        }

        // Completions enqueue follow-up tasks, so idle must be seen twice in a row.
        let settled = tokio::time::timeout(wait, async {
            let mut quiet_polls = 0;
            while quiet_polls < 2 {
                self.dispatcher.wait_until_idle().await;
                if self.in_flight() == 0 && !self.dispatcher.queue().has_pending_tasks() {
                    quiet_polls += 1;
                } else {
                    quiet_polls = 0;
                }
                tokio::time::sleep(SETTLE_POLL).await;
            }
        })
        .await
        .is_ok();

        if settled {
            debug!("pipeline settled");
        } else {
            warn!(
                in_flight = self.in_flight(),
                wait_secs = wait.as_secs(),
                "gave up waiting; remaining work resumes on the next run"
            );
        }
        settled
    }

    async fn shutdown(self) {
        self.dispatcher.wait_until_idle().await;
        self.event_loop.abort();
    }
}

/// Suggests URLs for one namespace and pushes them through the pipeline.
pub async fn run_add_command(config: &PrefetchConfig, args: &AddArgs, wait: Duration) -> Result<()> {
    let mut urls: Vec<PrefetchUrl> = args
        .urls
        .iter()
        .map(|url| PrefetchUrl::new(url.clone(), url.clone(), ""))
        .collect();
    if let Some(path) = &args.from_json {
        urls.extend(read_url_list(path)?);
    }
    if urls.is_empty() {
        bail!("no URLs given; pass them as arguments or with --from-json");
    }

    let count = urls.len();
    let runtime = PipelineRuntime::start(config).await?;
    runtime.dispatcher.add_candidate_urls(&args.namespace, urls);
    runtime.settle(wait).await;
    runtime.shutdown().await;

    info!(namespace = %args.namespace, count, "candidate URLs submitted");
    println!("submitted {count} URL(s) to {}", args.namespace);
    Ok(())
}

fn read_url_list(path: &Path) -> Result<Vec<PrefetchUrl>> {
    let text = if path == Path::new("-") {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read URL list from stdin")?;
        buffer
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read URL list {}", path.display()))?
    };
    serde_json::from_str(&text)
        .with_context(|| format!("invalid URL list in {}", path.display()))
}

/// Invalidates every not-yet-requested URL of a namespace.
pub async fn run_remove_unprocessed_command(
    config: &PrefetchConfig,
    namespace: &str,
    wait: Duration,
) -> Result<()> {
    let runtime = PipelineRuntime::start(config).await?;
    runtime.dispatcher.remove_all_unprocessed_urls(namespace);
    runtime.settle(wait).await;
    runtime.shutdown().await;
    println!("removed unprocessed URLs of {namespace}");
    Ok(())
}

/// Deletes every item suggested by one client.
pub async fn run_remove_command(
    config: &PrefetchConfig,
    namespace: String,
    id: String,
    wait: Duration,
) -> Result<()> {
    let client_id = ClientId::new(namespace, id);
    let runtime = PipelineRuntime::start(config).await?;
    runtime.dispatcher.remove_urls_by_client_id(client_id.clone());
    runtime.settle(wait).await;
    runtime.shutdown().await;
    println!("removed items of {client_id}");
    Ok(())
}

/// Reports a completed bundle operation, as a push message would.
pub async fn run_notify_command(config: &PrefetchConfig, operation: &str, wait: Duration) -> Result<()> {
    if operation.trim().is_empty() {
        bail!("operation name must not be empty");
    }
    let runtime = PipelineRuntime::start(config).await?;
    runtime.dispatcher.operation_completed(operation);
    runtime.settle(wait).await;
    runtime.shutdown().await;
    println!("operation {operation} marked done");
    Ok(())
}

/// Runs one reconciliation pass followed by a forward pass.
pub async fn run_maintain_command(config: &PrefetchConfig, wait: Duration) -> Result<()> {
    let runtime = PipelineRuntime::start(config).await?;
    runtime.dispatcher.run_maintenance();
    let settled = runtime.settle(wait).await;
    runtime.shutdown().await;
    println!("maintenance complete{}", if settled { "" } else { " (work still in flight)" });
    Ok(())
}

/// Runs the pipeline until Ctrl-C, with maintenance at startup and then
/// every maintenance interval.
pub async fn run_service_command(config: &PrefetchConfig) -> Result<()> {
    let runtime = PipelineRuntime::start(config).await?;
    let ticker = runtime.dispatcher.spawn_maintenance_ticker();
    info!(
        interval_secs = config.maintenance_interval_secs,
        "prefetch service running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("interrupt received, shutting down");
    ticker.abort();
    runtime.shutdown().await;
    Ok(())
}
