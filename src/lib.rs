//! Offline Prefetch Core Library
//!
//! A crash-resilient background pipeline that takes candidate URLs, asks a
//! remote service to render and bundle them, downloads the resulting
//! archives and imports them for offline reading.
//!
//! # Architecture
//!
//! - [`store`] - single-connection SQLite store, schema manager, quota tracker
//! - [`item`] - the persisted [`PrefetchItem`] and its state machine enums
//! - [`task`] - [`Task`] trait and the strictly sequential [`TaskQueue`]
//! - [`tasks`] - pipeline action tasks and reconciliation tasks
//! - [`dispatcher`] - entry points and event routing
//! - [`network`], [`download`], [`import`], [`push`] - collaborator
//!   capabilities with HTTP / filesystem implementations
//! - [`metrics`] - histograms for finished items
//! - [`config`] - layered configuration
//! - [`testing`] - deterministic collaborator doubles
//!
//! Every item eventually reaches FINISHED (then ZOMBIE) with a diagnostic
//! error code, whatever happens to the process or the network.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod download;
pub mod events;
pub mod ids;
pub mod import;
pub mod item;
pub mod metrics;
pub mod network;
pub mod push;
pub mod store;
pub mod task;
pub mod tasks;
pub mod testing;
mod user_agent;

// Re-export commonly used types
pub use clock::{Clock, SystemClock, TestClock};
pub use config::{ConfigError, PrefetchConfig};
pub use dispatcher::{DispatcherSettings, PrefetchDispatcher, PrefetchServices};
pub use download::{DownloadResult, Downloader, HttpDownloader, HttpDownloaderConfig};
pub use events::{EventReceiver, EventSender, PipelineEvent};
pub use ids::{IdProvider, RandomIdProvider, SequentialIds};
pub use import::{FileImporter, Importer, PrefetchArchiveInfo};
pub use item::{ClientId, MAX_ATTEMPTS, PrefetchItem, PrefetchItemErrorCode, PrefetchItemState};
pub use metrics::{MetricsRecorder, PrometheusMetrics, RecordingMetrics};
pub use network::{HttpRequestFactory, HttpRequestFactoryConfig, RequestFactory};
pub use push::{PushHandler, StaticTokenHandler};
pub use store::{DownloaderQuota, PrefetchStore, StoreError, StoreOptions};
pub use task::{Task, TaskQueue};
pub use tasks::PrefetchUrl;
