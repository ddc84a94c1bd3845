//! Persistent store for prefetch items and the downloader quota.
//!
//! One background tokio task owns the only `SQLite` connection. All access
//! goes through [`PrefetchStore::execute`], which ships a closure to that
//! task and awaits its typed result. Commands are delivered over an ordered
//! channel, so anything submitted while the store is still initializing runs
//! afterwards in submission order.
//!
//! # Overview
//!
//! - [`PrefetchStore`] - handle used by tasks, the dispatcher and the CLI
//! - [`StoreOptions`] - file or in-memory location, busy timeout, open retry
//! - [`schema`] - schema creation and migrations
//! - [`items`] - row helpers
//! - [`DownloaderQuota`] - lazily replenished download budget
//!
//! # Example
//!
//! ```no_run
//! use prefetch_core::store::{items, PrefetchStore, StoreOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PrefetchStore::open(StoreOptions::file("prefetch.db"));
//! let all = store
//!     .execute(|conn| Box::pin(async move { items::list_items(conn).await }))
//!     .await?;
//! println!("{} items", all.len());
//! # Ok(())
//! # }
//! ```

mod backoff;
mod error;
pub mod items;
mod quota;
pub mod schema;

pub use backoff::{DEFAULT_OPEN_ATTEMPTS, OpenBackoff};
pub use error::{StoreError, StoreErrorKind};
pub use quota::{DEFAULT_DAILY_QUOTA_BYTES, DownloaderQuota};

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, instrument, warn};

/// Default `SQLite` busy timeout.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const PAGE_SIZE: u32 = 4096;
const CACHE_SIZE_PAGES: &str = "500";

type Command =
    Box<dyn for<'c> FnOnce(Result<&'c mut SqliteConnection, StoreError>) -> BoxFuture<'c, ()> + Send>;

fn boxed_command<F>(command: F) -> Command
where
    F: for<'c> FnOnce(Result<&'c mut SqliteConnection, StoreError>) -> BoxFuture<'c, ()>
        + Send
        + 'static,
{
    Box::new(command)
}

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// A database file, created when missing.
    File(PathBuf),
    /// A private in-memory database that disappears with the store.
    InMemory,
}

/// Options for opening a [`PrefetchStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Database location.
    pub location: StoreLocation,
    /// How long a statement waits on a locked database.
    pub busy_timeout: Duration,
    /// Retry schedule for initialization.
    pub open_backoff: OpenBackoff,
}

impl StoreOptions {
    /// Options for a file-backed store.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            location: StoreLocation::File(path.into()),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            open_backoff: OpenBackoff::default(),
        }
    }

    /// Options for an ephemeral in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            location: StoreLocation::InMemory,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            open_backoff: OpenBackoff::default(),
        }
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    #[must_use]
    pub fn with_open_backoff(mut self, open_backoff: OpenBackoff) -> Self {
        self.open_backoff = open_backoff;
        self
    }

    fn connect_options(&self) -> Result<SqliteConnectOptions, StoreError> {
        let options = match &self.location {
            StoreLocation::File(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal),
            // Not cfg(test): the CLI and ephemeral runs use it too.
            StoreLocation::InMemory => SqliteConnectOptions::from_str("sqlite::memory:")?,
        };
        Ok(options
            .busy_timeout(self.busy_timeout)
            .page_size(PAGE_SIZE)
            .pragma("cache_size", CACHE_SIZE_PAGES))
    }
}

/// Initialization state of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitializationStatus {
    /// Still opening or migrating.
    Pending,
    /// Ready for work.
    Ready,
    /// Permanently failed; every command resolves with
    /// [`StoreError::Unavailable`].
    Failed(String),
}

/// Handle to the background store task.
///
/// Cheap to clone. The background task exits once every handle is dropped.
#[derive(Clone)]
pub struct PrefetchStore {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<InitializationStatus>,
}

impl fmt::Debug for PrefetchStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefetchStore")
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl PrefetchStore {
    /// Spawns the background task and starts initialization.
    ///
    /// Returns immediately; commands may be submitted right away.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn open(options: StoreOptions) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(InitializationStatus::Pending);
        tokio::spawn(run_store(options, status_tx, receiver));
        Self { commands, status }
    }

    /// Opens an ephemeral in-memory store.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::open(StoreOptions::in_memory())
    }

    /// Runs `work` against the connection on the store task.
    ///
    /// `work` opens its own transaction when it needs one; an error returned
    /// from inside a transaction drops it, rolling everything back.
    ///
    /// # Errors
    ///
    /// Returns whatever `work` returns, or [`StoreError::Unavailable`] when
    /// the store failed to initialize or has shut down.
    pub async fn execute<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, StoreError>>
            + Send
            + 'static,
    {
        let (reply, response) = oneshot::channel();
        let command = boxed_command(move |conn| {
            Box::pin(async move {
                let result = match conn {
                    Ok(conn) => work(conn).await,
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            })
        });

        self.commands
            .send(command)
            .map_err(|_| StoreError::unavailable("store task has shut down"))?;
        response
            .await
            .map_err(|_| StoreError::unavailable("store command was abandoned"))?
    }

    /// Returns the current initialization state.
    #[must_use]
    pub fn initialization_status(&self) -> InitializationStatus {
        self.status.borrow().clone()
    }

    /// Waits until initialization finishes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when initialization failed.
    pub async fn wait_for_initialization(&self) -> Result<(), StoreError> {
        let mut status = self.status.clone();
        let settled = status
            .wait_for(|s| *s != InitializationStatus::Pending)
            .await
            .map_err(|_| StoreError::unavailable("store task has shut down"))?
            .clone();
        match settled {
            InitializationStatus::Ready => Ok(()),
            InitializationStatus::Failed(reason) => Err(StoreError::unavailable(reason)),
            InitializationStatus::Pending => Err(StoreError::unavailable("store never initialized")),
        }
    }
}

#[instrument(skip_all, fields(location = ?options.location))]
async fn run_store(
    options: StoreOptions,
    status: watch::Sender<InitializationStatus>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    match initialize(&options).await {
        Ok(mut conn) => {
            info!("prefetch store ready");
            status.send_replace(InitializationStatus::Ready);
            while let Some(command) = commands.recv().await {
                let outcome = std::panic::AssertUnwindSafe(command(Ok(&mut conn)))
                    .catch_unwind()
                    .await;
                if outcome.is_err() {
                    warn!("store command panicked");
                }
            }
            if let Err(err) = conn.close().await {
                debug!(error = %err, "error closing store connection");
            }
        }
        Err(err) => {
            error!(error = %err, "prefetch store failed to initialize");
            let reason = err.to_string();
            status.send_replace(InitializationStatus::Failed(reason.clone()));
            while let Some(command) = commands.recv().await {
                command(Err(StoreError::unavailable(reason.clone()))).await;
            }
        }
    }
}

async fn initialize(options: &StoreOptions) -> Result<SqliteConnection, StoreError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match open_connection(options).await {
            Ok(conn) => return Ok(conn),
            Err(err @ StoreError::IncompatibleSchema { .. }) => return Err(err),
            Err(err) => match options.open_backoff.delay_after(attempt) {
                Some(delay) => {
                    warn!(attempt, error = %err, delay_ms = delay.as_millis(), "store open failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            },
        }
    }
}

async fn open_connection(options: &StoreOptions) -> Result<SqliteConnection, StoreError> {
    if let StoreLocation::File(path) = &options.location {
        ensure_parent_dir(path).await?;
    }
    let mut conn = options.connect_options()?.connect().await?;
    schema::create_or_upgrade_if_needed(&mut conn).await?;
    Ok(conn)
}

async fn ensure_parent_dir(path: &Path) -> Result<(), StoreError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::unavailable(format!("cannot create {}: {e}", parent.display()))),
        _ => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_becomes_ready() {
        let store = PrefetchStore::in_memory();
        store.wait_for_initialization().await.unwrap();
        assert_eq!(store.initialization_status(), InitializationStatus::Ready);
    }

    #[tokio::test]
    async fn test_execute_returns_typed_result() {
        let store = PrefetchStore::in_memory();
        let value: i64 = store
            .execute(|conn| {
                Box::pin(async move {
                    let v: i64 = sqlx::query_scalar("SELECT 40 + 2").fetch_one(conn).await?;
                    Ok(v)
                })
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_commands_before_init_run_in_order() {
        let store = PrefetchStore::in_memory();
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let pending = (0..5_usize).map(|i| {
            let order = std::sync::Arc::clone(&order);
            store.execute(move |_conn| {
                Box::pin(async move {
                    order.lock().unwrap().push(i);
                    Ok(())
                })
            })
        });
        for result in futures_util::future::join_all(pending).await {
            result.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_work_error_is_returned() {
        let store = PrefetchStore::in_memory();
        let err = store
            .execute(|conn| {
                Box::pin(async move {
                    sqlx::query("SELECT * FROM no_such_table").execute(conn).await?;
                    Ok(())
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Database { .. }));
    }

    #[tokio::test]
    async fn test_panicking_command_does_not_kill_store() {
        let store = PrefetchStore::in_memory();
        let err = store
            .execute::<(), _>(|_conn| {
                Box::pin(async move {
                    if true {
                        panic!("boom");
                    }
                    Ok(())
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));

        let ok: i64 = store
            .execute(|conn| {
                Box::pin(async move {
                    let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(conn).await?;
                    Ok(one)
                })
            })
            .await
            .unwrap();
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn test_unopenable_file_fails_permanently() {
        let dir = tempfile::TempDir::new().unwrap();
        // A directory cannot be opened as a database file.
        let options = StoreOptions::file(dir.path()).with_open_backoff(OpenBackoff::immediate(2));
        let store = PrefetchStore::open(options);

        let err = store.wait_for_initialization().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));
        assert!(matches!(
            store.initialization_status(),
            InitializationStatus::Failed(_)
        ));

        let err = store
            .execute(|_conn| Box::pin(async move { Ok(()) }))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));
    }
}
