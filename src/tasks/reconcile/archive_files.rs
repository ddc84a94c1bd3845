use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::Connection;
use tracing::{debug, info, instrument, warn};

use crate::download::constants::{ARCHIVE_EXTENSION, PARTIAL_EXTENSION};
use crate::item::{PrefetchItemErrorCode, PrefetchItemState, to_micros};
use crate::store::items;
use crate::store::schema::ITEMS_TABLE;
use crate::task::Task;
use crate::tasks::{TaskContext, log_store_failure};

/// Archive files the store still needs after the consistency pass.
#[derive(Debug, Default)]
struct LiveArchives {
    missing: usize,
    file_names: HashSet<String>,
    downloading_guids: HashSet<String>,
}

/// Keeps archive files and DOWNLOADED rows consistent.
///
/// DOWNLOADED items whose archive vanished finish with ARCHIVE_FILE_MISSING.
/// Archive files (complete or partial) that no row refers to are deleted.
pub struct ArchiveFileReconcileTask {
    ctx: TaskContext,
    archives_dir: PathBuf,
}

impl ArchiveFileReconcileTask {
    #[must_use]
    pub fn new(ctx: TaskContext, archives_dir: impl Into<PathBuf>) -> Self {
        Self {
            ctx,
            archives_dir: archives_dir.into(),
        }
    }

    async fn remove_orphans(&self, live: &LiveArchives) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.archives_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return 0,
            Err(err) => {
                warn!(dir = %self.archives_dir.display(), error = %err, "cannot list archives");
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "archive listing interrupted");
                    break;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(guid) = archive_guid(&name) else {
                continue;
            };
            if live.file_names.contains(&name) || live.downloading_guids.contains(guid) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {
                    debug!(file = %name, "orphaned archive removed");
                    removed += 1;
                }
                Err(err) => warn!(file = %name, error = %err, "failed to remove orphaned archive"),
            }
        }
        removed
    }
}

/// Returns the download guid for archive file names, `None` for anything else.
fn archive_guid(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(&format!(".{PARTIAL_EXTENSION}"))
        .or_else(|| file_name.strip_suffix(&format!(".{ARCHIVE_EXTENSION}")))
        .filter(|guid| !guid.is_empty())
}

fn file_name_of(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

#[async_trait]
impl Task for ArchiveFileReconcileTask {
    fn name(&self) -> &'static str {
        "archive_file_reconcile"
    }

    #[instrument(skip(self), fields(dir = %self.archives_dir.display()))]
    async fn run(&mut self) {
        let now = self.ctx.now();
        let result = self
            .ctx
            .store
            .execute(move |conn| {
                Box::pin(async move {
                    let mut tx = conn.begin().await?;
                    let mut live = LiveArchives::default();

                    for item in items::items_in_state(&mut tx, PrefetchItemState::Downloaded).await? {
                        let present = !item.file_path.is_empty()
                            && tokio::fs::try_exists(&item.file_path).await.unwrap_or(false);
                        if present {
                            live.file_names.extend(file_name_of(&item.file_path));
                            continue;
                        }
                        sqlx::query(&format!(
                            "UPDATE {ITEMS_TABLE} SET state = ?, error_code = ?, file_missing_time = ? \
                             WHERE offline_id = ? AND state = ?"
                        ))
                        .bind(PrefetchItemState::Finished.to_db())
                        .bind(PrefetchItemErrorCode::ArchiveFileMissing.to_db())
                        .bind(to_micros(now))
                        .bind(item.offline_id)
                        .bind(PrefetchItemState::Downloaded.to_db())
                        .execute(&mut *tx)
                        .await?;
                        live.missing += 1;
                    }

                    for item in items::items_in_state(&mut tx, PrefetchItemState::Importing).await? {
                        live.file_names.extend(file_name_of(&item.file_path));
                    }
                    for item in items::items_in_state(&mut tx, PrefetchItemState::Downloading).await? {
                        live.downloading_guids.insert(item.guid);
                    }
                    tx.commit().await?;
                    Ok(live)
                })
            })
            .await;

        let live = match result {
            Ok(live) => live,
            Err(err) => {
                log_store_failure(self.name(), &err);
                return;
            }
        };
        let removed = self.remove_orphans(&live).await;
        if live.missing > 0 || removed > 0 {
            info!(missing = live.missing, removed, "archive files reconciled");
        }
    }
}
