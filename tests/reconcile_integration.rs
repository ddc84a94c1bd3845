//! Maintenance passes over a store left behind by an interrupted run.

use std::path::PathBuf;

use prefetch_core::metrics::{FINISHED_ERROR_CODE, ITEM_LIFETIME_SECONDS};
use prefetch_core::testing::{read_item, seed_items};
use prefetch_core::{
    ClientId, DispatcherSettings, DownloadResult, PrefetchItem, PrefetchItemErrorCode,
    PrefetchItemState, PrefetchStore,
};
use tempfile::TempDir;
use time::{Duration, OffsetDateTime};

mod support;
use support::{FakePipeline, T0_UNIX};

fn t0() -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(T0_UNIX).expect("valid timestamp")
}

fn item(offline_id: i64, state: PrefetchItemState, freshness: OffsetDateTime) -> PrefetchItem {
    let mut item = PrefetchItem::new_request(
        offline_id,
        ClientId::new("ns", format!("c{offline_id}")),
        format!("https://site.test/{offline_id}"),
        "title",
        freshness,
    );
    item.state = state;
    item
}

fn pipeline_with_archives(archives_dir: PathBuf) -> FakePipeline {
    let settings = DispatcherSettings {
        archives_dir,
        ..DispatcherSettings::default()
    };
    FakePipeline::new(PrefetchStore::in_memory(), settings)
}

// ==================== Expiration Tests ====================

#[tokio::test]
async fn test_stale_request_is_finalized_reported_and_retired() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let p = pipeline_with_archives(temp_dir.path().to_path_buf());
    seed_items(
        p.dispatcher.store(),
        vec![
            item(1, PrefetchItemState::NewRequest, t0() - Duration::days(2)),
            item(2, PrefetchItemState::ReceivedGcm, t0() - Duration::hours(1)),
        ],
    )
    .await
    .expect("seed");

    p.dispatcher.run_maintenance();
    p.dispatcher.wait_until_idle().await;

    let stale = read_item(p.dispatcher.store(), 1).await.expect("read").expect("item 1");
    assert_eq!(stale.state, PrefetchItemState::Zombie);
    assert_eq!(stale.error_code, PrefetchItemErrorCode::StaleAtNewRequest);
    assert_eq!(p.metrics.count(ITEM_LIFETIME_SECONDS), 1);
    assert_eq!(
        p.metrics.values(FINISHED_ERROR_CODE),
        vec![600.0]
    );

    let fresh = read_item(p.dispatcher.store(), 2).await.expect("read").expect("item 2");
    assert_eq!(fresh.state, PrefetchItemState::ReceivedGcm);
}

#[tokio::test]
async fn test_future_freshness_is_finalized_as_clock_skew() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let p = pipeline_with_archives(temp_dir.path().to_path_buf());
    seed_items(
        p.dispatcher.store(),
        vec![item(1, PrefetchItemState::AwaitingGcm, t0() + Duration::days(3))],
    )
    .await
    .expect("seed");

    p.dispatcher.run_maintenance();
    p.dispatcher.wait_until_idle().await;

    let skewed = read_item(p.dispatcher.store(), 1).await.expect("read").expect("item 1");
    assert_eq!(skewed.state, PrefetchItemState::Zombie);
    assert_eq!(
        skewed.error_code,
        PrefetchItemErrorCode::MaximumClockBackwardSkewExceeded
    );
}

// ==================== Crash Recovery Tests ====================

#[tokio::test]
async fn test_lost_download_is_restarted() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let p = pipeline_with_archives(temp_dir.path().to_path_buf());
    let mut downloading = item(1, PrefetchItemState::Downloading, t0());
    downloading.guid = "guid-1".to_string();
    downloading.archive_body_name = "body-1".to_string();
    downloading.download_initiation_attempts = 1;
    seed_items(p.dispatcher.store(), vec![downloading]).await.expect("seed");

    p.dispatcher.run_maintenance();
    p.dispatcher.wait_until_idle().await;

    let started = p.downloader.started();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].archive_body_name, "body-1");
    let restarted = read_item(p.dispatcher.store(), 1).await.expect("read").expect("item 1");
    assert_eq!(restarted.state, PrefetchItemState::Downloading);
    assert_eq!(restarted.download_initiation_attempts, 2);
}

#[tokio::test]
async fn test_download_finished_while_down_is_recovered_and_imported() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let archive = temp_dir.path().join("guid-1.mhtml");
    std::fs::write(&archive, b"archive").expect("write archive");

    let p = pipeline_with_archives(temp_dir.path().to_path_buf());
    let mut downloading = item(1, PrefetchItemState::Downloading, t0());
    downloading.guid = "guid-1".to_string();
    downloading.download_initiation_attempts = 1;
    seed_items(p.dispatcher.store(), vec![downloading]).await.expect("seed");
    p.downloader
        .add_completed(DownloadResult::succeeded("guid-1", &archive, 7));

    p.dispatcher.run_maintenance();
    p.dispatcher.wait_until_idle().await;

    assert!(p.downloader.started().is_empty());
    let imported = p.importer.imported();
    assert_eq!(imported.len(), 1);
    assert_eq!(imported[0].offline_id, 1);
    assert_eq!(imported[0].file_path, archive);
    let item = read_item(p.dispatcher.store(), 1).await.expect("read").expect("item 1");
    assert_eq!(item.state, PrefetchItemState::Importing);
    assert_eq!(item.file_size, 7);
}

#[tokio::test]
async fn test_missing_archive_and_orphan_files_are_reconciled() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let orphan = temp_dir.path().join("orphan-guid.mhtml");
    std::fs::write(&orphan, b"left over").expect("write orphan");

    let p = pipeline_with_archives(temp_dir.path().to_path_buf());
    let mut downloaded = item(1, PrefetchItemState::Downloaded, t0());
    downloaded.guid = "guid-1".to_string();
    downloaded.file_path = temp_dir.path().join("guid-1.mhtml").to_string_lossy().into_owned();
    downloaded.file_size = 10;
    seed_items(p.dispatcher.store(), vec![downloaded]).await.expect("seed");

    p.dispatcher.run_maintenance();
    p.dispatcher.wait_until_idle().await;

    let missing = read_item(p.dispatcher.store(), 1).await.expect("read").expect("item 1");
    assert_eq!(missing.state, PrefetchItemState::Zombie);
    assert_eq!(missing.error_code, PrefetchItemErrorCode::ArchiveFileMissing);
    assert!(missing.file_missing_time.is_some());
    assert!(!orphan.exists(), "unreferenced archive removed");
    assert!(p.importer.imported().is_empty());
}

#[tokio::test]
async fn test_interrupted_import_is_aborted() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let p = pipeline_with_archives(temp_dir.path().to_path_buf());
    seed_items(
        p.dispatcher.store(),
        vec![item(1, PrefetchItemState::Importing, t0())],
    )
    .await
    .expect("seed");

    p.dispatcher.run_maintenance();
    p.dispatcher.wait_until_idle().await;

    let aborted = read_item(p.dispatcher.store(), 1).await.expect("read").expect("item 1");
    assert_eq!(aborted.state, PrefetchItemState::Zombie);
    assert_eq!(aborted.error_code, PrefetchItemErrorCode::ImportAborted);
}
