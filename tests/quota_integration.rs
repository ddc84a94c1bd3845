//! Download quota behavior against a real store.

use prefetch_core::store::DEFAULT_DAILY_QUOTA_BYTES;
use prefetch_core::{DownloaderQuota, PrefetchStore};
use time::{Duration, OffsetDateTime};

fn t0() -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("valid timestamp")
}

async fn read(store: &PrefetchStore, quota: DownloaderQuota, now: OffsetDateTime) -> i64 {
    store
        .execute(move |conn| Box::pin(async move { quota.get_available_quota(conn, now).await }))
        .await
        .expect("read quota")
}

async fn write(store: &PrefetchStore, quota: DownloaderQuota, now: OffsetDateTime, value: i64) {
    store
        .execute(move |conn| Box::pin(async move { quota.set_available_quota(conn, now, value).await }))
        .await
        .expect("write quota");
}

#[tokio::test]
async fn test_untouched_quota_is_the_daily_cap() {
    let store = PrefetchStore::in_memory();
    let quota = DownloaderQuota::default();
    assert_eq!(read(&store, quota, t0()).await, DEFAULT_DAILY_QUOTA_BYTES);
    assert_eq!(DEFAULT_DAILY_QUOTA_BYTES, 20 * 1024 * 1024);
}

#[tokio::test]
async fn test_spent_quota_refills_linearly_over_a_day() {
    let store = PrefetchStore::in_memory();
    let quota = DownloaderQuota::new(1_000_000);
    write(&store, quota, t0(), 0).await;

    assert_eq!(read(&store, quota, t0()).await, 0);
    assert_eq!(read(&store, quota, t0() + Duration::hours(12)).await, 500_000);
    assert_eq!(read(&store, quota, t0() + Duration::hours(6)).await, 250_000);
    assert_eq!(read(&store, quota, t0() + Duration::days(3)).await, 1_000_000);
}

#[tokio::test]
async fn test_quota_is_clamped_to_zero_and_the_cap() {
    let store = PrefetchStore::in_memory();
    let quota = DownloaderQuota::new(1_000);

    write(&store, quota, t0(), 5_000).await;
    assert_eq!(read(&store, quota, t0()).await, 1_000);

    write(&store, quota, t0(), -5).await;
    assert_eq!(read(&store, quota, t0()).await, 0);
}

#[tokio::test]
async fn test_clock_moving_backwards_does_not_refill() {
    let store = PrefetchStore::in_memory();
    let quota = DownloaderQuota::new(1_000);
    write(&store, quota, t0(), 100).await;

    assert_eq!(read(&store, quota, t0() - Duration::hours(5)).await, 100);
}
