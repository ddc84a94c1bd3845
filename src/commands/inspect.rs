//! Read-only views of the store: counts, item listings, quota, histograms.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use prefetch_core::store::items;
use prefetch_core::tasks::TaskContext;
use prefetch_core::tasks::reconcile::MetricsFinalizationTask;
use prefetch_core::{
    DownloaderQuota, PrefetchConfig, PrefetchItem, PrefetchItemErrorCode, PrefetchItemState,
    PrometheusMetrics, SystemClock, Task,
};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::open_store;

/// Prints item counts per state.
pub async fn run_status_command(config: &PrefetchConfig, json: bool) -> Result<()> {
    let store = open_store(config).await?;
    let counts = store
        .execute(|conn| Box::pin(async move { items::count_by_state(conn).await }))
        .await
        .context("failed to count items")?;
    let total: i64 = counts.iter().map(|(_, count)| count).sum();

    if json {
        let mut by_state: BTreeMap<&'static str, i64> = BTreeMap::new();
        for (state, count) in &counts {
            by_state.insert(state.as_str(), *count);
        }
        let report = serde_json::json!({ "states": by_state, "total": total });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if counts.is_empty() {
        println!("no items");
        return Ok(());
    }
    for (state, count) in &counts {
        println!("{:<22} {count}", state.as_str());
    }
    println!("{:<22} {total}", "total");
    Ok(())
}

#[derive(Debug, Serialize)]
struct ItemView<'a> {
    offline_id: i64,
    state: PrefetchItemState,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<PrefetchItemErrorCode>,
    client_namespace: &'a str,
    client_id: &'a str,
    requested_url: &'a str,
    final_archived_url: &'a str,
    title: &'a str,
    operation_name: &'a str,
    generate_bundle_attempts: i64,
    get_operation_attempts: i64,
    download_initiation_attempts: i64,
    file_path: &'a str,
    file_size: i64,
    creation_time: String,
    freshness_time: String,
}

impl<'a> From<&'a PrefetchItem> for ItemView<'a> {
    fn from(item: &'a PrefetchItem) -> Self {
        Self {
            offline_id: item.offline_id,
            state: item.state,
            error_code: item.state.is_terminal().then_some(item.error_code),
            client_namespace: &item.client_id.name_space,
            client_id: &item.client_id.id,
            requested_url: &item.requested_url,
            final_archived_url: &item.final_archived_url,
            title: &item.title,
            operation_name: &item.operation_name,
            generate_bundle_attempts: item.generate_bundle_attempts,
            get_operation_attempts: item.get_operation_attempts,
            download_initiation_attempts: item.download_initiation_attempts,
            file_path: &item.file_path,
            file_size: item.file_size,
            creation_time: rfc3339(item.creation_time),
            freshness_time: rfc3339(item.freshness_time),
        }
    }
}

fn rfc3339(time: OffsetDateTime) -> String {
    time.format(&Rfc3339)
        .unwrap_or_else(|_| time.unix_timestamp().to_string())
}

/// Lists items, optionally only those in one state.
pub async fn run_list_command(
    config: &PrefetchConfig,
    state: Option<PrefetchItemState>,
    json: bool,
) -> Result<()> {
    let store = open_store(config).await?;
    let listed = store
        .execute(move |conn| {
            Box::pin(async move {
                match state {
                    Some(state) => items::items_in_state(conn, state).await,
                    None => items::list_items(conn).await,
                }
            })
        })
        .await
        .context("failed to list items")?;

    let views: Vec<ItemView<'_>> = listed.iter().map(ItemView::from).collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }

    for view in &views {
        let code = view.error_code.map_or("-", PrefetchItemErrorCode::as_str);
        println!(
            "{:>20}  {:<18} {:<36} {}:{}  {}",
            view.offline_id,
            view.state.as_str(),
            code,
            view.client_namespace,
            view.client_id,
            view.requested_url
        );
    }
    Ok(())
}

/// Prints the download quota available right now.
pub async fn run_quota_command(config: &PrefetchConfig) -> Result<()> {
    let store = open_store(config).await?;
    let quota = DownloaderQuota::new(config.daily_quota_bytes);
    let daily_cap = quota.daily_cap();
    let now = OffsetDateTime::now_utc();
    let available = store
        .execute(move |conn| Box::pin(async move { quota.get_available_quota(conn, now).await }))
        .await
        .context("failed to read download quota")?;
    println!("available {available} of {daily_cap} bytes");
    Ok(())
}

/// Reports every FINISHED item and prints the resulting histograms.
pub async fn run_metrics_command(config: &PrefetchConfig) -> Result<()> {
    let store = open_store(config).await?;
    let metrics = Arc::new(PrometheusMetrics::new().context("failed to register histograms")?);
    let ctx = TaskContext::new(store, Arc::new(SystemClock));
    MetricsFinalizationTask::new(ctx, metrics.clone()).run().await;
    print!("{}", metrics.render().context("failed to encode histograms")?);
    Ok(())
}
