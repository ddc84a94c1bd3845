use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Connection;
use time::Duration;
use tracing::{debug, instrument, warn};

use crate::item::{PrefetchItemErrorCode, PrefetchItemState, to_micros};
use crate::store::schema::ITEMS_TABLE;
use crate::task::Task;
use crate::tasks::{TaskContext, log_store_failure};

/// How long an item may wait in one state, and how it finishes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleRule {
    pub max_age: Duration,
    pub error_code: PrefetchItemErrorCode,
}

/// Decides which states are time-boxed and for how long.
pub trait StalenessPolicy: Send + Sync {
    /// Budget for `state`, or `None` when the state is not time-boxed.
    fn rule_for(&self, state: PrefetchItemState) -> Option<StaleRule>;

    /// How far in the future a freshness time may lie before the clock is
    /// assumed to have moved backwards.
    fn max_clock_backward_skew(&self) -> Duration {
        Duration::days(1)
    }
}

/// Freshness buckets: one day for NEW_REQUEST and the push/bundle waiting
/// states, two days for DOWNLOADING.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStalenessPolicy;

impl StalenessPolicy for DefaultStalenessPolicy {
    fn rule_for(&self, state: PrefetchItemState) -> Option<StaleRule> {
        let (days, error_code) = match state {
            PrefetchItemState::NewRequest => (1, PrefetchItemErrorCode::StaleAtNewRequest),
            PrefetchItemState::AwaitingGcm => (1, PrefetchItemErrorCode::StaleAtAwaitingGcm),
            PrefetchItemState::ReceivedGcm => (1, PrefetchItemErrorCode::StaleAtReceivedGcm),
            PrefetchItemState::ReceivedBundle => (1, PrefetchItemErrorCode::StaleAtReceivedBundle),
            PrefetchItemState::Downloading => (2, PrefetchItemErrorCode::StaleAtDownloading),
            _ => return None,
        };
        Some(StaleRule {
            max_age: Duration::days(days),
            error_code,
        })
    }
}

/// Finishes items that stayed too long in a time-boxed state, and items
/// whose freshness lies implausibly far in the future.
///
/// An item is stale when its freshness time is strictly older than
/// `now - max_age`. Everything happens in one transaction.
pub struct StaleEntryFinalizerTask {
    ctx: TaskContext,
    policy: Arc<dyn StalenessPolicy>,
}

impl StaleEntryFinalizerTask {
    #[must_use]
    pub fn new(ctx: TaskContext, policy: Arc<dyn StalenessPolicy>) -> Self {
        Self { ctx, policy }
    }

    /// Uses [`DefaultStalenessPolicy`].
    #[must_use]
    pub fn with_default_policy(ctx: TaskContext) -> Self {
        Self::new(ctx, Arc::new(DefaultStalenessPolicy))
    }
}

#[async_trait]
impl Task for StaleEntryFinalizerTask {
    fn name(&self) -> &'static str {
        "stale_entry_finalizer"
    }

    #[instrument(skip(self))]
    async fn run(&mut self) {
        let now = self.ctx.now();
        let rules: Vec<(PrefetchItemState, StaleRule)> = PrefetchItemState::ALL
            .into_iter()
            .filter(|state| !state.is_terminal())
            .filter_map(|state| self.policy.rule_for(state).map(|rule| (state, rule)))
            .collect();
        let skew_limit = to_micros(now + self.policy.max_clock_backward_skew());

        let result = self
            .ctx
            .store
            .execute(move |conn| {
                Box::pin(async move {
                    let mut tx = conn.begin().await?;
                    let mut stale = 0_u64;
                    for (state, rule) in &rules {
                        let updated = sqlx::query(&format!(
                            "UPDATE {ITEMS_TABLE} SET state = ?, error_code = ? \
                             WHERE state = ? AND freshness_time < ?"
                        ))
                        .bind(PrefetchItemState::Finished.to_db())
                        .bind(rule.error_code.to_db())
                        .bind(state.to_db())
                        .bind(to_micros(now - rule.max_age))
                        .execute(&mut *tx)
                        .await?;
                        if updated.rows_affected() > 0 {
                            debug!(%state, items = updated.rows_affected(), "stale items finalized");
                        }
                        stale += updated.rows_affected();
                    }

                    let skewed = sqlx::query(&format!(
                        "UPDATE {ITEMS_TABLE} SET state = ?, error_code = ? \
                         WHERE state NOT IN (?, ?) AND freshness_time > ?"
                    ))
                    .bind(PrefetchItemState::Finished.to_db())
                    .bind(PrefetchItemErrorCode::MaximumClockBackwardSkewExceeded.to_db())
                    .bind(PrefetchItemState::Finished.to_db())
                    .bind(PrefetchItemState::Zombie.to_db())
                    .bind(skew_limit)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                    tx.commit().await?;
                    Ok((stale, skewed))
                })
            })
            .await;

        match result {
            Ok((0, 0)) => {}
            Ok((stale, skewed)) => warn!(stale, skewed, "expired items finalized"),
            Err(err) => log_store_failure(self.name(), &err),
        }
    }
}
