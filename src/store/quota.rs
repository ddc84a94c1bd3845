//! Downloader quota tracker.
//!
//! A single persisted row behaves as a token bucket that refills
//! continuously at `daily_cap` bytes per day. The refill is computed on read
//! and never written back; only [`DownloaderQuota::set_available_quota`]
//! writes.
//!
//! Every value that leaves or enters the tracker passes through
//! [`DownloaderQuota::clamp`], so callers never see a quota outside
//! `[0, daily_cap]`.

use sqlx::{Row, SqliteConnection};
use time::OffsetDateTime;
use tracing::{debug, instrument};

use super::StoreError;
use super::schema::QUOTA_TABLE;
use crate::item::{from_micros, to_micros};

/// Default daily download budget (20 MiB).
pub const DEFAULT_DAILY_QUOTA_BYTES: i64 = 20 * 1024 * 1024;

const MICROS_PER_DAY: i128 = 86_400_000_000;

/// Quota math bound to one daily cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloaderQuota {
    daily_cap: i64,
}

impl Default for DownloaderQuota {
    fn default() -> Self {
        Self::new(DEFAULT_DAILY_QUOTA_BYTES)
    }
}

impl DownloaderQuota {
    #[must_use]
    pub fn new(daily_cap: i64) -> Self {
        Self {
            daily_cap: daily_cap.max(0),
        }
    }

    #[must_use]
    pub fn daily_cap(&self) -> i64 {
        self.daily_cap
    }

    /// Clamps a quota value to `[0, daily_cap]`.
    #[must_use]
    pub fn clamp(&self, quota: i64) -> i64 {
        quota.clamp(0, self.daily_cap)
    }

    /// Replenishes `stored` for the time elapsed since `updated`.
    ///
    /// A clock that moved backwards replenishes nothing.
    #[must_use]
    pub fn replenish(&self, stored: i64, updated: OffsetDateTime, now: OffsetDateTime) -> i64 {
        let elapsed_us = (now - updated).whole_microseconds().max(0);
        let refill = elapsed_us * i128::from(self.daily_cap) / MICROS_PER_DAY;
        let total = i128::from(stored) + refill;
        self.clamp(i64::try_from(total).unwrap_or(i64::MAX))
    }

    /// Returns the quota available at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the read fails, or
    /// [`StoreError::InvalidData`] for an unreadable timestamp.
    #[instrument(skip(self, conn), fields(daily_cap = self.daily_cap))]
    pub async fn get_available_quota(
        &self,
        conn: &mut SqliteConnection,
        now: OffsetDateTime,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT update_time, available_quota FROM {QUOTA_TABLE} WHERE quota_id = 1"
        ))
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Ok(self.daily_cap);
        };

        let update_micros: i64 = row.try_get("update_time")?;
        let stored: i64 = row.try_get("available_quota")?;
        let updated = from_micros(update_micros).map_err(|_| StoreError::InvalidData {
            column: "update_time".to_string(),
            value: update_micros.to_string(),
        })?;

        let available = self.replenish(stored, updated, now);
        debug!(stored, available, "quota read");
        Ok(available)
    }

    /// Persists `quota` (clamped) as of `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    #[instrument(skip(self, conn), fields(daily_cap = self.daily_cap))]
    pub async fn set_available_quota(
        &self,
        conn: &mut SqliteConnection,
        now: OffsetDateTime,
        quota: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {QUOTA_TABLE} (quota_id, update_time, available_quota) \
             VALUES (1, ?, ?)"
        ))
        .bind(to_micros(now))
        .bind(self.clamp(quota))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;

    const CAP: i64 = 1_000_000;

    fn t0() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    #[test]
    fn test_replenish_half_day_gives_half_cap() {
        let quota = DownloaderQuota::new(CAP);
        assert_eq!(quota.replenish(0, t0(), t0() + Duration::hours(12)), CAP / 2);
    }

    #[test]
    fn test_replenish_caps_at_daily_cap() {
        let quota = DownloaderQuota::new(CAP);
        assert_eq!(quota.replenish(CAP - 10, t0(), t0() + Duration::days(3)), CAP);
    }

    #[test]
    fn test_replenish_ignores_backward_clock() {
        let quota = DownloaderQuota::new(CAP);
        assert_eq!(quota.replenish(100, t0(), t0() - Duration::hours(5)), 100);
    }

    #[test]
    fn test_clamp_bounds() {
        let quota = DownloaderQuota::new(CAP);
        assert_eq!(quota.clamp(-5), 0);
        assert_eq!(quota.clamp(CAP * 2), CAP);
        assert_eq!(quota.clamp(42), 42);
    }
}
