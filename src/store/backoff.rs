//! Bounded exponential backoff for store initialization.
//!
//! Delays follow `min(base_delay * multiplier^(attempt-1), max_delay) + jitter`.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Default open attempts before the store gives up.
pub const DEFAULT_OPEN_ATTEMPTS: u32 = 3;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const MAX_JITTER: Duration = Duration::from_millis(100);

/// Retry schedule for opening the database.
#[derive(Debug, Clone)]
pub struct OpenBackoff {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    jitter: bool,
}

impl Default for OpenBackoff {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_OPEN_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: true,
        }
    }
}

impl OpenBackoff {
    /// Uses defaults with a custom attempt count (at least one).
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Disables delays entirely; used by tests exercising failure paths.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after `attempt` (1-indexed) failed, or `None` when the
    /// attempts are exhausted.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "open attempts exhausted");
            return None;
        }

        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let capped = {
            let base_ms = self.base_delay.as_millis() as f64;
            let exponent = f64::from(attempt.saturating_sub(1));
            let delay_ms = base_ms * self.backoff_multiplier.powf(exponent);
            Duration::from_millis(delay_ms.min(self.max_delay.as_millis() as f64) as u64)
        };

        Some(capped + self.jitter())
    }

    fn jitter(&self) -> Duration {
        if !self.jitter {
            return Duration::ZERO;
        }
        #[allow(clippy::cast_possible_truncation)]
        let max_ms = MAX_JITTER.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule_grows_and_stops() {
        let backoff = OpenBackoff::default();
        let first = backoff.delay_after(1).unwrap_or_default();
        let second = backoff.delay_after(2).unwrap_or_default();
        assert!(first >= DEFAULT_BASE_DELAY);
        assert!(first <= DEFAULT_BASE_DELAY + MAX_JITTER);
        assert!(second >= DEFAULT_BASE_DELAY * 2);
        assert_eq!(backoff.delay_after(3), None);
    }

    #[test]
    fn test_delay_is_capped() {
        let backoff = OpenBackoff {
            max_attempts: 20,
            jitter: false,
            ..OpenBackoff::default()
        };
        assert_eq!(backoff.delay_after(15), Some(DEFAULT_MAX_DELAY));
    }

    #[test]
    fn test_immediate_has_no_delay() {
        let backoff = OpenBackoff::immediate(2);
        assert_eq!(backoff.delay_after(1), Some(Duration::ZERO));
        assert_eq!(backoff.delay_after(2), None);
    }

    #[test]
    fn test_max_attempts_minimum_is_one() {
        assert_eq!(OpenBackoff::with_max_attempts(0).max_attempts(), 1);
    }
}
