//! Failure classification for downloads and service RPCs.
//!
//! A failed download is retryable when its [`FailureType`] is transient or
//! rate-limited; the item then returns to RECEIVED_BUNDLE until its attempt
//! ceiling is reached. The same HTTP classification maps RPC failures onto
//! request statuses.

use tracing::instrument;

use super::DownloadError;

/// How a failed download or RPC should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Timeouts, 5xx answers, dropped connections.
    Transient,
    /// Missing bodies, malformed requests, TLS failures.
    Permanent,
    /// 401/403: the service refuses this client.
    NeedsAuth,
    /// 429.
    RateLimited,
}

impl FailureType {
    /// True when trying again later may succeed.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }
}

/// Classifies a failed archive download.
///
/// TLS failures are permanent; every other transport, timeout, write or
/// size failure is worth another attempt.
#[instrument]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::Rejected { status, .. } => classify_http_status(*status),
        DownloadError::Transport { source, .. } if is_tls_error(source) => FailureType::Permanent,
        DownloadError::Transport { .. }
        | DownloadError::TimedOut { .. }
        | DownloadError::Write { .. }
        | DownloadError::SizeMismatch { .. } => FailureType::Transient,
        DownloadError::BadUrl { .. } => FailureType::Permanent,
    }
}

/// Maps an HTTP status onto a failure type.
#[must_use]
pub fn classify_http_status(status: u16) -> FailureType {
    match status {
        401 | 403 => FailureType::NeedsAuth,
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        500..=599 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let text = error.to_string().to_lowercase();
    ["certificate", "tls", "ssl", "handshake"]
        .iter()
        .any(|needle| text.contains(needle))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    // ==================== HTTP Classification Tests ====================

    #[test]
    fn test_media_server_errors_are_transient() {
        for status in [500, 502, 503, 504, 599, 408] {
            assert_eq!(classify_http_status(status), FailureType::Transient, "{status}");
        }
    }

    #[test]
    fn test_missing_or_malformed_body_is_permanent() {
        for status in [302, 400, 404, 410, 418] {
            assert_eq!(classify_http_status(status), FailureType::Permanent, "{status}");
        }
    }

    #[test]
    fn test_auth_and_throttling_statuses() {
        assert_eq!(classify_http_status(401), FailureType::NeedsAuth);
        assert_eq!(classify_http_status(403), FailureType::NeedsAuth);
        assert_eq!(classify_http_status(429), FailureType::RateLimited);
    }

    // ==================== Download Failure Tests ====================

    #[test]
    fn test_download_failures_retry_unless_permanent() {
        let retryable = |err: DownloadError| classify_error(&err).is_retryable();
        assert!(retryable(DownloadError::timed_out("u")));
        assert!(retryable(DownloadError::size_mismatch(PathBuf::from("g.mhtml"), 2, 1)));
        assert!(retryable(DownloadError::rejected("u", 503)));
        assert!(!retryable(DownloadError::bad_url("u")));
        assert!(!retryable(DownloadError::rejected("u", 404)));
    }

    #[test]
    fn test_retryable_failure_types() {
        assert!(FailureType::Transient.is_retryable());
        assert!(FailureType::RateLimited.is_retryable());
        assert!(!FailureType::Permanent.is_retryable());
        assert!(!FailureType::NeedsAuth.is_retryable());
    }
}
