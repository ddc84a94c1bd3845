//! Pipeline state and terminal error-code enumerations.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a prefetch item in the pipeline.
///
/// The numeric values are persisted and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchItemState {
    /// Candidate URL accepted, nothing requested yet.
    NewRequest,
    /// Bundle generation requested from the service.
    SentGeneratePageBundle,
    /// Service accepted the request; waiting for the completion push.
    AwaitingGcm,
    /// Completion push received; operation not polled yet.
    ReceivedGcm,
    /// Operation poll in flight.
    SentGetOperation,
    /// Bundle rendered; archive ready to download.
    ReceivedBundle,
    /// Archive download in flight.
    Downloading,
    /// Archive on disk, waiting for import.
    Downloaded,
    /// Import in flight.
    Importing,
    /// Terminal; `error_code` tells how it ended.
    Finished,
    /// Terminal and already reported to metrics.
    Zombie,
}

impl PrefetchItemState {
    /// Every state in pipeline order.
    pub const ALL: [Self; 11] = [
        Self::NewRequest,
        Self::SentGeneratePageBundle,
        Self::AwaitingGcm,
        Self::ReceivedGcm,
        Self::SentGetOperation,
        Self::ReceivedBundle,
        Self::Downloading,
        Self::Downloaded,
        Self::Importing,
        Self::Finished,
        Self::Zombie,
    ];

    /// Returns the persisted numeric value.
    #[must_use]
    pub fn to_db(self) -> i64 {
        match self {
            Self::NewRequest => 0,
            Self::SentGeneratePageBundle => 10,
            Self::AwaitingGcm => 20,
            Self::ReceivedGcm => 30,
            Self::SentGetOperation => 40,
            Self::ReceivedBundle => 50,
            Self::Downloading => 60,
            Self::Downloaded => 70,
            Self::Importing => 80,
            Self::Finished => 90,
            Self::Zombie => 100,
        }
    }

    /// Parses a persisted numeric value.
    #[must_use]
    pub fn from_db(value: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.to_db() == value)
    }

    /// Returns the stable label used in logs and CLI output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewRequest => "new_request",
            Self::SentGeneratePageBundle => "sent_generate_page_bundle",
            Self::AwaitingGcm => "awaiting_gcm",
            Self::ReceivedGcm => "received_gcm",
            Self::SentGetOperation => "sent_get_operation",
            Self::ReceivedBundle => "received_bundle",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Importing => "importing",
            Self::Finished => "finished",
            Self::Zombie => "zombie",
        }
    }

    /// True for FINISHED and ZOMBIE.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Zombie)
    }
}

impl fmt::Display for PrefetchItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PrefetchItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("invalid prefetch item state: {s}"))
    }
}

/// Diagnostic outcome of a FINISHED item.
///
/// Only meaningful while the item is FINISHED or ZOMBIE. Persisted values
/// must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchItemErrorCode {
    /// The page was imported.
    #[default]
    Success,
    /// The archive download failed with a non-retryable error.
    DownloadError,
    /// The importer rejected the archive.
    ImportError,
    /// The service could not render the page.
    ArchivingFailed,
    /// The rendered page exceeded the service's size limit.
    ArchivingLimitExceeded,
    /// Too long in NEW_REQUEST.
    StaleAtNewRequest,
    /// Too long in AWAITING_GCM.
    StaleAtAwaitingGcm,
    /// Too long in RECEIVED_GCM.
    StaleAtReceivedGcm,
    /// Too long in RECEIVED_BUNDLE.
    StaleAtReceivedBundle,
    /// Too long in DOWNLOADING.
    StaleAtDownloading,
    /// Operation polls exhausted.
    GetOperationMaxAttemptsReached,
    /// Bundle generation requests exhausted.
    GeneratePageBundleRequestMaxAttemptsReached,
    /// Download attempts exhausted.
    DownloadMaxAttemptsReached,
    /// Freshness lies too far in the future (clock moved backwards).
    MaximumClockBackwardSkewExceeded,
    /// The import was interrupted and is no longer running.
    ImportAborted,
    /// The requesting client withdrew the URL.
    SuggestionInvalidated,
    /// The downloaded archive disappeared before import.
    ArchiveFileMissing,
}

impl PrefetchItemErrorCode {
    /// Every error code.
    pub const ALL: [Self; 17] = [
        Self::Success,
        Self::DownloadError,
        Self::ImportError,
        Self::ArchivingFailed,
        Self::ArchivingLimitExceeded,
        Self::StaleAtNewRequest,
        Self::StaleAtAwaitingGcm,
        Self::StaleAtReceivedGcm,
        Self::StaleAtReceivedBundle,
        Self::StaleAtDownloading,
        Self::GetOperationMaxAttemptsReached,
        Self::GeneratePageBundleRequestMaxAttemptsReached,
        Self::DownloadMaxAttemptsReached,
        Self::MaximumClockBackwardSkewExceeded,
        Self::ImportAborted,
        Self::SuggestionInvalidated,
        Self::ArchiveFileMissing,
    ];

    /// Returns the persisted numeric value.
    #[must_use]
    pub fn to_db(self) -> i64 {
        match self {
            Self::Success => 0,
            Self::DownloadError => 200,
            Self::ImportError => 300,
            Self::ArchivingFailed => 400,
            Self::ArchivingLimitExceeded => 500,
            Self::StaleAtNewRequest => 600,
            Self::StaleAtAwaitingGcm => 700,
            Self::StaleAtReceivedGcm => 800,
            Self::StaleAtReceivedBundle => 900,
            Self::StaleAtDownloading => 1000,
            Self::GetOperationMaxAttemptsReached => 1200,
            Self::GeneratePageBundleRequestMaxAttemptsReached => 1300,
            Self::DownloadMaxAttemptsReached => 1400,
            Self::MaximumClockBackwardSkewExceeded => 1500,
            Self::ImportAborted => 1600,
            Self::SuggestionInvalidated => 1700,
            Self::ArchiveFileMissing => 1800,
        }
    }

    /// Parses a persisted numeric value.
    #[must_use]
    pub fn from_db(value: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.to_db() == value)
    }

    /// Returns the stable label used in logs and CLI output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::DownloadError => "download_error",
            Self::ImportError => "import_error",
            Self::ArchivingFailed => "archiving_failed",
            Self::ArchivingLimitExceeded => "archiving_limit_exceeded",
            Self::StaleAtNewRequest => "stale_at_new_request",
            Self::StaleAtAwaitingGcm => "stale_at_awaiting_gcm",
            Self::StaleAtReceivedGcm => "stale_at_received_gcm",
            Self::StaleAtReceivedBundle => "stale_at_received_bundle",
            Self::StaleAtDownloading => "stale_at_downloading",
            Self::GetOperationMaxAttemptsReached => "get_operation_max_attempts_reached",
            Self::GeneratePageBundleRequestMaxAttemptsReached => {
                "generate_page_bundle_request_max_attempts_reached"
            }
            Self::DownloadMaxAttemptsReached => "download_max_attempts_reached",
            Self::MaximumClockBackwardSkewExceeded => "maximum_clock_backward_skew_exceeded",
            Self::ImportAborted => "import_aborted",
            Self::SuggestionInvalidated => "suggestion_invalidated",
            Self::ArchiveFileMissing => "archive_file_missing",
        }
    }
}

impl fmt::Display for PrefetchItemErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
