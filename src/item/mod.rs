//! The persisted prefetch item and its enumerations.
//!
//! # Overview
//!
//! - [`PrefetchItem`] - one row per candidate URL
//! - [`ClientId`] - (namespace, id) of the feature that suggested the URL
//! - [`PrefetchItemState`] - position in the pipeline
//! - [`PrefetchItemErrorCode`] - diagnostic outcome once FINISHED
//!
//! Timestamps are stored as signed microseconds since the Unix epoch.

mod state;

pub use state::{PrefetchItemErrorCode, PrefetchItemState};

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use time::OffsetDateTime;

/// Attempts allowed per stage before the item is finalized.
pub const MAX_ATTEMPTS: i64 = 3;

/// Identifies the client feature that suggested a URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId {
    /// Feature namespace, e.g. `suggested_articles`.
    pub name_space: String,
    /// Opaque id within the namespace.
    pub id: String,
}

impl ClientId {
    #[must_use]
    pub fn new(name_space: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name_space: name_space.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name_space, self.id)
    }
}

/// One candidate URL's progress through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchItem {
    /// Immutable primary key.
    pub offline_id: i64,
    /// Current pipeline state.
    pub state: PrefetchItemState,
    /// Diagnostic code; only meaningful when FINISHED or ZOMBIE.
    pub error_code: PrefetchItemErrorCode,
    /// Bundle generation requests issued.
    pub generate_bundle_attempts: i64,
    /// Operation polls issued.
    pub get_operation_attempts: i64,
    /// Downloads started.
    pub download_initiation_attempts: i64,
    /// Expected archive size reported by the service, `-1` when unknown.
    pub archive_body_length: i64,
    /// Set once at intake.
    pub creation_time: OffsetDateTime,
    /// Reset at stage boundaries; staleness is measured from here.
    pub freshness_time: OffsetDateTime,
    /// Downloaded archive size, `-1` until downloaded.
    pub file_size: i64,
    /// Correlates the item with one push/download cycle.
    pub guid: String,
    /// Suggesting feature.
    pub client_id: ClientId,
    /// URL as suggested.
    pub requested_url: String,
    /// URL after redirects, once the bundle is rendered.
    pub final_archived_url: String,
    /// Remote bundle-generation operation.
    pub operation_name: String,
    /// Identity of the rendered archive on the service.
    pub archive_body_name: String,
    /// Page title.
    pub title: String,
    /// Local archive path once downloaded.
    pub file_path: String,
    /// Origin that requested the prefetch, if any.
    pub request_origin: String,
    /// Id assigned by the download engine.
    pub system_download_id: Option<i64>,
    /// When the archive was found missing on disk.
    pub file_missing_time: Option<OffsetDateTime>,
    /// Content digest computed on import.
    pub digest: String,
    /// Upgrade attempts performed on the imported page.
    pub upgrade_attempt: i64,
}

impl PrefetchItem {
    /// Builds a fresh NEW_REQUEST item.
    #[must_use]
    pub fn new_request(
        offline_id: i64,
        client_id: ClientId,
        requested_url: impl Into<String>,
        title: impl Into<String>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            offline_id,
            state: PrefetchItemState::NewRequest,
            error_code: PrefetchItemErrorCode::Success,
            generate_bundle_attempts: 0,
            get_operation_attempts: 0,
            download_initiation_attempts: 0,
            archive_body_length: -1,
            creation_time: now,
            freshness_time: now,
            file_size: -1,
            guid: String::new(),
            client_id,
            requested_url: requested_url.into(),
            final_archived_url: String::new(),
            operation_name: String::new(),
            archive_body_name: String::new(),
            title: title.into(),
            file_path: String::new(),
            request_origin: String::new(),
            system_download_id: None,
            file_missing_time: None,
            digest: String::new(),
            upgrade_attempt: 0,
        }
    }

    /// Returns the URL the archive was captured from.
    #[must_use]
    pub fn effective_url(&self) -> &str {
        if self.final_archived_url.is_empty() {
            &self.requested_url
        } else {
            &self.final_archived_url
        }
    }
}

impl fmt::Display for PrefetchItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PrefetchItem {{ offline_id: {}, url: {}, state: {} }}",
            self.offline_id, self.requested_url, self.state
        )
    }
}

/// Converts a timestamp to stored microseconds.
#[must_use]
pub fn to_micros(time: OffsetDateTime) -> i64 {
    i64::try_from(time.unix_timestamp_nanos() / 1_000).unwrap_or(i64::MAX)
}

/// Converts stored microseconds back to a timestamp.
///
/// # Errors
///
/// Returns an error when the value is outside the representable range.
pub fn from_micros(micros: i64) -> Result<OffsetDateTime, time::error::ComponentRange> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
}

fn decode_error(column: &str, message: String) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: message.into(),
    }
}

fn time_column(row: &SqliteRow, column: &str) -> Result<OffsetDateTime, sqlx::Error> {
    let micros: i64 = row.try_get(column)?;
    from_micros(micros).map_err(|e| decode_error(column, e.to_string()))
}

impl<'r> FromRow<'r, SqliteRow> for PrefetchItem {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let state_value: i64 = row.try_get("state")?;
        let state = PrefetchItemState::from_db(state_value)
            .ok_or_else(|| decode_error("state", format!("unknown state {state_value}")))?;
        let code_value: i64 = row.try_get("error_code")?;
        let error_code = PrefetchItemErrorCode::from_db(code_value)
            .ok_or_else(|| decode_error("error_code", format!("unknown error code {code_value}")))?;
        let file_missing_time = row
            .try_get::<Option<i64>, _>("file_missing_time")?
            .map(from_micros)
            .transpose()
            .map_err(|e| decode_error("file_missing_time", e.to_string()))?;

        Ok(Self {
            offline_id: row.try_get("offline_id")?,
            state,
            error_code,
            generate_bundle_attempts: row.try_get("generate_bundle_attempts")?,
            get_operation_attempts: row.try_get("get_operation_attempts")?,
            download_initiation_attempts: row.try_get("download_initiation_attempts")?,
            archive_body_length: row.try_get("archive_body_length")?,
            creation_time: time_column(row, "creation_time")?,
            freshness_time: time_column(row, "freshness_time")?,
            file_size: row.try_get("file_size")?,
            guid: row.try_get("guid")?,
            client_id: ClientId {
                name_space: row.try_get("client_namespace")?,
                id: row.try_get("client_id")?,
            },
            requested_url: row.try_get("requested_url")?,
            final_archived_url: row.try_get("final_archived_url")?,
            operation_name: row.try_get("operation_name")?,
            archive_body_name: row.try_get("archive_body_name")?,
            title: row.try_get("title")?,
            file_path: row.try_get("file_path")?,
            request_origin: row.try_get("request_origin")?,
            system_download_id: row.try_get("system_download_id")?,
            file_missing_time,
            digest: row.try_get("digest")?,
            upgrade_attempt: row.try_get("upgrade_attempt")?,
        })
    }
}
