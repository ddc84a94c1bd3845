//! Error types for store operations.

use std::fmt;

use thiserror::Error;

/// Structured classification for database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// `SQLite` returned busy/locked.
    BusyOrLocked,
    /// Constraint failure (unique/foreign-key/check/not-null).
    ConstraintViolation,
    /// Expected row was not found.
    RowNotFound,
    /// Filesystem or transport IO failure.
    Io,
    /// SQL protocol/driver error.
    Protocol,
    /// Unclassified database failure.
    Other,
}

impl StoreErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => Self::RowNotFound,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Protocol(_) => Self::Protocol,
            sqlx::Error::Database(database_error) => {
                classify_database_error(database_error.as_ref())
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::RowNotFound => "row_not_found",
            Self::Io => "io",
            Self::Protocol => "protocol",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

fn classify_database_error(
    database_error: &(dyn sqlx::error::DatabaseError + 'static),
) -> StoreErrorKind {
    let code = database_error.code();
    if matches!(
        code.as_deref(),
        Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")
    ) {
        return StoreErrorKind::BusyOrLocked;
    }

    if database_error.is_unique_violation()
        || database_error.is_foreign_key_violation()
        || database_error.is_check_violation()
        || code
            .as_deref()
            .is_some_and(|value| value.starts_with("SQLITE_CONSTRAINT") || value == "1555" || value == "2067")
    {
        return StoreErrorKind::ConstraintViolation;
    }

    let message = database_error.message().to_ascii_lowercase();
    if message.contains("database is locked") || message.contains("database table is locked") {
        return StoreErrorKind::BusyOrLocked;
    }

    StoreErrorKind::Other
}

/// Errors produced by the persistent store.
///
/// Cloneable so a single failed initialization can answer every queued
/// command.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A statement, transaction begin or commit failed.
    #[error("database error ({kind}): {message}")]
    Database {
        /// Typed classification.
        kind: StoreErrorKind,
        /// Human-readable database error text.
        message: String,
    },

    /// The store failed to initialize and accepts no more work.
    #[error(
        "prefetch store unavailable: {reason}\n  Suggestion: Check that the database path is writable and not used by a newer version"
    )]
    Unavailable {
        /// Why initialization failed.
        reason: String,
    },

    /// The file was written by a newer, incompatible version.
    #[error(
        "incompatible schema: database requires version {found}, this build supports up to {supported}"
    )]
    IncompatibleSchema {
        /// Compatible version recorded on disk.
        found: i64,
        /// Current version of this build.
        supported: i64,
    },

    /// A stored value could not be interpreted.
    #[error("invalid stored value in column '{column}': {value}")]
    InvalidData {
        /// Offending column.
        column: String,
        /// Offending value.
        value: String,
    },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: StoreErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl StoreError {
    /// Creates an `Unavailable` error.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Returns the typed database error kind, when this is a database error.
    #[must_use]
    pub fn database_kind(&self) -> Option<StoreErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            Self::Unavailable { .. } | Self::IncompatibleSchema { .. } | Self::InvalidData { .. } => {
                None
            }
        }
    }

    /// Returns true when this error is a database busy/locked condition.
    #[must_use]
    pub fn is_busy_or_locked(&self) -> bool {
        self.database_kind() == Some(StoreErrorKind::BusyOrLocked)
    }
}
