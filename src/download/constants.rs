//! Constants for the HTTP collaborators.

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default archive read timeout (5 minutes).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Extension of a completed archive.
pub const ARCHIVE_EXTENSION: &str = "mhtml";

/// Extension of an archive still being written.
pub const PARTIAL_EXTENSION: &str = "mhtml.part";
