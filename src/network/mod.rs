//! Bundle-generation service capability.
//!
//! # Overview
//!
//! - [`RequestFactory`] - starts GeneratePageBundle / GetOperation RPCs and
//!   reports which are still in flight
//! - [`RenderPageInfo`] - per-page result the service returns
//! - [`PrefetchRequestStatus`] - RPC outcome, including the service's
//!   request to back off or suspend
//! - [`HttpRequestFactory`] - JSON-over-HTTP implementation
//!
//! RPC results arrive as
//! [`PipelineEvent::GeneratePageBundleFinished`](crate::events::PipelineEvent)
//! and [`PipelineEvent::GetOperationFinished`](crate::events::PipelineEvent).

mod http;

pub use http::{HttpRequestFactory, HttpRequestFactoryConfig, RequestError};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of one RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchRequestStatus {
    /// The service answered.
    Success,
    /// Failed; try again at the next opportunity.
    RetryWithoutBackoff,
    /// Failed; try again after backing off.
    RetryWithBackoff,
    /// The service asked clients to stop sending requests for a while.
    Suspend,
}

impl PrefetchRequestStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryWithoutBackoff => "retry_without_backoff",
            Self::RetryWithBackoff => "retry_with_backoff",
            Self::Suspend => "suspend",
        }
    }
}

impl fmt::Display for PrefetchRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Render state of one page inside a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenderStatus {
    /// The archive is ready.
    Rendered,
    /// Still rendering; a push arrives when done.
    Pending,
    /// Rendering failed.
    Failed,
    /// The page exceeded the service's size limit.
    ExceededLimit,
}

/// One page of a bundle response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderPageInfo {
    /// URL as requested.
    pub url: String,
    /// URL after redirects, when different.
    #[serde(default)]
    pub redirect_url: String,
    /// Render state.
    pub status: RenderStatus,
    /// Archive identity, when rendered.
    #[serde(default)]
    pub body_name: String,
    /// Archive size in bytes, `-1` when unknown.
    #[serde(default = "unknown_length")]
    pub body_length: i64,
}

fn unknown_length() -> i64 {
    -1
}

impl RenderPageInfo {
    /// A page that is still rendering.
    #[must_use]
    pub fn pending(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            redirect_url: String::new(),
            status: RenderStatus::Pending,
            body_name: String::new(),
            body_length: -1,
        }
    }

    /// A rendered page with its archive.
    #[must_use]
    pub fn rendered(url: impl Into<String>, body_name: impl Into<String>, body_length: i64) -> Self {
        Self {
            url: url.into(),
            redirect_url: String::new(),
            status: RenderStatus::Rendered,
            body_name: body_name.into(),
            body_length,
        }
    }

    /// A page that ended with `status` and no archive.
    #[must_use]
    pub fn with_status(url: impl Into<String>, status: RenderStatus) -> Self {
        Self {
            status,
            ..Self::pending(url)
        }
    }
}

/// Bundle-generation RPC capability.
///
/// Calls return immediately; results arrive later as events.
pub trait RequestFactory: Send + Sync {
    /// Asks the service to render and bundle `urls`.
    fn make_generate_page_bundle_request(&self, urls: Vec<String>, gcm_token: String);

    /// Polls the state of a bundle-generation operation.
    fn make_get_operation_request(&self, operation_name: String);

    /// URLs of GeneratePageBundle requests still in flight.
    fn outstanding_generate_urls(&self) -> Vec<String>;

    /// Operation names of GetOperation requests still in flight.
    fn outstanding_operation_names(&self) -> Vec<String>;
}
