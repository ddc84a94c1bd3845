//! JSON-over-HTTP [`RequestFactory`].
//!
//! - `POST {service_url}/v1/GeneratePageBundle` with
//!   `{"pages":[{"url":..}],"gcmRegistrationId":..}`
//! - `GET {service_url}/v1/{operation_name}`
//!
//! Both answer with an operation document:
//! `{"name":..,"done":bool,"pages":[RenderPageInfo..]}`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use super::{PrefetchRequestStatus, RenderPageInfo, RequestFactory};
use crate::download::{FailureType, classify_http_status};
use crate::download::constants::CONNECT_TIMEOUT_SECS;
use crate::events::{EventSender, PipelineEvent};
use crate::user_agent;

/// Errors from one RPC.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Network-level failure.
    #[error("network error calling {url}: {source}")]
    Network {
        /// Endpoint.
        url: String,
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// The RPC did not finish in time.
    #[error("timeout calling {url}")]
    Timeout {
        /// Endpoint.
        url: String,
    },

    /// The service answered with an error status.
    #[error("HTTP {status} calling {url}")]
    HttpStatus {
        /// Endpoint.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// The answer was not a valid operation document.
    #[error("malformed response from {url}: {source}")]
    Decode {
        /// Endpoint.
        url: String,
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// The endpoint URL could not be built.
    #[error("invalid service URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },
}

impl RequestError {
    /// Maps the failure onto the status reported to the pipeline.
    #[must_use]
    pub fn request_status(&self) -> PrefetchRequestStatus {
        match self {
            Self::HttpStatus { status, .. } => match classify_http_status(*status) {
                FailureType::Transient | FailureType::RateLimited => {
                    PrefetchRequestStatus::RetryWithBackoff
                }
                FailureType::NeedsAuth => PrefetchRequestStatus::Suspend,
                FailureType::Permanent => PrefetchRequestStatus::RetryWithoutBackoff,
            },
            Self::Decode { .. } => PrefetchRequestStatus::RetryWithBackoff,
            Self::Network { .. } | Self::Timeout { .. } | Self::InvalidUrl { .. } => {
                PrefetchRequestStatus::RetryWithoutBackoff
            }
        }
    }
}

/// Settings for [`HttpRequestFactory`].
#[derive(Debug, Clone)]
pub struct HttpRequestFactoryConfig {
    /// Service base URL.
    pub service_url: String,
    /// Whole-request timeout.
    pub request_timeout: Duration,
}

impl HttpRequestFactoryConfig {
    #[must_use]
    pub fn new(service_url: impl Into<String>) -> Self {
        Self {
            service_url: service_url.into(),
            request_timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeneratePageBundleBody<'a> {
    pages: Vec<PageParameters<'a>>,
    gcm_registration_id: &'a str,
}

#[derive(Debug, Serialize)]
struct PageParameters<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
struct OperationDocument {
    #[serde(default)]
    name: String,
    #[serde(default)]
    pages: Vec<RenderPageInfo>,
}

/// Issues RPCs on spawned tokio tasks and reports results as events.
#[derive(Debug, Clone)]
pub struct HttpRequestFactory {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    client: Client,
    service_url: String,
    events: EventSender,
    next_request_id: AtomicU64,
    generate_requests: DashMap<u64, Vec<String>>,
    operations: DashSet<String>,
}

impl HttpRequestFactory {
    /// Builds the HTTP client.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error when the TLS backend cannot be
    /// initialized.
    pub fn new(config: HttpRequestFactoryConfig, events: EventSender) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(config.request_timeout)
            .gzip(true)
            .user_agent(user_agent::default_user_agent())
            .build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                service_url: config.service_url.trim_end_matches('/').to_string(),
                events,
                next_request_id: AtomicU64::new(1),
                generate_requests: DashMap::new(),
                operations: DashSet::new(),
            }),
        })
    }
}

impl RequestFactory for HttpRequestFactory {
    #[instrument(skip(self, urls, gcm_token), fields(urls = urls.len()))]
    fn make_generate_page_bundle_request(&self, urls: Vec<String>, gcm_token: String) {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        self.inner.generate_requests.insert(request_id, urls.clone());

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let event = match generate_page_bundle(&inner, &urls, &gcm_token).await {
                Ok(document) => PipelineEvent::GeneratePageBundleFinished {
                    status: PrefetchRequestStatus::Success,
                    operation_name: document.name,
                    pages: document.pages,
                },
                Err(err) => {
                    warn!(error = %err, "GeneratePageBundle failed");
                    PipelineEvent::GeneratePageBundleFinished {
                        status: err.request_status(),
                        operation_name: String::new(),
                        pages: Vec::new(),
                    }
                }
            };
            if inner.events.send(event).is_err() {
                debug!("event receiver closed");
            }
            inner.generate_requests.remove(&request_id);
        });
    }

    #[instrument(skip(self))]
    fn make_get_operation_request(&self, operation_name: String) {
        if !self.inner.operations.insert(operation_name.clone()) {
            debug!("operation already being polled");
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let event = match get_operation(&inner, &operation_name).await {
                Ok(document) => PipelineEvent::GetOperationFinished {
                    status: PrefetchRequestStatus::Success,
                    operation_name: operation_name.clone(),
                    pages: document.pages,
                },
                Err(err) => {
                    warn!(%operation_name, error = %err, "GetOperation failed");
                    PipelineEvent::GetOperationFinished {
                        status: err.request_status(),
                        operation_name: operation_name.clone(),
                        pages: Vec::new(),
                    }
                }
            };
            if inner.events.send(event).is_err() {
                debug!("event receiver closed");
            }
            inner.operations.remove(&operation_name);
        });
    }

    fn outstanding_generate_urls(&self) -> Vec<String> {
        self.inner
            .generate_requests
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect()
    }

    fn outstanding_operation_names(&self) -> Vec<String> {
        self.inner.operations.iter().map(|name| name.key().clone()).collect()
    }
}

fn endpoint(inner: &Inner, path: &str) -> Result<Url, RequestError> {
    let url = format!("{}/v1/{path}", inner.service_url);
    Url::parse(&url).map_err(|_| RequestError::InvalidUrl { url })
}

async fn generate_page_bundle(
    inner: &Inner,
    urls: &[String],
    gcm_token: &str,
) -> Result<OperationDocument, RequestError> {
    let url = endpoint(inner, "GeneratePageBundle")?;
    let body = GeneratePageBundleBody {
        pages: urls.iter().map(|url| PageParameters { url }).collect(),
        gcm_registration_id: gcm_token,
    };
    let response = inner.client.post(url.clone()).json(&body).send().await;
    decode(url, response).await
}

async fn get_operation(inner: &Inner, operation_name: &str) -> Result<OperationDocument, RequestError> {
    let url = endpoint(inner, operation_name)?;
    let response = inner.client.get(url.clone()).send().await;
    decode(url, response).await
}

async fn decode(
    url: Url,
    response: Result<reqwest::Response, reqwest::Error>,
) -> Result<OperationDocument, RequestError> {
    let response = response.map_err(|e| {
        if e.is_timeout() {
            RequestError::Timeout {
                url: url.to_string(),
            }
        } else {
            RequestError::Network {
                url: url.to_string(),
                source: e,
            }
        }
    })?;
    if !response.status().is_success() {
        return Err(RequestError::HttpStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }
    response
        .json::<OperationDocument>()
        .await
        .map_err(|e| RequestError::Decode {
            url: url.to_string(),
            source: e,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_for(status: u16) -> PrefetchRequestStatus {
        RequestError::HttpStatus {
            url: "u".to_string(),
            status,
        }
        .request_status()
    }

    #[test]
    fn test_request_status_mapping() {
        assert_eq!(status_for(503), PrefetchRequestStatus::RetryWithBackoff);
        assert_eq!(status_for(429), PrefetchRequestStatus::RetryWithBackoff);
        assert_eq!(status_for(403), PrefetchRequestStatus::Suspend);
        assert_eq!(status_for(400), PrefetchRequestStatus::RetryWithoutBackoff);
        assert_eq!(
            RequestError::Timeout { url: "u".to_string() }.request_status(),
            PrefetchRequestStatus::RetryWithoutBackoff
        );
    }

    #[test]
    fn test_generate_body_serializes_in_service_shape() {
        let urls = ["https://a.test/".to_string()];
        let body = GeneratePageBundleBody {
            pages: urls.iter().map(|url| PageParameters { url }).collect(),
            gcm_registration_id: "tok",
        };
        let json = serde_json::to_value(&body).unwrap_or_default();
        assert_eq!(json["gcmRegistrationId"], "tok");
        assert_eq!(json["pages"][0]["url"], "https://a.test/");
    }
}
