//! Histograms reported when finished items are retired.
//!
//! # Overview
//!
//! - [`MetricsRecorder`] - capability the metrics-finalization task reports to
//! - [`PrometheusMetrics`] - one histogram per metric in a private registry
//! - [`RecordingMetrics`] - keeps every sample in memory

use std::collections::HashMap;
use std::sync::Mutex;

use prometheus::{Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
use tracing::debug;

/// Seconds from creation to finalization.
pub const ITEM_LIFETIME_SECONDS: &str = "item_lifetime_seconds";
/// Numeric error code of the finished item.
pub const FINISHED_ERROR_CODE: &str = "finished_error_code";
/// GeneratePageBundle attempts used.
pub const GENERATE_BUNDLE_ATTEMPTS: &str = "generate_bundle_attempts";
/// GetOperation attempts used.
pub const GET_OPERATION_ATTEMPTS: &str = "get_operation_attempts";
/// Download attempts used.
pub const DOWNLOAD_INITIATION_ATTEMPTS: &str = "download_initiation_attempts";
/// Downloaded size as a percentage of the size the service announced.
pub const ARCHIVE_SIZE_RATIO_PERCENT: &str = "archive_size_ratio_percent";

const NAMESPACE: &str = "offline_prefetch";

/// Receives histogram samples.
pub trait MetricsRecorder: Send + Sync {
    /// Adds one sample to histogram `name`.
    fn record_histogram(&self, name: &'static str, value: f64);
}

fn histogram_specs() -> [(&'static str, &'static str, Vec<f64>); 6] {
    let attempts = vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
    [
        (
            ITEM_LIFETIME_SECONDS,
            "Seconds between suggestion and finalization",
            vec![60.0, 600.0, 3600.0, 6.0 * 3600.0, 86_400.0, 2.0 * 86_400.0, 7.0 * 86_400.0],
        ),
        (
            FINISHED_ERROR_CODE,
            "Error code of finished items",
            (0..=18).map(|n| f64::from(n) * 100.0).collect(),
        ),
        (
            GENERATE_BUNDLE_ATTEMPTS,
            "GeneratePageBundle attempts per finished item",
            attempts.clone(),
        ),
        (
            GET_OPERATION_ATTEMPTS,
            "GetOperation attempts per finished item",
            attempts.clone(),
        ),
        (
            DOWNLOAD_INITIATION_ATTEMPTS,
            "Download attempts per finished item",
            attempts,
        ),
        (
            ARCHIVE_SIZE_RATIO_PERCENT,
            "Downloaded size relative to announced size",
            vec![50.0, 90.0, 99.0, 100.0, 101.0, 110.0, 150.0],
        ),
    ]
}

/// Prometheus-backed recorder with its own registry.
#[derive(Debug)]
pub struct PrometheusMetrics {
    registry: Registry,
    histograms: HashMap<&'static str, Histogram>,
}

impl PrometheusMetrics {
    /// Creates and registers every pipeline histogram.
    ///
    /// # Errors
    ///
    /// Returns the prometheus error if a histogram cannot be built or
    /// registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let mut histograms = HashMap::new();
        for (name, help, buckets) in histogram_specs() {
            let histogram =
                Histogram::with_opts(HistogramOpts::new(name, help).namespace(NAMESPACE).buckets(buckets))?;
            registry.register(Box::new(histogram.clone()))?;
            histograms.insert(name, histogram);
        }
        Ok(Self {
            registry,
            histograms,
        })
    }

    /// Text exposition of every histogram.
    ///
    /// # Errors
    ///
    /// Returns the prometheus error if encoding fails.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Number of samples observed by `name`.
    #[must_use]
    pub fn sample_count(&self, name: &str) -> u64 {
        self.histograms.get(name).map_or(0, Histogram::get_sample_count)
    }
}

impl MetricsRecorder for PrometheusMetrics {
    fn record_histogram(&self, name: &'static str, value: f64) {
        match self.histograms.get(name) {
            Some(histogram) => histogram.observe(value),
            None => debug!(name, "unknown histogram"),
        }
    }
}

/// Keeps every sample in memory.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    samples: Mutex<Vec<(&'static str, f64)>>,
}

impl RecordingMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every sample in arrival order.
    #[must_use]
    pub fn samples(&self) -> Vec<(&'static str, f64)> {
        self.samples.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Samples recorded for `name`.
    #[must_use]
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.samples()
            .into_iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, v)| v)
            .collect()
    }

    /// Number of samples recorded for `name`.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.values(name).len()
    }
}

impl MetricsRecorder for RecordingMetrics {
    fn record_histogram(&self, name: &'static str, value: f64) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.push((name, value));
        }
    }
}
