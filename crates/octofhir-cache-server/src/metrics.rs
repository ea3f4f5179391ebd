//! Prometheus metrics for the cache server.
//!
//! Cache counters are emitted by `octofhir-cache` through the `metrics` facade;
//! this module installs the Prometheus recorder and adds HTTP level series.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "cache_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "cache_http_request_duration_seconds";
    pub const RESPONSE_CACHE_TOTAL: &str = "cache_http_response_cache_total";
    pub const CACHE_ENTRIES: &str = "cache_entries";
}

/// Install the global Prometheus recorder. Returns `false` if another recorder
/// was already installed (e.g. a second server in the same test process).
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        return true;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = PROMETHEUS_HANDLE.set(handle);
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    // Normalize path to avoid high cardinality
    let normalized_path = normalize_path(path);

    counter!(
        names::HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "path" => normalized_path.clone(),
        "status_class" => status_class(status)
    )
    .increment(1);

    histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "path" => normalized_path
    )
    .record(duration.as_secs_f64());
}

/// `outcome` is one of `hit`, `miss` or `bypass`.
pub fn record_response_cache(outcome: &'static str) {
    counter!(names::RESPONSE_CACHE_TOTAL, "outcome" => outcome).increment(1);
}

pub fn set_cache_entries(tier: &'static str, count: usize) {
    gauge!(names::CACHE_ENTRIES, "tier" => tier).set(count as f64);
}

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

/// Collapse per-entry admin paths so cache keys do not become label values.
fn normalize_path(path: &str) -> String {
    if path.starts_with("/cache/entries/") {
        return "/cache/entries/{key}".to_string();
    }
    match path {
        "/healthz" | "/metrics" | "/cache" | "/cache/keys" | "/cache/stats" | "/cache/stats/reset"
        | "/cache/mget" => path.to_string(),
        _ => "other".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_paths_are_collapsed() {
        assert_eq!(normalize_path("/cache/entries/user:42"), "/cache/entries/{key}");
        assert_eq!(normalize_path("/cache/stats"), "/cache/stats");
        assert_eq!(normalize_path("/reports/2024-01-01"), "other");
    }

    #[test]
    fn status_classes() {
        assert_eq!(status_class(204), "2xx");
        assert_eq!(status_class(404), "4xx");
        assert_eq!(status_class(503), "5xx");
    }
}
