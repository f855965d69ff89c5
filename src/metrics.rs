//! Prometheus metrics collection and export.

use crate::egress::TransportMode;
use crate::retry::RetryObserver;
use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::io;
use std::sync::{Arc, Mutex};

/// Labels for HTTP request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    /// Traffic direction (inbound, outbound)
    pub direction: String,
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// HTTP status code (200, 404, etc.)
    pub status: String,
    /// Upstream cluster name, `-` when none was selected
    pub cluster: String,
}

/// Labels for per-cluster retry counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub sidecar_cluster_name: String,
}

/// Labels for egress decisions.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EgressLabels {
    pub mode: String,
}

/// Global metrics registry.
///
/// Initialized once at startup and shared across all tasks.
static METRICS: Lazy<Arc<Mutex<Metrics>>> = Lazy::new(|| Arc::new(Mutex::new(Metrics::new())));

/// Metrics collector for the sidecar.
///
/// Tracks request counts, latencies, retries and egress decisions.
pub struct Metrics {
    registry: Registry,
    requests_total: Family<HttpLabels, Counter>,
    request_duration_seconds: Family<HttpLabels, Histogram>,
    retry: Family<ClusterLabels, Counter>,
    retry_success: Family<ClusterLabels, Counter>,
    retry_limit_exceeded: Family<ClusterLabels, Counter>,
    egress_connections: Family<EgressLabels, Counter>,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<HttpLabels, Counter>::default();
        registry.register(
            "http_requests",
            "Total number of HTTP requests",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<HttpLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 10))
            });
        registry.register(
            "http_request_duration_seconds",
            "HTTP request latency in seconds",
            request_duration_seconds.clone(),
        );

        let retry = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "sidecar_cluster_upstream_rq_retry",
            "Upstream request retries",
            retry.clone(),
        );

        let retry_success = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "sidecar_cluster_upstream_rq_retry_success",
            "Upstream requests that succeeded after a retry",
            retry_success.clone(),
        );

        let retry_limit_exceeded = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "sidecar_cluster_upstream_rq_retry_limit_exceeded",
            "Upstream requests that exhausted their retries",
            retry_limit_exceeded.clone(),
        );

        let egress_connections = Family::<EgressLabels, Counter>::default();
        registry.register(
            "sidecar_egress_connections",
            "Upstream connections by transport mode",
            egress_connections.clone(),
        );

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            retry,
            retry_success,
            retry_limit_exceeded,
            egress_connections,
        }
    }

    /// Records a proxied request with its direction, method, status, cluster
    /// and duration.
    pub fn record_request(
        direction: &str,
        method: &str,
        status: u16,
        cluster: &str,
        duration_secs: f64,
    ) {
        let labels = HttpLabels {
            direction: direction.to_string(),
            method: method.to_string(),
            status: status.to_string(),
            cluster: cluster.to_string(),
        };

        if let Ok(metrics) = METRICS.lock() {
            metrics.requests_total.get_or_create(&labels).inc();
            metrics
                .request_duration_seconds
                .get_or_create(&labels)
                .observe(duration_secs);
        }
    }

    /// Records the transport chosen for a new upstream connection.
    pub fn record_egress(mode: TransportMode) {
        let labels = EgressLabels {
            mode: mode.as_str().to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics.egress_connections.get_or_create(&labels).inc();
        }
    }

    fn with_cluster(cluster: &str, pick: impl FnOnce(&Metrics) -> &Family<ClusterLabels, Counter>) {
        let labels = ClusterLabels {
            sidecar_cluster_name: cluster.to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            pick(&*metrics).get_or_create(&labels).inc();
        }
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the mutex is poisoned.
    pub fn encode() -> Result<String, io::Error> {
        let metrics = METRICS
            .lock()
            .map_err(|e| io::Error::other(format!("mutex poisoned: {}", e)))?;

        let mut buffer = String::new();
        encode(&mut buffer, &metrics.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;

        Ok(buffer)
    }
}

/// Retry observer writing to the global registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsObserver;

impl RetryObserver for MetricsObserver {
    fn retry(&self, cluster: &str) {
        Metrics::with_cluster(cluster, |m| &m.retry);
    }

    fn retry_success(&self, cluster: &str) {
        Metrics::with_cluster(cluster, |m| &m.retry_success);
    }

    fn retry_limit_exceeded(&self, cluster: &str) {
        Metrics::with_cluster(cluster, |m| &m.retry_limit_exceeded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request() {
        Metrics::record_request("outbound", "GET", 200, "c1", 0.05);
        Metrics::record_request("inbound", "POST", 201, "-", 0.1);

        let encoded = Metrics::encode().unwrap();
        assert!(encoded.contains("http_requests_total"));
        assert!(encoded.contains("http_request_duration_seconds"));
        assert!(encoded.contains("direction=\"outbound\""));
    }

    #[test]
    fn test_retry_counters_labelled_by_cluster() {
        let observer = MetricsObserver;
        observer.retry("metrics-test-cluster");
        observer.retry("metrics-test-cluster");
        observer.retry_limit_exceeded("metrics-test-cluster");

        let encoded = Metrics::encode().unwrap();
        assert!(encoded.contains(
            "sidecar_cluster_upstream_rq_retry_total{sidecar_cluster_name=\"metrics-test-cluster\"} 2"
        ));
        assert!(encoded.contains(
            "sidecar_cluster_upstream_rq_retry_limit_exceeded_total{sidecar_cluster_name=\"metrics-test-cluster\"} 1"
        ));
    }

    #[test]
    fn test_egress_counter() {
        Metrics::record_egress(TransportMode::Tunnel);
        let encoded = Metrics::encode().unwrap();
        assert!(encoded.contains("sidecar_egress_connections_total{mode=\"tunnel\"}"));
    }
}
