//! Prometheus metrics for the gateway

use anyhow::Result;
use prometheus::{CounterVec, Encoder, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus metrics collector shared by the API surface and the proxy
/// dispatcher.
pub struct MetricsCollector {
    /// API requests by method and matched route
    pub http_requests_total: CounterVec,
    /// Proxy exchanges by service and outcome
    /// (forwarded, rate_limited, unavailable, upstream_error)
    pub proxy_requests_total: CounterVec,
    registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let http_requests_total = CounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests"),
            &["method", "route"],
        )?;

        let proxy_requests_total = CounterVec::new(
            Opts::new("proxy_requests_total", "Total proxied requests by outcome"),
            &["service", "outcome"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(proxy_requests_total.clone()))?;

        Ok(Self {
            http_requests_total,
            proxy_requests_total,
            registry,
        })
    }

    pub fn observe_request(&self, method: &str, route: &str) {
        self.http_requests_total
            .with_label_values(&[method, route])
            .inc();
    }

    pub fn observe_proxy(&self, service: &str, outcome: &str) {
        self.proxy_requests_total
            .with_label_values(&[service, outcome])
            .inc();
    }

    /// Gather all metrics in Prometheus text format.
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Clone for MetricsCollector {
    fn clone(&self) -> Self {
        // Clones share the same registry and underlying counters.
        Self {
            http_requests_total: self.http_requests_total.clone(),
            proxy_requests_total: self.proxy_requests_total.clone(),
            registry: self.registry.clone(),
        }
    }
}
