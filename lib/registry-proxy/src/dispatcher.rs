//! Reverse-proxy dispatch: resolve a target, gate it, forward the exchange

use crate::forwarder::{ForwardError, RequestForwarder};
use crate::metrics::MetricsCollector;
use crate::rate_limit::RateLimiter;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response, StatusCode, Uri};
use registry_core::{ServiceRecord, ServiceRegistry, ServiceStatus};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Dispatches `/proxy/{nameOrDomain}/**` exchanges.
///
/// Resolution, the liveness gate, admission control and forwarding are
/// separate steps; every failure class is answered with a JSON envelope so
/// nothing escapes to the caller as an unhandled fault.
pub struct ProxyDispatcher {
    registry: Arc<ServiceRegistry>,
    limiter: Arc<RateLimiter>,
    forwarder: Arc<RequestForwarder>,
    metrics: Arc<MetricsCollector>,
}

impl ProxyDispatcher {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        limiter: Arc<RateLimiter>,
        forwarder: Arc<RequestForwarder>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            registry,
            limiter,
            forwarder,
            metrics,
        }
    }

    /// Handle one proxied exchange end to end.
    pub async fn dispatch<B>(
        &self,
        target: &str,
        client_addr: &str,
        req: Request<B>,
    ) -> Response<Full<Bytes>>
    where
        B: hyper::body::Body,
        B::Error: std::fmt::Display,
    {
        if !is_supported_method(req.method()) {
            warn!("Unsupported proxy method: {}", req.method());
            return envelope_error(StatusCode::METHOD_NOT_ALLOWED, "Unsupported HTTP method");
        }

        let record = match self.resolve(target).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("No service found for virtual domain or name [{}]", target);
                return envelope_error(
                    StatusCode::NOT_FOUND,
                    "No service found for the given virtual domain or service name",
                );
            }
            Err(e) => {
                warn!("Proxy resolution failed for [{}]: {}", target, e);
                return envelope_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("Proxy request failed: {}", e),
                );
            }
        };

        // Resolution may hand back a non-UP record as a last resort; the
        // liveness gate is an independent check.
        if record.status != ServiceStatus::Up {
            warn!("Service [{}] is offline", record.service_name);
            self.metrics.observe_proxy(&record.service_name, "unavailable");
            return envelope_error(StatusCode::SERVICE_UNAVAILABLE, "Service is offline");
        }

        if record.rate_limit_enabled && record.max_requests_per_second > 0 {
            let key = record.limiter_key();
            if !self.limiter.is_allowed(&key, record.max_requests_per_second) {
                warn!(
                    "Service [{}] rate limited: {}/{} this second",
                    record.service_name,
                    self.limiter.current_count(&key),
                    record.max_requests_per_second
                );
                self.metrics.observe_proxy(&record.service_name, "rate_limited");
                return envelope_error(
                    StatusCode::TOO_MANY_REQUESTS,
                    &record.rate_limit_error_message,
                );
            }
        }

        match self.forward_exchange(&record, target, client_addr, req).await {
            Ok(response) => {
                self.metrics.observe_proxy(&record.service_name, "forwarded");
                response
            }
            Err(e) => {
                warn!(
                    "Proxy forwarding to {}:{} failed: {}",
                    record.ip, record.port, e
                );
                self.metrics.observe_proxy(&record.service_name, "upstream_error");
                envelope_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("Proxy request failed: {}", e),
                )
            }
        }
    }

    /// Resolve a path segment to a record: virtual-domain lookup first,
    /// then service name preferring the first UP instance, then the first
    /// instance of any status.
    pub async fn resolve(&self, target: &str) -> registry_core::Result<Option<ServiceRecord>> {
        if let Some(record) = self.registry.find_by_virtual_domain(target).await? {
            return Ok(Some(record));
        }

        debug!("Virtual domain [{}] not bound, trying service name", target);
        let records = self.registry.find_by_name_and_version(target, None).await?;
        Ok(records
            .iter()
            .find(|r| r.status == ServiceStatus::Up)
            .or_else(|| records.first())
            .cloned())
    }

    async fn forward_exchange<B>(
        &self,
        record: &ServiceRecord,
        target: &str,
        client_addr: &str,
        req: Request<B>,
    ) -> Result<Response<Full<Bytes>>, ForwardError>
    where
        B: hyper::body::Body,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| ForwardError::Body(e.to_string()))?
            .to_bytes();

        let uri = build_target_uri(&record.ip, record.port, target, &parts.uri)?;
        debug!("Forwarding request to {} with method {}", uri, parts.method);

        let mut builder = Request::builder().method(parts.method).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in parts.headers.iter() {
                // The outbound transport sets its own Host.
                if name == HOST || RequestForwarder::is_hop_by_hop_header(name.as_str()) {
                    continue;
                }
                headers.append(name.clone(), value.clone());
            }
            if let Ok(addr) = HeaderValue::from_str(client_addr) {
                headers.append(HeaderName::from_static("x-forwarded-for"), addr);
            }
        }

        let request = builder
            .body(Full::new(body_bytes))
            .map_err(|e| ForwardError::InvalidTarget(e.to_string()))?;

        let response = self.forwarder.forward(request).await?;

        // Relay status, headers and body verbatim.
        let (parts, bytes) = response.into_parts();
        Ok(Response::from_parts(parts, Full::new(bytes)))
    }
}

/// Only the four methods the gateway contract names are forwarded.
pub fn is_supported_method(method: &Method) -> bool {
    matches!(method.as_str(), "GET" | "POST" | "PUT" | "DELETE")
}

/// Upstream URL: the record's address plus the inbound path with the
/// `/proxy/{target}` prefix stripped (an empty remainder maps to `/`),
/// preserving the query string.
pub fn build_target_uri(
    ip: &str,
    port: u16,
    target: &str,
    inbound: &Uri,
) -> Result<Uri, ForwardError> {
    let prefix = format!("/proxy/{}", target);
    let path = inbound.path();
    let remainder = path.strip_prefix(&prefix).unwrap_or("");
    let remainder = if remainder.is_empty() { "/" } else { remainder };

    let url = match inbound.query() {
        Some(query) => format!("http://{}:{}{}?{}", ip, port, remainder, query),
        None => format!("http://{}:{}{}", ip, port, remainder),
    };
    url.parse()
        .map_err(|_| ForwardError::InvalidTarget(url.clone()))
}

fn envelope_error(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = json!({ "success": false, "message": message }).to_string();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
