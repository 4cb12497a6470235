//! Upstream HTTP request forwarding with connection pooling and timeout

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::tokio::TokioExecutor;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid upstream target: {0}")]
    InvalidTarget(String),

    #[error("Failed to read request or response body: {0}")]
    Body(String),
}

/// HTTP request forwarder for proxying to registered upstream instances.
///
/// Connections are pooled; every forwarded call carries a bounded timeout
/// so a hung upstream cannot pin a forwarding worker. Failures are never
/// retried here; retrying is the caller's decision.
pub struct RequestForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl RequestForwarder {
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        connector.set_keepalive(Some(Duration::from_secs(30)));

        let client = Client::builder(TokioExecutor::new()).build::<_, Full<Bytes>>(connector);

        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a prepared request upstream and collect the full response.
    pub async fn forward(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<Response<Bytes>, ForwardError> {
        debug!("Forwarding {} {}", request.method(), request.uri());

        match tokio_timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                debug!("Upstream responded with status {}", response.status());
                let (parts, body) = response.into_parts();
                let bytes = body
                    .collect()
                    .await
                    .map_err(|e| ForwardError::Body(e.to_string()))?
                    .to_bytes();
                Ok(Response::from_parts(parts, bytes))
            }
            Ok(Err(e)) => {
                warn!("Upstream request error: {}", e);
                Err(ForwardError::Upstream(e.to_string()))
            }
            Err(_) => {
                warn!("Upstream request timeout after {:?}", self.timeout);
                Err(ForwardError::Timeout(self.timeout))
            }
        }
    }

    /// Check if a header is hop-by-hop (must not cross the proxy).
    pub fn is_hop_by_hop_header(name: &str) -> bool {
        matches!(
            name,
            "connection"
                | "keep-alive"
                | "proxy-authenticate"
                | "proxy-authorization"
                | "te"
                | "trailers"
                | "transfer-encoding"
                | "upgrade"
        )
    }
}
