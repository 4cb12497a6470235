//! Rate limiting and reverse-proxy dispatch
//!
//! This library provides:
//! - A fixed-window per-second rate limiter keyed by caller-supplied strings
//! - An upstream HTTP forwarder with pooling and a bounded timeout
//! - The proxy dispatcher tying resolution, admission and relay together

pub mod dispatcher;
pub mod forwarder;
pub mod metrics;
pub mod rate_limit;

pub use dispatcher::ProxyDispatcher;
pub use forwarder::{ForwardError, RequestForwarder};
pub use metrics::MetricsCollector;
pub use rate_limit::RateLimiter;
