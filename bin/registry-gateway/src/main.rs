use anyhow::Result;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::tokio::TokioIo;
use registry_core::{
    Clock, HeartbeatMonitor, MemoryStore, RecordStore, ServiceRegistry, StartupInitializer,
    SystemClock,
};
use registry_proxy::{MetricsCollector, ProxyDispatcher, RateLimiter, RequestForwarder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};
use tracing_subscriber::fmt::init as tracing_init;

mod api;
mod config;

use api::AppState;
use config::GatewayConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    info!("Starting registry-gateway...");
    let config = GatewayConfig::from_env();

    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let registry = Arc::new(ServiceRegistry::new(store.clone(), clock.clone()));
    info!("Service registry initialized");

    // Re-evaluate liveness of anything persisted while we were away.
    let initializer = StartupInitializer::with_stale_after(
        store.clone(),
        clock.clone(),
        chrono::Duration::hours(config.stale_reset_hours),
    );
    let reset = initializer.run().await?;
    if reset > 0 {
        info!("{} stale services reset to UNKNOWN at startup", reset);
    }

    let monitor = Arc::new(HeartbeatMonitor::with_timing(
        store.clone(),
        clock.clone(),
        config.heartbeat_timeout_secs,
        config.sweep_interval,
    ));
    tokio::task::spawn({
        let monitor = monitor.clone();
        async move { monitor.run().await }
    });

    let limiter = Arc::new(RateLimiter::new(clock.clone()));
    info!("Rate limiter initialized");

    let forwarder = Arc::new(RequestForwarder::new(config.forward_timeout));
    info!(
        "Request forwarder initialized with {:?} timeout",
        config.forward_timeout
    );

    let metrics = Arc::new(MetricsCollector::new()?);
    info!("Metrics collector initialized");

    let dispatcher = Arc::new(ProxyDispatcher::new(
        registry.clone(),
        limiter,
        forwarder,
        metrics.clone(),
    ));
    info!("Proxy dispatcher initialized");

    let state = Arc::new(AppState {
        registry,
        dispatcher,
        metrics,
    });

    let addr: SocketAddr = ([0, 0, 0, 0], config.http_port).into();
    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on {}", addr);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                api::handle_request(state, peer_addr, req)
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving connection from {}: {}", peer_addr, e);
            }
        });
    }
}
