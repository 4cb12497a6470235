//! Gateway configuration from environment variables

use registry_core::monitor::{HEARTBEAT_TIMEOUT_SECS, SWEEP_INTERVAL};
use registry_core::startup::STALE_RESET_HOURS;
use std::time::Duration;
use tracing::warn;

const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_FORWARD_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub http_port: u16,
    pub heartbeat_timeout_secs: i64,
    pub sweep_interval: Duration,
    pub forward_timeout: Duration,
    pub stale_reset_hours: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            heartbeat_timeout_secs: HEARTBEAT_TIMEOUT_SECS,
            sweep_interval: SWEEP_INTERVAL,
            forward_timeout: Duration::from_secs(DEFAULT_FORWARD_TIMEOUT_SECS),
            stale_reset_hours: STALE_RESET_HOURS,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = read_env::<u16>("REGISTRY_HTTP_PORT") {
            config.http_port = port;
        }
        if let Some(secs) = read_env::<i64>("REGISTRY_HEARTBEAT_TIMEOUT_SECS") {
            config.heartbeat_timeout_secs = secs;
        }
        if let Some(secs) = read_env::<u64>("REGISTRY_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = read_env::<u64>("REGISTRY_FORWARD_TIMEOUT_SECS") {
            config.forward_timeout = Duration::from_secs(secs);
        }
        if let Some(hours) = read_env::<i64>("REGISTRY_STALE_RESET_HOURS") {
            config.stale_reset_hours = hours;
        }

        config
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid value for {}: {}", name, raw);
                None
            }
        },
        Err(_) => None,
    }
}
