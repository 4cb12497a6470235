//! Registered service record model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message returned to callers rejected by the rate limiter when the
/// service owner has not configured one.
pub const DEFAULT_RATE_LIMIT_MESSAGE: &str = "Service is busy, please try again later";

/// Liveness status of a registered instance.
///
/// UNKNOWN is only entered at startup for records whose heartbeat went
/// stale while the gateway was offline; the monitor resolves it to UP or
/// DOWN on the next sweeps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    Up,
    Down,
    Unknown,
}

/// One registered service instance.
///
/// The (service_name, service_version, ip, port) tuple is unique across
/// the store, as is a non-empty virtual_domain and an (ip, port) pair.
/// Field names serialize in camelCase to match the console clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    /// Store-assigned identifier, immutable once created.
    #[serde(default)]
    pub id: String,
    pub service_name: String,
    pub service_version: String,
    pub ip: String,
    pub port: u16,
    pub status: ServiceStatus,
    pub register_time: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_domain: Option<String>,
    #[serde(default)]
    pub rate_limit_enabled: bool,
    #[serde(default)]
    pub max_requests_per_second: u32,
    #[serde(default = "default_rate_limit_message")]
    pub rate_limit_error_message: String,
}

fn default_rate_limit_message() -> String {
    DEFAULT_RATE_LIMIT_MESSAGE.to_string()
}

impl ServiceRecord {
    /// Natural key of the instance, used for the monitor's failure counter.
    pub fn tuple_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.service_name, self.service_version, self.ip, self.port
        )
    }

    /// Admission-control key consulted by the proxy path.
    pub fn limiter_key(&self) -> String {
        format!("{}:{}", self.service_name, self.id)
    }

    pub fn matches_tuple(&self, name: &str, version: &str, ip: &str, port: u16) -> bool {
        self.service_name == name
            && self.service_version == version
            && self.ip == ip
            && self.port == port
    }
}

/// Rate-limit configuration view returned by the registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests_per_second: u32,
    pub error_message: String,
}
