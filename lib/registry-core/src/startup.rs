//! Startup initialization over persisted records

use crate::clock::Clock;
use crate::record::ServiceStatus;
use crate::store::RecordStore;
use crate::Result;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info};

/// Hours a heartbeat may be stale at boot before the record's liveness is
/// considered unknown.
pub const STALE_RESET_HOURS: i64 = 1;

/// Loads the persisted inventory at boot and resets long-stale records to
/// UNKNOWN so the heartbeat monitor re-evaluates them. This is the only
/// path that enters the UNKNOWN state.
pub struct StartupInitializer {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
}

impl StartupInitializer {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_stale_after(store, clock, Duration::hours(STALE_RESET_HOURS))
    }

    pub fn with_stale_after(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            stale_after,
        }
    }

    /// Returns how many records were reset to UNKNOWN.
    pub async fn run(&self) -> Result<usize> {
        let records = self.store.scan().await?;

        if records.is_empty() {
            info!("Startup: no persisted services found");
            return Ok(0);
        }
        info!("Startup: loaded {} persisted services", records.len());

        let now = self.clock.now();
        let mut reset = 0;

        for mut record in records {
            debug!(
                "Loaded service: {} (v{}) - {}:{}",
                record.service_name, record.service_version, record.ip, record.port
            );

            if record.last_heartbeat + self.stale_after < now {
                record.status = ServiceStatus::Unknown;
                let key = record.tuple_key();
                self.store.put(record).await?;
                debug!("Reset stale service to UNKNOWN: {}", key);
                reset += 1;
            }
        }

        info!(
            "Startup: initialization complete, {} stale records reset",
            reset
        );
        Ok(reset)
    }
}
