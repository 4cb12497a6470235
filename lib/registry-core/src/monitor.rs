//! Heartbeat monitoring for automatic liveness transitions

use crate::clock::Clock;
use crate::record::{ServiceRecord, ServiceStatus};
use crate::store::RecordStore;
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Seconds without a heartbeat before an instance is considered offline.
/// Generous enough to ride out transient network jitter.
pub const HEARTBEAT_TIMEOUT_SECS: i64 = 90;

/// Consecutive overdue evaluations after which an operator warning is
/// logged for a record that still is not marked offline.
pub const MAX_HEARTBEAT_FAILURES: u32 = 3;

/// Default period between sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Periodic sweep over all records, driving the liveness state machine.
///
/// Offline (DOWN) records are skipped entirely; an overdue record is
/// marked DOWN exactly once; a record heard from in time has its failure
/// count cleared and is promoted from UNKNOWN back to UP. The failure
/// counter lives in process memory keyed by the record tuple, so a
/// restart simply restarts counting.
pub struct HeartbeatMonitor {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    timeout_secs: i64,
    interval: Duration,
    failure_counts: Mutex<HashMap<String, u32>>,
}

impl HeartbeatMonitor {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_timing(store, clock, HEARTBEAT_TIMEOUT_SECS, SWEEP_INTERVAL)
    }

    pub fn with_timing(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        timeout_secs: i64,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            timeout_secs,
            interval,
            failure_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Run sweeps forever at the configured cadence.
    pub async fn run(&self) {
        info!(
            "Heartbeat monitor started (timeout {}s, sweep every {:?})",
            self.timeout_secs, self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    /// One full scan-and-evaluate pass over all records. A failure on one
    /// record never aborts the rest of the sweep.
    pub async fn sweep(&self) {
        let records = match self.store.scan().await {
            Ok(records) => records,
            Err(e) => {
                error!("Heartbeat sweep could not read records: {}", e);
                return;
            }
        };

        let now = self.clock.now();
        debug!("Heartbeat sweep over {} registered services", records.len());

        for record in records {
            let key = record.tuple_key();
            if let Err(e) = self.evaluate(record, now).await {
                error!("Heartbeat evaluation failed for {}: {}", key, e);
            }
        }
    }

    async fn evaluate(&self, mut record: ServiceRecord, now: DateTime<Utc>) -> Result<()> {
        let key = record.tuple_key();

        // DOWN is sticky: only an explicit register, heartbeat or
        // set-online call brings the record back.
        if record.status == ServiceStatus::Down {
            debug!("Skipping offline service {}", key);
            return Ok(());
        }

        let elapsed_secs = (now - record.last_heartbeat).num_seconds();

        if elapsed_secs > self.timeout_secs {
            let failures = {
                let mut counts = self.failure_counts.lock().await;
                let count = counts.entry(key.clone()).or_insert(0);
                *count += 1;
                *count
            };

            if failures == 1 {
                record.status = ServiceStatus::Down;
                info!(
                    "Service offline: {} (v{}) - {}:{}, no heartbeat for {}s",
                    record.service_name, record.service_version, record.ip, record.port,
                    elapsed_secs
                );
                self.store.put(record).await?;
            } else if failures >= MAX_HEARTBEAT_FAILURES {
                warn!(
                    "Service persistently offline, may need intervention: {} ({} consecutive failures)",
                    key, failures
                );
            }
        } else {
            self.failure_counts.lock().await.remove(&key);

            if record.status == ServiceStatus::Unknown {
                record.status = ServiceStatus::Up;
                info!(
                    "Service back online: {} (v{}) - {}:{}",
                    record.service_name, record.service_version, record.ip, record.port
                );
                self.store.put(record).await?;
            }
            // UP stays UP with no write.
        }

        Ok(())
    }

    #[cfg(test)]
    async fn failure_count(&self, key: &str) -> u32 {
        self.failure_counts
            .lock()
            .await
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::ServiceRegistry;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        registry: ServiceRegistry,
        monitor: HeartbeatMonitor,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn setup() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        Fixture {
            registry: ServiceRegistry::new(store.clone(), clock.clone()),
            monitor: HeartbeatMonitor::new(store.clone(), clock.clone()),
            store,
            clock,
        }
    }

    #[tokio::test]
    async fn test_fresh_record_stays_up() {
        let f = setup();
        let record = f
            .registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();

        f.clock.advance(ChronoDuration::seconds(30));
        f.monitor.sweep().await;

        let stored = f.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServiceStatus::Up);
    }

    #[tokio::test]
    async fn test_overdue_record_marked_down_exactly_once() {
        let f = setup();
        let record = f
            .registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();

        f.clock.advance(ChronoDuration::seconds(91));
        f.monitor.sweep().await;

        let stored = f.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServiceStatus::Down);
        let marked_down_at = stored.last_heartbeat;

        // Later sweeps skip the DOWN record: no further writes, no counter
        // growth.
        f.clock.advance(ChronoDuration::seconds(300));
        f.monitor.sweep().await;
        f.monitor.sweep().await;

        let stored = f.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServiceStatus::Down);
        assert_eq!(stored.last_heartbeat, marked_down_at);
        assert_eq!(f.monitor.failure_count(&stored.tuple_key()).await, 1);
    }

    #[tokio::test]
    async fn test_down_is_sticky_even_with_fresh_heartbeat_time() {
        let f = setup();
        let record = f
            .registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();
        f.registry.deregister_by_id(&record.id).await.unwrap();

        // Tuple-keyed heartbeat refreshes the timestamp but not the status;
        // the monitor must not resurrect the record either.
        f.registry
            .heartbeat("orders", "1.0", "10.0.0.1", 8080)
            .await
            .unwrap();
        f.monitor.sweep().await;

        let stored = f.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServiceStatus::Down);
    }

    #[tokio::test]
    async fn test_unknown_promoted_to_up_when_heartbeat_fresh() {
        let f = setup();
        let record = f
            .registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();

        let mut stored = f.store.get(&record.id).await.unwrap().unwrap();
        stored.status = ServiceStatus::Unknown;
        f.store.put(stored).await.unwrap();

        f.monitor.sweep().await;

        let stored = f.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServiceStatus::Up);
    }

    #[tokio::test]
    async fn test_stale_unknown_goes_down() {
        let f = setup();
        let record = f
            .registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();

        let mut stored = f.store.get(&record.id).await.unwrap().unwrap();
        stored.status = ServiceStatus::Unknown;
        f.store.put(stored).await.unwrap();

        f.clock.advance(ChronoDuration::seconds(91));
        f.monitor.sweep().await;

        let stored = f.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServiceStatus::Down);
    }

    #[tokio::test]
    async fn test_recovered_heartbeat_clears_failure_count() {
        let f = setup();
        let record = f
            .registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();
        let key = record.tuple_key();

        f.clock.advance(ChronoDuration::seconds(91));
        f.monitor.sweep().await;
        assert_eq!(f.monitor.failure_count(&key).await, 1);

        // The instance comes back via the id-keyed heartbeat.
        f.registry.heartbeat_by_id(&record.id).await.unwrap();
        f.monitor.sweep().await;

        assert_eq!(f.monitor.failure_count(&key).await, 0);
        let stored = f.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServiceStatus::Up);
    }

    /// Store wrapper that counts writes, to pin down exactly-once
    /// persistence of the DOWN transition.
    struct CountingStore {
        inner: MemoryStore,
        puts: std::sync::atomic::AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                puts: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        fn put_count(&self) -> usize {
            self.puts.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl RecordStore for CountingStore {
        async fn get(&self, id: &str) -> crate::Result<Option<ServiceRecord>> {
            self.inner.get(id).await
        }

        async fn get_by_tuple(
            &self,
            name: &str,
            version: &str,
            ip: &str,
            port: u16,
        ) -> crate::Result<Option<ServiceRecord>> {
            self.inner.get_by_tuple(name, version, ip, port).await
        }

        async fn scan(&self) -> crate::Result<Vec<ServiceRecord>> {
            self.inner.scan().await
        }

        async fn put(&self, record: ServiceRecord) -> crate::Result<ServiceRecord> {
            self.puts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.put(record).await
        }

        async fn delete(&self, id: &str) -> crate::Result<bool> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_down_transition_persisted_exactly_once() {
        let store = Arc::new(CountingStore::new());
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let registry = ServiceRegistry::new(store.clone(), clock.clone());
        let monitor = HeartbeatMonitor::new(store.clone(), clock.clone());

        registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();
        assert_eq!(store.put_count(), 1);

        // A sweep within the timeout writes nothing.
        sweep_times(&monitor, 1).await;
        assert_eq!(store.put_count(), 1);

        // The DOWN transition is persisted once; repeated sweeps add no
        // further writes.
        clock.advance(ChronoDuration::seconds(91));
        sweep_times(&monitor, 3).await;
        assert_eq!(store.put_count(), 2);
    }

    async fn sweep_times(monitor: &HeartbeatMonitor, n: usize) {
        for _ in 0..n {
            monitor.sweep().await;
        }
    }

    #[tokio::test]
    async fn test_end_to_end_heartbeat_then_silence() {
        let f = setup();
        let record = f
            .registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();

        // Heartbeats within the timeout keep the record UP across sweeps.
        for _ in 0..3 {
            f.clock.advance(ChronoDuration::seconds(60));
            f.registry
                .heartbeat("orders", "1.0", "10.0.0.1", 8080)
                .await
                .unwrap();
            f.monitor.sweep().await;
            let stored = f.store.get(&record.id).await.unwrap().unwrap();
            assert_eq!(stored.status, ServiceStatus::Up);
        }

        // Silence past the timeout transitions to DOWN.
        f.clock.advance(ChronoDuration::seconds(91));
        f.monitor.sweep().await;
        let stored = f.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServiceStatus::Down);
    }
}
