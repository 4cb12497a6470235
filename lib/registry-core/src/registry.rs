//! Service registry: registration, reactivation and uniqueness enforcement

use crate::clock::Clock;
use crate::record::{RateLimitConfig, ServiceRecord, ServiceStatus, DEFAULT_RATE_LIMIT_MESSAGE};
use crate::store::RecordStore;
use crate::{RegistryError, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// ServiceRegistry owns the consistency rules for registry records.
///
/// All operations are best-effort read-then-write sequences over the
/// store; concurrent writers on the same record resolve last-writer-wins.
/// Concurrent registrations targeting the same ip:port may race, and the
/// design accepts eventual uniqueness rather than atomicity.
pub struct ServiceRegistry {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Register an instance, reactivating or taking over existing records.
    ///
    /// Resolution order:
    /// 1. Exact (name, version, ip, port) match: reactivate it in place.
    /// 2. Another identity on the same ip:port: treat as a redeployment of
    ///    that instance and overwrite its identity fields; conflicting
    ///    records on the same ip:port or holding the requested virtual
    ///    domain are removed to restore uniqueness.
    /// 3. Otherwise create a fresh record.
    pub async fn register(
        &self,
        name: &str,
        version: &str,
        ip: &str,
        port: u16,
        virtual_domain: Option<String>,
    ) -> Result<ServiceRecord> {
        let now = self.clock.now();
        let virtual_domain = normalize_domain(virtual_domain);

        if let Some(mut existing) = self.store.get_by_tuple(name, version, ip, port).await? {
            existing.status = ServiceStatus::Up;
            existing.last_heartbeat = now;
            existing.virtual_domain = virtual_domain;
            info!(
                "Reactivated service {} (v{}) - {}:{}",
                name, version, ip, port
            );
            return self.store.put(existing).await;
        }

        let all = self.store.scan().await?;
        let takeover = all.iter().find(|r| r.ip == ip && r.port == port).cloned();

        if let Some(mut record) = takeover {
            for stale in all.iter().filter(|r| r.id != record.id).filter(|r| {
                (r.ip == ip && r.port == port)
                    || (virtual_domain.is_some() && r.virtual_domain == virtual_domain)
            }) {
                self.store.delete(&stale.id).await?;
                warn!(
                    "Removed conflicting record {} ({}) while registering {}:{}",
                    stale.id,
                    stale.tuple_key(),
                    ip,
                    port
                );
            }

            record.service_name = name.to_string();
            record.service_version = version.to_string();
            record.status = ServiceStatus::Up;
            record.last_heartbeat = now;
            record.virtual_domain = virtual_domain;
            info!(
                "Instance at {}:{} redeployed as {} (v{})",
                ip, port, name, version
            );
            return self.store.put(record).await;
        }

        if let Some(domain) = &virtual_domain {
            if self.find_by_virtual_domain(domain).await?.is_some() {
                return Err(RegistryError::DomainConflict(domain.clone()));
            }
        }

        let record = ServiceRecord {
            id: String::new(),
            service_name: name.to_string(),
            service_version: version.to_string(),
            ip: ip.to_string(),
            port,
            status: ServiceStatus::Up,
            register_time: now,
            last_heartbeat: now,
            virtual_domain,
            rate_limit_enabled: false,
            max_requests_per_second: 0,
            rate_limit_error_message: DEFAULT_RATE_LIMIT_MESSAGE.to_string(),
        };
        info!("Registered service {} (v{}) - {}:{}", name, version, ip, port);
        self.store.put(record).await
    }

    /// Soft-deregister by tuple: the record is kept with status DOWN.
    /// Returns false only when the tuple is unknown, so repeated calls on a
    /// known tuple keep reporting true.
    pub async fn deregister(
        &self,
        name: &str,
        version: &str,
        ip: &str,
        port: u16,
    ) -> Result<bool> {
        match self.store.get_by_tuple(name, version, ip, port).await? {
            Some(mut record) => {
                record.status = ServiceStatus::Down;
                info!(
                    "Service manually set offline: {} (v{}) - {}:{}",
                    name, version, ip, port
                );
                self.store.put(record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Soft-deregister by identifier, same semantics as [`Self::deregister`].
    pub async fn deregister_by_id(&self, id: &str) -> Result<bool> {
        match self.store.get(id).await? {
            Some(mut record) => {
                record.status = ServiceStatus::Down;
                info!(
                    "Service manually set offline by id: {} (v{}) - {}:{}",
                    record.service_name, record.service_version, record.ip, record.port
                );
                self.store.put(record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Tuple-keyed heartbeat: refreshes the timestamp only, never the
    /// status. The id-keyed variant additionally forces the instance UP;
    /// the two call paths serve different clients and the asymmetry is
    /// part of the contract.
    pub async fn heartbeat(
        &self,
        name: &str,
        version: &str,
        ip: &str,
        port: u16,
    ) -> Result<bool> {
        match self.store.get_by_tuple(name, version, ip, port).await? {
            Some(mut record) => {
                record.last_heartbeat = self.clock.now();
                self.store.put(record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Id-keyed heartbeat: refreshes the timestamp and marks the instance
    /// UP (a heartbeat implies liveness on this path).
    pub async fn heartbeat_by_id(&self, id: &str) -> Result<bool> {
        match self.store.get(id).await? {
            Some(mut record) => {
                record.last_heartbeat = self.clock.now();
                record.status = ServiceStatus::Up;
                self.store.put(record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Explicitly mark an instance UP and refresh its heartbeat.
    pub async fn set_online(&self, id: &str) -> Result<bool> {
        match self.store.get(id).await? {
            Some(mut record) => {
                record.status = ServiceStatus::Up;
                record.last_heartbeat = self.clock.now();
                self.store.put(record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn is_online(&self, id: &str) -> Result<bool> {
        Ok(self
            .store
            .get(id)
            .await?
            .map(|r| r.status == ServiceStatus::Up)
            .unwrap_or(false))
    }

    pub async fn find_by_virtual_domain(&self, domain: &str) -> Result<Option<ServiceRecord>> {
        if domain.is_empty() {
            return Ok(None);
        }
        Ok(self
            .store
            .scan()
            .await?
            .into_iter()
            .find(|r| r.virtual_domain.as_deref() == Some(domain)))
    }

    /// All records for a name; version narrows to one version when given.
    pub async fn find_by_name_and_version(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Vec<ServiceRecord>> {
        Ok(self
            .store
            .scan()
            .await?
            .into_iter()
            .filter(|r| {
                r.service_name == name && version.map_or(true, |v| r.service_version == v)
            })
            .collect())
    }

    pub async fn list_all(&self) -> Result<Vec<ServiceRecord>> {
        self.store.scan().await
    }

    /// Update the limiter configuration. The stored error message is only
    /// replaced when a non-empty one is supplied.
    pub async fn set_rate_limit(
        &self,
        id: &str,
        enabled: bool,
        max_requests_per_second: u32,
        error_message: Option<String>,
    ) -> Result<bool> {
        match self.store.get(id).await? {
            Some(mut record) => {
                record.rate_limit_enabled = enabled;
                record.max_requests_per_second = max_requests_per_second;
                if let Some(message) = error_message.filter(|m| !m.is_empty()) {
                    record.rate_limit_error_message = message;
                }
                debug!(
                    "Rate limit for {} set to enabled={} max_rps={}",
                    record.tuple_key(),
                    enabled,
                    max_requests_per_second
                );
                self.store.put(record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn enable_rate_limit(&self, id: &str, max_requests_per_second: u32) -> Result<bool> {
        self.set_rate_limit(id, true, max_requests_per_second, None)
            .await
    }

    pub async fn disable_rate_limit(&self, id: &str) -> Result<bool> {
        self.set_rate_limit(id, false, 0, None).await
    }

    pub async fn get_rate_limit(&self, id: &str) -> Result<Option<RateLimitConfig>> {
        Ok(self.store.get(id).await?.map(|r| RateLimitConfig {
            enabled: r.rate_limit_enabled,
            max_requests_per_second: r.max_requests_per_second,
            error_message: r.rate_limit_error_message,
        }))
    }

    /// Rebind or clear a record's virtual domain. Fails (false) when the
    /// domain is already held by a different record; clearing always
    /// succeeds. On failure both records are left untouched.
    pub async fn update_virtual_domain(&self, id: &str, domain: Option<String>) -> Result<bool> {
        let domain = normalize_domain(domain);
        let Some(mut record) = self.store.get(id).await? else {
            return Ok(false);
        };

        if let Some(requested) = &domain {
            if let Some(holder) = self.find_by_virtual_domain(requested).await? {
                if holder.id != id {
                    warn!(
                        "Virtual domain {} already bound to record {}",
                        requested, holder.id
                    );
                    return Ok(false);
                }
            }
        }

        record.virtual_domain = domain;
        self.store.put(record).await?;
        Ok(true)
    }
}

fn normalize_domain(domain: Option<String>) -> Option<String> {
    domain.filter(|d| !d.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::{DateTime, Duration};

    fn setup() -> (ServiceRegistry, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let registry = ServiceRegistry::new(store.clone(), clock.clone());
        (registry, store, clock)
    }

    #[tokio::test]
    async fn test_register_creates_record() {
        let (registry, store, _) = setup();
        let record = registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();

        assert!(!record.id.is_empty());
        assert_eq!(record.status, ServiceStatus::Up);
        assert_eq!(record.register_time, record.last_heartbeat);
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_reregister_same_tuple_never_duplicates() {
        let (registry, store, clock) = setup();
        let first = registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();

        clock.advance(Duration::seconds(10));
        registry
            .deregister("orders", "1.0", "10.0.0.1", 8080)
            .await
            .unwrap();

        let second = registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.status, ServiceStatus::Up);
        assert!(second.last_heartbeat > first.last_heartbeat);
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_reregister_overwrites_virtual_domain() {
        let (registry, _, _) = setup();
        registry
            .register("orders", "1.0", "10.0.0.1", 8080, Some("orders.internal".into()))
            .await
            .unwrap();

        // Re-registering without a domain clears the binding.
        let record = registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();
        assert_eq!(record.virtual_domain, None);
        assert!(registry
            .find_by_virtual_domain("orders.internal")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_register_takes_over_ip_port() {
        let (registry, store, _) = setup();
        let old = registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();

        // New identity on the same ip:port rewrites the existing record.
        let redeployed = registry
            .register("billing", "2.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();

        assert_eq!(redeployed.id, old.id);
        assert_eq!(redeployed.service_name, "billing");
        assert_eq!(redeployed.service_version, "2.0");
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_takeover_evicts_domain_holder() {
        let (registry, store, _) = setup();
        registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();
        registry
            .register("legacy", "1.0", "10.0.0.9", 9090, Some("shop.internal".into()))
            .await
            .unwrap();

        // Redeployment on 10.0.0.1:8080 claims the domain; the old holder
        // is removed to keep the binding unique.
        let record = registry
            .register("shop", "3.0", "10.0.0.1", 8080, Some("shop.internal".into()))
            .await
            .unwrap();

        assert_eq!(record.virtual_domain.as_deref(), Some("shop.internal"));
        assert_eq!(store.count().await, 1);
        let holder = registry
            .find_by_virtual_domain("shop.internal")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(holder.id, record.id);
    }

    #[tokio::test]
    async fn test_fresh_register_rejects_bound_domain() {
        let (registry, store, _) = setup();
        registry
            .register("orders", "1.0", "10.0.0.1", 8080, Some("orders.internal".into()))
            .await
            .unwrap();

        let result = registry
            .register("billing", "1.0", "10.0.0.2", 8080, Some("orders.internal".into()))
            .await;

        assert!(matches!(result, Err(RegistryError::DomainConflict(_))));
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent_in_effect() {
        let (registry, _, _) = setup();
        registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();

        // Deregister is an unconditional set-DOWN-if-present, so both calls
        // report the tuple as found.
        assert!(registry
            .deregister("orders", "1.0", "10.0.0.1", 8080)
            .await
            .unwrap());
        assert!(registry
            .deregister("orders", "1.0", "10.0.0.1", 8080)
            .await
            .unwrap());
        assert!(!registry
            .deregister("orders", "9.9", "10.0.0.1", 8080)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_updates_time_only() {
        let (registry, store, clock) = setup();
        let record = registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();
        registry.deregister_by_id(&record.id).await.unwrap();

        clock.advance(Duration::seconds(5));
        assert!(registry
            .heartbeat("orders", "1.0", "10.0.0.1", 8080)
            .await
            .unwrap());

        // The tuple-keyed path does not revive a DOWN record.
        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServiceStatus::Down);
        assert_eq!(stored.last_heartbeat, clock.now());
    }

    #[tokio::test]
    async fn test_heartbeat_by_id_forces_up() {
        let (registry, store, clock) = setup();
        let record = registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();
        registry.deregister_by_id(&record.id).await.unwrap();

        clock.advance(Duration::seconds(5));
        assert!(registry.heartbeat_by_id(&record.id).await.unwrap());

        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ServiceStatus::Up);
        assert_eq!(stored.last_heartbeat, clock.now());
    }

    #[tokio::test]
    async fn test_find_by_name_and_version() {
        let (registry, _, _) = setup();
        registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();
        registry
            .register("orders", "2.0", "10.0.0.2", 8080, None)
            .await
            .unwrap();
        registry
            .register("billing", "1.0", "10.0.0.3", 8080, None)
            .await
            .unwrap();

        let all_versions = registry
            .find_by_name_and_version("orders", None)
            .await
            .unwrap();
        assert_eq!(all_versions.len(), 2);

        let one = registry
            .find_by_name_and_version("orders", Some("2.0"))
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].service_version, "2.0");
    }

    #[tokio::test]
    async fn test_update_virtual_domain_conflict_leaves_both_unchanged() {
        let (registry, store, _) = setup();
        let holder = registry
            .register("orders", "1.0", "10.0.0.1", 8080, Some("orders.internal".into()))
            .await
            .unwrap();
        let other = registry
            .register("billing", "1.0", "10.0.0.2", 8080, Some("billing.internal".into()))
            .await
            .unwrap();

        assert!(!registry
            .update_virtual_domain(&other.id, Some("orders.internal".into()))
            .await
            .unwrap());

        let holder_after = store.get(&holder.id).await.unwrap().unwrap();
        let other_after = store.get(&other.id).await.unwrap().unwrap();
        assert_eq!(holder_after.virtual_domain.as_deref(), Some("orders.internal"));
        assert_eq!(other_after.virtual_domain.as_deref(), Some("billing.internal"));
    }

    #[tokio::test]
    async fn test_update_virtual_domain_clear_and_rebind_self() {
        let (registry, store, _) = setup();
        let record = registry
            .register("orders", "1.0", "10.0.0.1", 8080, Some("orders.internal".into()))
            .await
            .unwrap();

        // Rebinding to the domain the record already holds succeeds.
        assert!(registry
            .update_virtual_domain(&record.id, Some("orders.internal".into()))
            .await
            .unwrap());

        // Clearing always succeeds.
        assert!(registry
            .update_virtual_domain(&record.id, None)
            .await
            .unwrap());
        assert_eq!(
            store.get(&record.id).await.unwrap().unwrap().virtual_domain,
            None
        );

        assert!(!registry
            .update_virtual_domain("no-such-id", None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_rate_limit_config_roundtrip() {
        let (registry, _, _) = setup();
        let record = registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();

        assert!(registry
            .set_rate_limit(&record.id, true, 100, Some("Slow down".into()))
            .await
            .unwrap());
        let config = registry.get_rate_limit(&record.id).await.unwrap().unwrap();
        assert!(config.enabled);
        assert_eq!(config.max_requests_per_second, 100);
        assert_eq!(config.error_message, "Slow down");

        // An absent message keeps the stored one.
        assert!(registry.disable_rate_limit(&record.id).await.unwrap());
        let config = registry.get_rate_limit(&record.id).await.unwrap().unwrap();
        assert!(!config.enabled);
        assert_eq!(config.max_requests_per_second, 0);
        assert_eq!(config.error_message, "Slow down");

        assert!(registry.get_rate_limit("no-such-id").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_online_and_is_online() {
        let (registry, _, _) = setup();
        let record = registry
            .register("orders", "1.0", "10.0.0.1", 8080, None)
            .await
            .unwrap();
        assert!(registry.is_online(&record.id).await.unwrap());

        registry.deregister_by_id(&record.id).await.unwrap();
        assert!(!registry.is_online(&record.id).await.unwrap());

        assert!(registry.set_online(&record.id).await.unwrap());
        assert!(registry.is_online(&record.id).await.unwrap());
        assert!(!registry.is_online("no-such-id").await.unwrap());
    }
}
