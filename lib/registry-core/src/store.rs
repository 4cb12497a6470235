//! Record storage interface and in-memory implementation

use crate::record::ServiceRecord;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Durable storage for registry records.
///
/// The registry treats storage as an external collaborator: records are
/// read and written only through this interface, keyed by identifier or by
/// the (name, version, ip, port) tuple. Individual calls are atomic; the
/// composite uniqueness invariants are maintained by the registry's
/// read-then-write sequences on top of it.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ServiceRecord>>;

    async fn get_by_tuple(
        &self,
        name: &str,
        version: &str,
        ip: &str,
        port: u16,
    ) -> Result<Option<ServiceRecord>>;

    async fn scan(&self) -> Result<Vec<ServiceRecord>>;

    /// Insert or update a record. An empty id means create; the store
    /// assigns the identifier and returns the stored value.
    async fn put(&self, record: ServiceRecord) -> Result<ServiceRecord>;

    /// Remove a record. Returns false when the id is unknown.
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// In-memory record store backing the default runtime and tests.
pub struct MemoryStore {
    records: Arc<RwLock<HashMap<String, ServiceRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<ServiceRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn get_by_tuple(
        &self,
        name: &str,
        version: &str,
        ip: &str,
        port: u16,
    ) -> Result<Option<ServiceRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.matches_tuple(name, version, ip, port))
            .cloned())
    }

    async fn scan(&self) -> Result<Vec<ServiceRecord>> {
        let mut records: Vec<ServiceRecord> =
            self.records.read().await.values().cloned().collect();
        // Stable listing order for clients and for "first record" fallbacks.
        records.sort_by(|a, b| a.register_time.cmp(&b.register_time));
        Ok(records)
    }

    async fn put(&self, mut record: ServiceRecord) -> Result<ServiceRecord> {
        if record.id.is_empty() {
            record.id = Uuid::new_v4().to_string();
        }
        let mut records = self.records.write().await;
        records.insert(record.id.clone(), record.clone());
        debug!("Stored record {} ({})", record.id, record.tuple_key());
        Ok(record)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.records.write().await.remove(id).is_some();
        if removed {
            debug!("Deleted record {}", id);
        }
        Ok(removed)
    }
}
