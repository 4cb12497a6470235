//! Fixed-window request-rate admission control
//!
//! Grants up to N requests per discrete wall-clock second per key, with a
//! hard reset at each integer-second boundary. Bursts straddling a
//! boundary may momentarily admit close to 2N. That is an accepted
//! trade-off of the fixed window, not something to smooth over.

use registry_core::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

struct Bucket {
    window_start: i64,
    count: u32,
}

/// Per-key fixed-window counter.
///
/// Each key owns a (window_start, count) pair behind its own lock, so a
/// window reset and an increment can never interleave inconsistently.
/// Keys are never evicted; cardinality is bounded by the number of
/// registered services.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Admit or reject one request for `key`. A max of zero disables
    /// admission control entirely.
    pub fn is_allowed(&self, key: &str, max_per_second: u32) -> bool {
        if max_per_second == 0 {
            return true;
        }

        let now = self.clock.epoch_secs();
        let bucket = self.bucket(key);
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);

        if now > bucket.window_start {
            // First caller past the boundary resets; latecomers racing on
            // the same second see the updated window and fall through.
            bucket.window_start = now;
            bucket.count = 0;
        }

        bucket.count += 1;
        let allowed = bucket.count <= max_per_second;
        if !allowed {
            debug!(
                "Rate limit exceeded for {}: {}/{} this second",
                key, bucket.count, max_per_second
            );
        }
        allowed
    }

    /// Requests counted against `key` in the current window. Diagnostics.
    pub fn current_count(&self, key: &str) -> u32 {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|b| b.lock().unwrap_or_else(PoisonError::into_inner).count)
            .unwrap_or(0)
    }

    pub fn reset(&self, key: &str) {
        self.buckets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn reset_all(&self) {
        self.buckets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self
            .buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return bucket.clone();
        }

        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Bucket {
                    window_start: self.clock.epoch_secs(),
                    count: 0,
                }))
            })
            .clone()
    }
}
