//! Injectable time source
//!
//! The registry, the heartbeat monitor and the rate limiter all branch on
//! elapsed time; routing every read through this trait lets tests drive
//! those branches without real sleeps.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Whole seconds since the Unix epoch, the granularity the fixed-window
    /// rate limiter works in.
    fn epoch_secs(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Test support.
#[derive(Debug)]
pub struct ManualClock {
    epoch_millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            epoch_millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, delta: Duration) {
        self.epoch_millis
            .fetch_add(delta.num_milliseconds(), Ordering::SeqCst);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        self.epoch_millis
            .store(to.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.epoch_millis.load(Ordering::SeqCst))
            .unwrap_or_default()
    }
}
