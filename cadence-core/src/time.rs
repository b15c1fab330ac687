//! Time sources for the playback loop
//!
//! All loop timing is in floating point seconds from an arbitrary origin.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

pub trait TimeSource: Send + Sync {
    /// Monotonic seconds
    fn now(&self) -> f64;
}

/// Wall clock backed by `Instant`
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Clock advanced by hand, for deterministic runs
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, secs: f64) {
        *self.now.lock() += secs;
    }

    pub fn set(&self, secs: f64) {
        *self.now.lock() = secs;
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}
