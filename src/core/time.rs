//! Wall-clock injection.
//!
//! The rate estimator divides message counts by wall-clock windows, so the
//! clock must be swappable for tests. Microsecond resolution because the
//! averaging windows are measured in microseconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub trait ClockSource: Send + Sync {
    fn now_micros(&self) -> u64;
}

/// System wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }
}

/// Hand-advanced clock for tests.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_micros: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_micros)),
        }
    }

    pub fn advance_micros(&self, delta: u64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_micros(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now_micros(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
