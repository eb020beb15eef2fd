//! Time sources for quota decisions.
//!
//! All persisted quota state uses whole unix seconds, so the clock hands out
//! `i64` epoch seconds rather than `Instant`s.

use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;

/// Source of the current time in unix seconds.
pub trait Clock: Send + Sync + Debug {
    /// Current time as seconds since the unix epoch.
    fn now(&self) -> i64;
}

/// Wall clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Manually driven clock for tests and simulations.
///
/// Clones share the same underlying time, so advancing one clone advances
/// all of them.
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    current: Arc<AtomicI64>,
}

impl MockClock {
    /// Create a mock clock starting at `start` unix seconds.
    pub fn new(start: i64) -> Self {
        Self {
            current: Arc::new(AtomicI64::new(start)),
        }
    }

    /// Move the clock forward by `secs` seconds.
    pub fn advance(&self, secs: i64) {
        self.current.fetch_add(secs, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, now: i64) {
        self.current.store(now, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }
}
