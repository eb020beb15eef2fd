//! In-process quota store.
//!
//! Suitable for a single instance and for tests. Expiry is evaluated against
//! the injected [`Clock`], so simulated time also expires entries. Expired
//! entries are dropped when read, and a full sweep runs every
//! [`SWEEP_INTERVAL`] writes so abandoned subjects do not accumulate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::QuotaStore;
use crate::clock::Clock;
use crate::error::QuotaError;

/// Writes between two sweeps of expired entries.
pub const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: i64,
}

impl StoredValue {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at > now
    }
}

/// Sharded in-memory store with per-key expiry.
///
/// Compare-and-swap runs while holding the shard lock for the key, which
/// makes it atomic with respect to every other operation on that key.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, StoredValue>>,
    writes: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            writes: Arc::new(AtomicU64::new(0)),
            clock,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    /// Whether the store holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time-to-live for `key`, in seconds.
    pub fn ttl(&self, key: &str) -> Option<i64> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.expires_at.saturating_sub(now))
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, v| v.is_live(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed = removed, remaining = self.entries.len(), "Swept expired entries");
        }
        removed
    }

    fn expiry(&self, ttl: Duration) -> i64 {
        let secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        self.clock.now().saturating_add(secs)
    }

    /// Count a write and sweep once every `SWEEP_INTERVAL` of them.
    ///
    /// Must not be called while holding a guard into `entries`.
    fn record_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_INTERVAL == 0 {
            self.purge_expired();
        }
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, QuotaError> {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }

        // The shard read guard is released by now.
        trace!(key = %key, "Purging expired entry");
        self.entries.remove_if(key, |_, v| !v.is_live(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), QuotaError> {
        let stored = StoredValue {
            value: value.to_vec(),
            expires_at: self.expiry(ttl),
        };
        self.entries.insert(key.to_string(), stored);
        self.record_write();
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, QuotaError> {
        let now = self.clock.now();
        let stored = StoredValue {
            value: value.to_vec(),
            expires_at: self.expiry(ttl),
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let matches = match expected {
                    None => !current.is_live(now),
                    Some(expected) => current.is_live(now) && current.value == expected,
                };
                if !matches {
                    return Ok(false);
                }
                occupied.insert(stored);
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(stored);
            }
        }
        self.record_write();
        Ok(true)
    }
}
