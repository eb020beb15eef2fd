//! Shared quota store.
//!
//! The store is the single source of truth for subject state. It is a plain
//! key-value map with per-key expiry plus one atomic primitive,
//! [`QuotaStore::compare_and_swap`], which the controllers use so that two
//! instances racing on the same subject can never both commit a decision
//! made from the same snapshot.

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QuotaError;

/// Key-value store with per-key time-to-live.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Read the value for `key`.
    ///
    /// `Ok(None)` means there is no live value, which is not an error.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, QuotaError>;

    /// Unconditionally write `value`, resetting its expiry to `ttl` from now.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), QuotaError>;

    /// Write `value` only if the live value still equals `expected`.
    ///
    /// `expected = None` requires the key to be absent (or expired). Returns
    /// `Ok(false)` without writing when another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, QuotaError>;
}
