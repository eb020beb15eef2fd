//! Token bucket controller.
//!
//! Each subject owns a bucket of `capacity` tokens. Every admitted request
//! takes one token; once `next_refresh` has passed, the next request finds
//! the bucket refilled. A bucket of capacity `C` therefore admits at most `C`
//! requests per refresh period.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::codec::QuotaState;
use super::limiter::QuotaSnapshot;
use super::transaction::{StateAccess, Verdict};
use crate::clock::Clock;
use crate::error::QuotaError;

/// Persisted state of one subject's bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucketState {
    pub subject_id: String,
    /// Tokens left until `next_refresh`.
    pub tokens: u64,
    pub capacity: u64,
    /// Refill period in seconds.
    pub period: u64,
    /// Unix time (seconds) at which the bucket refills.
    pub next_refresh: i64,
}

impl QuotaState for TokenBucketState {
    fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 || self.period == 0 {
            return Err(format!(
                "degenerate bucket for {}: capacity={} period={}",
                self.subject_id, self.capacity, self.period
            ));
        }
        if self.tokens > self.capacity {
            return Err(format!(
                "bucket for {} holds {} tokens, above capacity {}",
                self.subject_id, self.tokens, self.capacity
            ));
        }
        Ok(())
    }
}

/// Applies the token bucket algorithm to subjects of one tier.
#[derive(Clone)]
pub struct TokenBucketController {
    state: StateAccess,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    period: u64,
    capacity: u64,
    ttl: Duration,
}

impl TokenBucketController {
    pub(crate) fn new(
        state: StateAccess,
        clock: Arc<dyn Clock>,
        key_prefix: String,
        period: u64,
        capacity: u64,
        ttl: Duration,
    ) -> Self {
        Self {
            state,
            clock,
            key_prefix,
            period,
            capacity,
            ttl,
        }
    }

    /// Decide whether `subject_id` may make another request.
    ///
    /// Returns `Ok(false)` when the bucket is empty. Store and decode
    /// failures are returned as errors so the caller can fail closed.
    pub async fn accept(&self, subject_id: &str) -> Result<bool, QuotaError> {
        let key = self.key(subject_id);

        self.state
            .update(&key, subject_id, self.ttl, |current: Option<&TokenBucketState>| {
                let now = self.clock.now();
                match current {
                    None => {
                        debug!(subject = %subject_id, capacity = self.capacity, "Creating token bucket");
                        Verdict::Admit(self.full_bucket(subject_id, now))
                    }
                    Some(bucket) if now >= bucket.next_refresh => {
                        trace!(subject = %subject_id, "Refilling token bucket");
                        Verdict::Admit(self.full_bucket(subject_id, now))
                    }
                    Some(bucket) if bucket.tokens < 1 => Verdict::Deny,
                    Some(bucket) => Verdict::Admit(TokenBucketState {
                        tokens: bucket.tokens - 1,
                        ..bucket.clone()
                    }),
                }
            })
            .await
    }

    /// Remaining quota for `subject_id` without consuming any.
    pub async fn peek(&self, subject_id: &str) -> Result<QuotaSnapshot, QuotaError> {
        let now = self.clock.now();
        let current = self
            .state
            .load::<TokenBucketState>(&self.key(subject_id))
            .await?;

        Ok(match current {
            Some(stamped) if now < stamped.state.next_refresh => QuotaSnapshot {
                remaining: stamped.state.tokens,
                resets_at: stamped.state.next_refresh,
            },
            _ => QuotaSnapshot {
                remaining: self.capacity,
                resets_at: self.refresh_after(now),
            },
        })
    }

    /// A bucket refilled at `now`, minus the token for the request that
    /// triggered the refill.
    fn full_bucket(&self, subject_id: &str, now: i64) -> TokenBucketState {
        TokenBucketState {
            subject_id: subject_id.to_string(),
            tokens: self.capacity - 1,
            capacity: self.capacity,
            period: self.period,
            next_refresh: self.refresh_after(now),
        }
    }

    fn refresh_after(&self, now: i64) -> i64 {
        now.saturating_add(i64::try_from(self.period).unwrap_or(i64::MAX))
    }

    fn key(&self, subject_id: &str) -> String {
        format!("{}{}", self.key_prefix, subject_id)
    }
}
