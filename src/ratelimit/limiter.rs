//! Per-tier rate limiter.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use super::fixed_window::FixedWindowController;
use super::tiers::{Algorithm, Tier};
use super::token_bucket::TokenBucketController;
use super::transaction::StateAccess;
use crate::clock::Clock;
use crate::error::QuotaError;
use crate::store::QuotaStore;

/// Default prefix for store keys.
pub const DEFAULT_KEY_PREFIX: &str = "tollgate:";
/// Default bound on a single store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);
/// Default floor on compare-and-swap attempts per check.
pub const DEFAULT_MAX_CAS_ATTEMPTS: u32 = 16;
/// Default state lifetime, in periods.
pub const DEFAULT_TTL_PERIODS: u32 = 2;

/// Settings shared by every tier's limiter.
#[derive(Debug, Clone)]
pub struct LimiterOptions {
    /// Prepended to `{tier}:{subject}` to form the store key
    pub key_prefix: String,
    /// Upper bound on each store call
    pub store_timeout: Duration,
    /// Compare-and-swap attempts before giving up on a contended subject.
    /// Raised per tier so that conflicts alone never exhaust it; see
    /// [`LimiterOptions::cas_attempts`].
    pub max_cas_attempts: u32,
    /// State expires this many periods after its last write (at least one)
    pub ttl_periods: u32,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            max_cas_attempts: DEFAULT_MAX_CAS_ATTEMPTS,
            ttl_periods: DEFAULT_TTL_PERIODS,
        }
    }
}

impl LimiterOptions {
    /// Compare-and-swap attempts allowed for a tier of `capacity`.
    ///
    /// A lost race means another request was admitted, and at most
    /// `capacity` are admitted per period. `2 * capacity + 1` attempts
    /// therefore outlast every conflict a check can meet, even one that
    /// straddles a period boundary.
    pub fn cas_attempts(&self, capacity: u64) -> u32 {
        let needed = capacity.saturating_mul(2).saturating_add(1);
        self.max_cas_attempts
            .max(u32::try_from(needed).unwrap_or(u32::MAX))
    }

    fn ttl(&self, period: u64) -> Duration {
        Duration::from_secs(period.saturating_mul(u64::from(self.ttl_periods.max(1))))
    }
}

/// Remaining quota for a subject at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    /// Requests still admissible before the reset
    pub remaining: u64,
    /// Unix time (seconds) at which the quota resets
    pub resets_at: i64,
}

/// The single controller a tier runs.
#[derive(Clone)]
enum Controller {
    TokenBucket(TokenBucketController),
    FixedWindow(FixedWindowController),
}

/// Admission check for one tier.
///
/// Holds exactly one controller, chosen from the tier's algorithm when the
/// limiter is built. The limiter keeps no subject state of its own; every
/// decision reads and writes the shared store, so it is cheap to clone and
/// safe to share across tasks.
#[derive(Clone)]
pub struct RateLimiter {
    tier: String,
    algorithm: Algorithm,
    controller: Controller,
}

impl RateLimiter {
    /// Create the limiter for `tier`.
    pub fn new(
        tier_name: &str,
        tier: &Tier,
        store: Arc<dyn QuotaStore>,
        clock: Arc<dyn Clock>,
        options: &LimiterOptions,
    ) -> Self {
        let period = tier.period();
        let capacity = tier.capacity();
        let state = StateAccess::new(
            store,
            options.store_timeout,
            options.cas_attempts(capacity),
        );
        let key_prefix = format!("{}{}:", options.key_prefix, tier_name);
        let ttl = options.ttl(period);

        debug!(
            tier = %tier_name,
            algorithm = %tier.algo,
            period = period,
            capacity = capacity,
            "Creating rate limiter"
        );

        let controller = match tier.algo {
            Algorithm::TokenBucket => Controller::TokenBucket(TokenBucketController::new(
                state, clock, key_prefix, period, capacity, ttl,
            )),
            Algorithm::FixedWindow => Controller::FixedWindow(FixedWindowController::new(
                state, clock, key_prefix, period, capacity, ttl,
            )),
        };

        Self {
            tier: tier_name.to_string(),
            algorithm: tier.algo,
            controller,
        }
    }

    /// Name of the tier this limiter enforces.
    pub fn tier(&self) -> &str {
        &self.tier
    }

    /// Algorithm this limiter runs.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Admit or deny one request from `subject_id`.
    ///
    /// Any failure to verify the quota denies the request.
    pub async fn check_limit(&self, subject_id: &str) -> bool {
        match self.try_acquire(subject_id).await {
            Ok(()) => true,
            Err(QuotaError::LimitExceeded { .. }) => false,
            Err(e @ QuotaError::Contention { .. }) => {
                warn!(tier = %self.tier, subject = %subject_id, error = %e, "Denying contended request");
                false
            }
            Err(e) => {
                error!(tier = %self.tier, subject = %subject_id, error = %e, "Quota check failed, denying request");
                false
            }
        }
    }

    /// Admit one request from `subject_id`, or say why not.
    ///
    /// `QuotaError::LimitExceeded` is the only error that reflects the
    /// subject's own behavior; map it to a "too many requests" response.
    pub async fn try_acquire(&self, subject_id: &str) -> Result<(), QuotaError> {
        trace!(tier = %self.tier, subject = %subject_id, "Checking rate limit");

        let admitted = match &self.controller {
            Controller::TokenBucket(controller) => controller.accept(subject_id).await?,
            Controller::FixedWindow(controller) => controller.accept(subject_id).await?,
        };

        if admitted {
            Ok(())
        } else {
            debug!(tier = %self.tier, subject = %subject_id, "Rate limit exceeded");
            Err(QuotaError::LimitExceeded {
                subject: subject_id.to_string(),
                tier: self.tier.clone(),
            })
        }
    }

    /// Current quota for `subject_id`, without consuming any.
    pub async fn peek(&self, subject_id: &str) -> Result<QuotaSnapshot, QuotaError> {
        match &self.controller {
            Controller::TokenBucket(controller) => controller.peek(subject_id).await,
            Controller::FixedWindow(controller) => controller.peek(subject_id).await,
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("tier", &self.tier)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}
