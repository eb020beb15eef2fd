//! Admission decisions and the state they persist.

pub mod codec;
mod fixed_window;
mod limiter;
mod tiers;
mod token_bucket;
mod transaction;

pub use fixed_window::{FixedWindowController, WindowState};
pub use limiter::{
    LimiterOptions, QuotaSnapshot, RateLimiter, DEFAULT_KEY_PREFIX, DEFAULT_MAX_CAS_ATTEMPTS,
    DEFAULT_STORE_TIMEOUT, DEFAULT_TTL_PERIODS,
};
pub use tiers::{
    Algorithm, Tier, TierRegistry, DEFAULT_CAPACITY, DEFAULT_PERIOD_SECS, MAX_PERIOD_SECS,
};
pub use token_bucket::{TokenBucketController, TokenBucketState};
