//! Tollgate - Tiered Request Admission Control
//!
//! This crate decides whether a subject (a user, an API key) may make another
//! request under a named tier's quota. Quota state lives in a shared,
//! TTL-bounded key-value store and is updated with compare-and-swap, so many
//! service instances can enforce one quota consistently.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use clock::{Clock, MockClock, SystemClock};
pub use error::{QuotaError, TollgateError};
pub use ratelimit::{Algorithm, LimiterOptions, RateLimiter, Tier, TierRegistry};
pub use store::{MemoryStore, QuotaStore};
