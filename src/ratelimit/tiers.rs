//! Tier configuration and lookup.
//!
//! A tier names a quota policy: which algorithm to run and with what period
//! and capacity. Tiers are loaded from YAML or JSON shaped like:
//!
//! ```yaml
//! basic:
//!   algo: TokenBucket
//!   period: 60
//!   capacity: 5
//! burst:
//!   algo: FixedWindow
//!   period: 10
//!   capacity: 100
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::limiter::{LimiterOptions, RateLimiter};
use crate::clock::Clock;
use crate::error::{Result, TollgateError};
use crate::store::QuotaStore;

/// Period used when a tier leaves it unset or zero.
pub const DEFAULT_PERIOD_SECS: u64 = 30;
/// Capacity used when a tier leaves it unset or zero.
pub const DEFAULT_CAPACITY: u64 = 5;
/// Longest accepted period: one year.
pub const MAX_PERIOD_SECS: u64 = 365 * 24 * 60 * 60;

/// Admission algorithm a tier runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    TokenBucket,
    FixedWindow,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Algorithm::TokenBucket => write!(f, "TokenBucket"),
            Algorithm::FixedWindow => write!(f, "FixedWindow"),
        }
    }
}

/// A named quota policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub algo: Algorithm,
    /// Refill period or window size in seconds; zero means the default
    #[serde(default)]
    pub period: u64,
    /// Tokens per period or requests per window; zero means the default
    #[serde(default)]
    pub capacity: u64,
}

impl Tier {
    pub fn new(algo: Algorithm, period: u64, capacity: u64) -> Self {
        Self {
            algo,
            period,
            capacity,
        }
    }

    /// Period in seconds, never zero and never above [`MAX_PERIOD_SECS`].
    pub fn period(&self) -> u64 {
        if self.period == 0 {
            DEFAULT_PERIOD_SECS
        } else {
            self.period.min(MAX_PERIOD_SECS)
        }
    }

    /// Capacity, never zero.
    pub fn capacity(&self) -> u64 {
        if self.capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            self.capacity
        }
    }

    /// Reject settings that would otherwise be silently clamped.
    pub fn validate(&self) -> Result<()> {
        self.check().map_err(TollgateError::Config)
    }

    fn check(&self) -> std::result::Result<(), String> {
        if self.period > MAX_PERIOD_SECS {
            return Err(format!(
                "period {}s exceeds the maximum of {}s",
                self.period, MAX_PERIOD_SECS
            ));
        }
        Ok(())
    }
}

/// All configured tiers, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierRegistry {
    tiers: HashMap<String, Tier>,
}

impl TierRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load tiers from a YAML or JSON file, chosen by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading tier configuration");

        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    /// Load tiers from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse tier config: {}", e)))
    }

    /// Load tiers from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| TollgateError::Config(format!("Failed to parse tier config: {}", e)))
    }

    /// Load tiers from a JSON document held in an environment variable.
    pub fn from_env(var: &str) -> Result<Self> {
        let json = std::env::var(var)
            .map_err(|e| TollgateError::Config(format!("{} is not usable: {}", var, e)))?;
        Self::from_json(&json)
    }

    /// Add or replace a tier.
    pub fn insert(&mut self, name: impl Into<String>, tier: Tier) {
        self.tiers.insert(name.into(), tier);
    }

    /// Look up a tier by name.
    pub fn get(&self, name: &str) -> Option<&Tier> {
        self.tiers.get(name)
    }

    /// Tier names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tiers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Check every tier, naming the first bad one.
    pub fn validate(&self) -> Result<()> {
        for name in self.names() {
            if let Some(tier) = self.tiers.get(name) {
                tier.check()
                    .map_err(|e| TollgateError::Config(format!("Invalid tier {}: {}", name, e)))?;
            }
        }
        Ok(())
    }

    /// Fold another registry into this one; its tiers win on name clashes.
    pub fn merge(&mut self, other: TierRegistry) {
        self.tiers.extend(other.tiers);
    }

    /// Build the rate limiter for one tier.
    pub fn limiter(
        &self,
        name: &str,
        store: Arc<dyn QuotaStore>,
        clock: Arc<dyn Clock>,
        options: &LimiterOptions,
    ) -> Result<RateLimiter> {
        let tier = self
            .get(name)
            .ok_or_else(|| TollgateError::Config(format!("Unknown tier: {}", name)))?;
        tier.validate()?;
        Ok(RateLimiter::new(name, tier, store, clock, options))
    }

    /// Build one rate limiter per tier, all sharing `store` and `clock`.
    pub fn build_limiters(
        &self,
        store: Arc<dyn QuotaStore>,
        clock: Arc<dyn Clock>,
        options: &LimiterOptions,
    ) -> HashMap<String, RateLimiter> {
        self.tiers
            .iter()
            .map(|(name, tier)| {
                let limiter =
                    RateLimiter::new(name, tier, Arc::clone(&store), Arc::clone(&clock), options);
                (name.clone(), limiter)
            })
            .collect()
    }
}
