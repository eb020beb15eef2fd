//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, TollgateError};
use crate::ratelimit::{
    LimiterOptions, TierRegistry, DEFAULT_KEY_PREFIX, DEFAULT_MAX_CAS_ATTEMPTS, DEFAULT_TTL_PERIODS,
};

/// Environment variable holding extra tiers as JSON.
pub const TIER_CONFIG_ENV: &str = "TIER_CONFIG";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Quota store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiter behavior shared by all tiers
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Optional path to a separate tier file (YAML or JSON)
    #[serde(default)]
    pub tiers_path: Option<String>,

    /// Inline tiers
    ///
    /// Keys pass through the config layer, which lower-cases them; put tiers
    /// with case-sensitive names in `tiers_path` instead.
    #[serde(default)]
    pub tiers: TierRegistry,
}

/// Which quota store implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store; state is not shared between instances
    #[default]
    Memory,
    /// Shared Redis store
    Redis,
}

/// Quota store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Timeout for a single store round trip in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_timeout_ms() -> u64 {
    500
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Prefix for all store keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Compare-and-swap attempts before a contended check is denied
    #[serde(default = "default_max_cas_attempts")]
    pub max_cas_attempts: u32,

    /// State lifetime in periods after the last write
    #[serde(default = "default_ttl_periods")]
    pub ttl_periods: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            max_cas_attempts: default_max_cas_attempts(),
            ttl_periods: default_ttl_periods(),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_max_cas_attempts() -> u32 {
    DEFAULT_MAX_CAS_ATTEMPTS
}

fn default_ttl_periods() -> u32 {
    DEFAULT_TTL_PERIODS
}

impl TollgateConfig {
    /// Load configuration from a file, with `TOLLGATE__*` environment
    /// variables layered on top (e.g. `TOLLGATE__STORE__BACKEND=redis`).
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            let path = path.as_ref();
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(::config::File::from(path));
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("TOLLGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Store round-trip timeout.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }

    /// Options for building rate limiters.
    pub fn limiter_options(&self) -> LimiterOptions {
        LimiterOptions {
            key_prefix: self.limiter.key_prefix.clone(),
            store_timeout: self.store_timeout(),
            max_cas_attempts: self.limiter.max_cas_attempts,
            ttl_periods: self.limiter.ttl_periods,
        }
    }

    /// All tiers: inline ones, then `tiers_path`, then the `TIER_CONFIG`
    /// environment variable. Later sources win on name clashes. The merged
    /// set is validated before it is returned.
    pub fn tier_registry(&self) -> Result<TierRegistry> {
        let mut registry = self.tiers.clone();

        if let Some(path) = &self.tiers_path {
            registry.merge(TierRegistry::from_file(path)?);
        }

        if std::env::var_os(TIER_CONFIG_ENV).is_some() {
            debug!(var = TIER_CONFIG_ENV, "Reading tiers from environment");
            registry.merge(TierRegistry::from_env(TIER_CONFIG_ENV)?);
        }

        registry.validate()?;
        Ok(registry)
    }

    /// Check the configuration for values that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(TollgateError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.limiter.max_cas_attempts == 0 {
            return Err(TollgateError::Config(
                "limiter.max_cas_attempts must be greater than zero".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_empty() {
            return Err(TollgateError::Config(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        self.tiers.validate()
    }
}
