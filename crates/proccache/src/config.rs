//! Configuration for the cache, its store, and its task pool
//!
//! ## Loading Strategy
//! - [`ProcCacheConfig::from_env`] reads `PROC_CACHE_*` variables
//! - [`ProcCacheConfig::from_toml_str`] parses an inline TOML document
//! - [`ProcCacheConfig::load_from_file`] reads `.toml` or `.json` files
//!
//! ## Environment Variables
//! - `PROC_CACHE_POOL_SIZE`: task pool size (required, > 0)
//! - `PROC_CACHE_LOADER_TIMEOUT_MS`: loader deadline in milliseconds
//! - `PROC_CACHE_DEFAULT_TTL_MS`: store default entry lifetime
//! - `PROC_CACHE_CLEANUP_INTERVAL_MS`: janitor sweep interval (0 disables)
//!
//! All durations are whole milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::utils::serde::duration_millis;

/// How long the leader waits on a loader before giving up on it
pub const DEFAULT_LOADER_TIMEOUT: Duration = Duration::from_secs(3);

/// Lifetime of entries stored with [`Expiration::Default`](crate::store::Expiration)
pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(5 * 60);

/// Interval between janitor sweeps of expired entries
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

const ENV_POOL_SIZE: &str = "PROC_CACHE_POOL_SIZE";
const ENV_LOADER_TIMEOUT: &str = "PROC_CACHE_LOADER_TIMEOUT_MS";
const ENV_DEFAULT_TTL: &str = "PROC_CACHE_DEFAULT_TTL_MS";
const ENV_CLEANUP_INTERVAL: &str = "PROC_CACHE_CLEANUP_INTERVAL_MS";

/// TTL store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Lifetime applied when a caller does not pick one
    #[serde(with = "duration_millis")]
    pub default_ttl: Duration,

    /// Janitor sweep interval; zero disables the janitor
    #[serde(with = "duration_millis")]
    pub cleanup_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { default_ttl: DEFAULT_ENTRY_TTL, cleanup_interval: DEFAULT_CLEANUP_INTERVAL }
    }
}

impl StoreConfig {
    /// Create a new configuration builder
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    /// Store that never sweeps in the background (expiry stays passive)
    pub fn passive(default_ttl: Duration) -> Self {
        Self { default_ttl, cleanup_interval: Duration::ZERO }
    }
}

/// Builder for [`StoreConfig`] with fluent API
#[derive(Debug, Default)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    /// Set the default entry lifetime
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.config.default_ttl = ttl;
        self
    }

    /// Set the janitor sweep interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    /// Disable the background janitor
    pub fn no_cleanup(mut self) -> Self {
        self.config.cleanup_interval = Duration::ZERO;
        self
    }

    /// Build the configuration
    pub fn build(self) -> StoreConfig {
        self.config
    }
}

/// Top-level configuration consumed by
/// [`Group::initialize`](crate::coalesce::Group::initialize)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcCacheConfig {
    /// Number of concurrent execution slots for loaders and launched tasks
    pub pool_size: usize,

    /// Deadline for a single loader invocation
    #[serde(with = "duration_millis", default = "default_loader_timeout")]
    pub loader_timeout: Duration,

    /// Store settings
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_loader_timeout() -> Duration {
    DEFAULT_LOADER_TIMEOUT
}

impl ProcCacheConfig {
    /// Defaults for everything except the pool size, which has none
    pub fn with_pool_size(pool_size: usize) -> Self {
        Self { pool_size, loader_timeout: DEFAULT_LOADER_TIMEOUT, store: StoreConfig::default() }
    }

    /// Override the loader deadline
    #[must_use]
    pub fn loader_timeout(mut self, timeout: Duration) -> Self {
        self.loader_timeout = timeout;
        self
    }

    /// Override the store settings
    #[must_use]
    pub fn store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Check invariants that cannot be expressed in the type
    ///
    /// # Errors
    /// Returns `CacheError::Config` for a zero pool size or zero loader
    /// timeout.
    pub fn validate(&self) -> CacheResult<()> {
        if self.pool_size == 0 {
            return Err(CacheError::config_field("pool_size", "must be greater than 0"));
        }
        if self.loader_timeout.is_zero() {
            return Err(CacheError::config_field("loader_timeout", "must be greater than 0"));
        }
        Ok(())
    }

    /// Load configuration from `PROC_CACHE_*` environment variables
    ///
    /// # Errors
    /// Returns `CacheError::Config` if the pool size is missing or any value
    /// fails to parse.
    pub fn from_env() -> CacheResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    ///
    /// # Errors
    /// Same as [`ProcCacheConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> CacheResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pool_size = lookup(ENV_POOL_SIZE)
            .ok_or_else(|| CacheError::config_field("pool_size", format!("{ENV_POOL_SIZE} is not set")))
            .and_then(|raw| {
                raw.trim().parse::<usize>().map_err(|e| {
                    CacheError::config_field("pool_size", format!("invalid pool size: {e}"))
                })
            })?;

        let mut config = Self::with_pool_size(pool_size);
        if let Some(timeout) = millis_var(&lookup, ENV_LOADER_TIMEOUT, "loader_timeout")? {
            config.loader_timeout = timeout;
        }
        if let Some(ttl) = millis_var(&lookup, ENV_DEFAULT_TTL, "store.default_ttl")? {
            config.store.default_ttl = ttl;
        }
        if let Some(interval) =
            millis_var(&lookup, ENV_CLEANUP_INTERVAL, "store.cleanup_interval")?
        {
            config.store.cleanup_interval = interval;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML document
    ///
    /// # Errors
    /// Returns `CacheError::Config` on malformed TOML or failed validation.
    pub fn from_toml_str(contents: &str) -> CacheResult<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| CacheError::config(format!("invalid TOML format: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a `.toml` or `.json` file
    ///
    /// # Errors
    /// Returns `CacheError::Config` if the file cannot be read, has an
    /// unsupported extension, fails to parse, or fails validation.
    pub fn load_from_file(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CacheError::config(format!("failed to read config file {}: {e}", path.display()))
        })?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
        match extension {
            "toml" => Self::from_toml_str(&contents),
            "json" => {
                let config: Self = serde_json::from_str(&contents)
                    .map_err(|e| CacheError::config(format!("invalid JSON format: {e}")))?;
                config.validate()?;
                Ok(config)
            }
            other => Err(CacheError::config(format!("unsupported config format: {other}"))),
        }
    }
}

fn millis_var<F>(lookup: &F, name: &str, field: &str) -> CacheResult<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| CacheError::config_field(field, format!("invalid {name}: {e}")))
        })
        .transpose()
}
