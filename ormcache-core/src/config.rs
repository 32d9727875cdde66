//! Cache configuration
//!
//! [`CacheConfig`] is built once (from defaults, environment variables or a
//! TOML file) and passed to the components that need it. [`ConfigHandle`]
//! allows an explicit reload by swapping in a new immutable snapshot.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

// ============================================================================
// CACHE CONFIGURATION
// ============================================================================

/// Configuration for the record cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// TTL applied when populating the cache on a miss. Zero means no expiry.
    pub default_ttl: Duration,
    /// Whether a "not found" result from the store is itself cached.
    pub negative_cache_enabled: bool,
    /// TTL for negative entries. Zero means no expiry.
    pub negative_ttl: Duration,
    /// Namespace prefix for every built key.
    pub key_prefix: String,
    /// Upper bound on a single backend call.
    pub backend_timeout: Duration,
    /// Extra attempts for a failed invalidation before giving up.
    pub invalidation_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600), // 1 hour
            negative_cache_enabled: false,
            negative_ttl: Duration::from_secs(30),
            key_prefix: String::new(),
            backend_timeout: Duration::from_millis(250),
            invalidation_retries: 1,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Enable or disable negative caching.
    pub fn with_negative_cache(mut self, enabled: bool) -> Self {
        self.negative_cache_enabled = enabled;
        self
    }

    /// Set the negative entry TTL.
    pub fn with_negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl = ttl;
        self
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the backend timeout.
    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    /// Set the number of invalidation retries.
    pub fn with_invalidation_retries(mut self, retries: u32) -> Self {
        self.invalidation_retries = retries;
        self
    }

    /// Reject values the cache layer cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "backend_timeout".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.invalidation_retries > 5 {
            return Err(ConfigError::InvalidValue {
                field: "invalidation_retries".to_string(),
                value: self.invalidation_retries.to_string(),
                reason: "at most 5 synchronous retries are allowed".to_string(),
            });
        }
        if self.key_prefix.chars().any(char::is_control) {
            return Err(ConfigError::InvalidValue {
                field: "key_prefix".to_string(),
                value: self.key_prefix.escape_debug().to_string(),
                reason: "must not contain control characters".to_string(),
            });
        }
        Ok(())
    }

    /// Create CacheConfig from environment variables.
    ///
    /// Environment variables:
    /// - `ORMCACHE_DEFAULT_TTL_SECS`: populate TTL in seconds (default: 3600)
    /// - `ORMCACHE_NEGATIVE_CACHE`: "true" or "false" (default: false)
    /// - `ORMCACHE_NEGATIVE_TTL_SECS`: negative entry TTL (default: 30)
    /// - `ORMCACHE_KEY_PREFIX`: key namespace (default: empty)
    /// - `ORMCACHE_BACKEND_TIMEOUT_MS`: per-call backend timeout (default: 250)
    /// - `ORMCACHE_INVALIDATION_RETRIES`: retries per invalidation (default: 1)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`CacheConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let default_ttl = parse_var(&lookup, "ORMCACHE_DEFAULT_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.default_ttl);

        let negative_cache_enabled = lookup("ORMCACHE_NEGATIVE_CACHE")
            .map(|s| matches!(s.trim().to_lowercase().as_str(), "true" | "1"))
            .unwrap_or(defaults.negative_cache_enabled);

        let negative_ttl = parse_var(&lookup, "ORMCACHE_NEGATIVE_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.negative_ttl);

        let key_prefix = lookup("ORMCACHE_KEY_PREFIX").unwrap_or(defaults.key_prefix);

        let backend_timeout = parse_var(&lookup, "ORMCACHE_BACKEND_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.backend_timeout);

        let invalidation_retries = match parse_var(&lookup, "ORMCACHE_INVALIDATION_RETRIES")? {
            Some(n) => u32::try_from(n).map_err(|e| ConfigError::InvalidValue {
                field: "ORMCACHE_INVALIDATION_RETRIES".to_string(),
                value: n.to_string(),
                reason: e.to_string(),
            })?,
            None => defaults.invalidation_retries,
        };

        let config = Self {
            default_ttl,
            negative_cache_enabled,
            negative_ttl,
            key_prefix,
            backend_timeout,
            invalidation_retries,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    ///
    /// ```toml
    /// default_ttl_secs = 60
    /// negative_cache_enabled = true
    /// key_prefix = "shop"
    /// backend_timeout_ms = 100
    /// ```
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let file: CacheConfigFile = toml::from_str(input).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        let config = file.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }
}

fn parse_var<F>(lookup: &F, name: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                field: name.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

/// On-disk representation; durations are plain integers.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CacheConfigFile {
    default_ttl_secs: Option<u64>,
    negative_cache_enabled: Option<bool>,
    negative_ttl_secs: Option<u64>,
    key_prefix: Option<String>,
    backend_timeout_ms: Option<u64>,
    invalidation_retries: Option<u32>,
}

impl CacheConfigFile {
    fn into_config(self) -> CacheConfig {
        let defaults = CacheConfig::default();
        CacheConfig {
            default_ttl: self
                .default_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_ttl),
            negative_cache_enabled: self
                .negative_cache_enabled
                .unwrap_or(defaults.negative_cache_enabled),
            negative_ttl: self
                .negative_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.negative_ttl),
            key_prefix: self.key_prefix.unwrap_or(defaults.key_prefix),
            backend_timeout: self
                .backend_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backend_timeout),
            invalidation_retries: self
                .invalidation_retries
                .unwrap_or(defaults.invalidation_retries),
        }
    }
}

// ============================================================================
// RELOADABLE HANDLE
// ============================================================================

/// Shared, reloadable configuration.
///
/// Readers take an `Arc` snapshot that never changes underneath them;
/// [`ConfigHandle::reload`] validates the replacement and swaps it in.
#[derive(Debug)]
pub struct ConfigHandle {
    current: RwLock<Arc<CacheConfig>>,
}

impl ConfigHandle {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Current configuration snapshot.
    pub fn current(&self) -> Arc<CacheConfig> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            // A writer only ever stores a complete Arc, so the value is intact.
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the configuration, returning the previous snapshot.
    pub fn reload(&self, config: CacheConfig) -> Result<Arc<CacheConfig>, ConfigError> {
        config.validate()?;
        let next = Arc::new(config);
        let mut guard = self.current.write().map_err(|_| ConfigError::LockPoisoned)?;
        Ok(std::mem::replace(&mut *guard, next))
    }

    /// Reload from a TOML file.
    pub fn reload_from_path(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Arc<CacheConfig>, ConfigError> {
        self.reload(CacheConfig::load(path)?)
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl From<CacheConfig> for ConfigHandle {
    fn from(config: CacheConfig) -> Self {
        Self::new(config)
    }
}
