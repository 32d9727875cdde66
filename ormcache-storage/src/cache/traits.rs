//! Cache backend trait and lookup result.
//!
//! Backends store opaque byte payloads under string keys. They know nothing
//! about records; encoding lives in [`super::entry`].

use async_trait::async_trait;
use ormcache_core::CacheResult;
use std::time::Duration;

/// Result of a cache lookup.
///
/// `Miss` is a distinct variant, so an empty payload is still a hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// The key is present; here is its payload.
    Hit(Vec<u8>),
    /// The key is absent or expired.
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss)
    }

    /// Payload of a hit.
    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            Self::Hit(bytes) => Some(bytes),
            Self::Miss => None,
        }
    }
}

/// Cache backend trait for pluggable cache implementations.
///
/// Implementations should be thread-safe and support concurrent access
/// from multiple request handlers. A missing key is never an error. Service
/// failures are reported as `CacheError::BackendUnavailable` or
/// `CacheError::BackendCapacityExceeded`.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a value from the cache.
    async fn get(&self, key: &str) -> CacheResult<CacheLookup>;

    /// Put a value into the cache, overwriting any existing entry.
    ///
    /// A `ttl` of `None` or zero means the entry persists until evicted or
    /// flushed.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()>;

    /// Delete a value. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Remove every entry owned by this backend's namespace.
    ///
    /// Returns the number of entries removed.
    async fn flush(&self) -> CacheResult<u64>;

    /// Get cache statistics.
    async fn stats(&self) -> CacheResult<CacheStats>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Approximate memory usage in bytes.
    pub memory_bytes: u64,
    /// Number of entries dropped because they expired.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_empty_payload_is_hit() {
        let lookup = CacheLookup::Hit(Vec::new());
        assert!(lookup.is_hit());
        assert_eq!(lookup.into_value(), Some(Vec::new()));
        assert!(CacheLookup::Miss.is_miss());
        assert_eq!(CacheLookup::Miss.into_value(), None);
    }
}
