//! ORMCACHE Storage - Record Store Contract and Read-Through Cache
//!
//! Defines the persistent store seam the cache layer wraps, the pluggable
//! cache backends, and the [`CachedRecordStore`] decorator that ties them
//! together.

pub mod cache;
pub mod clock;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use store::{InMemoryRecordStore, RecordStore};

// Re-export cache types for application integration
pub use cache::{
    CacheBackend, CacheEntry, CacheKeyBuilder, CacheLookup, CacheStats, CachedPayload,
    CachedRecordStore, InMemoryCacheBackend, LmdbCacheBackend, LmdbCacheError, StoreStats,
};
