//! Read-through, write-invalidate cache layer for keyed records.
//!
//! The layer sits between request handlers and a [`RecordStore`](crate::RecordStore).
//! Reads go to the cache first and fall back to the store on a miss. Writes
//! go to the store first and then delete whatever cache entries they made
//! stale.
//!
//! # Consistency
//!
//! After a successful save returns, the cache entry for that record is
//! absent or expires within the configured TTL. A racing reader may still
//! observe the old value once. A backend that cannot be reached never
//! fails a record operation; it only turns hits into store reads.
//!
//! # Example
//!
//! ```ignore
//! let backend = Arc::new(LmdbCacheBackend::new("/var/cache/shop", 100, "shop")?);
//! let cached = CachedRecordStore::new(store, backend, CacheConfig::from_env()?);
//!
//! let car = cached.find("cars", &Identity::from(5)).await?;
//! let fords = cached.find_related("cars", &brand_fk, &"Ford".into()).await?;
//! ```

pub mod cached_store;
pub mod entry;
pub mod key;
pub mod lmdb_backend;
pub mod memory_backend;
pub mod traits;

pub use cached_store::{CachedRecordStore, StoreStats};
pub use entry::{CacheEntry, CachedPayload};
pub use key::CacheKeyBuilder;
pub use lmdb_backend::{LmdbCacheBackend, LmdbCacheError};
pub use memory_backend::{InMemoryCacheBackend, DEFAULT_NAMESPACE};
pub use traits::{CacheBackend, CacheLookup, CacheStats};
