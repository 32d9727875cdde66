//! Read-through, write-invalidate record store.
//!
//! [`CachedRecordStore`] wraps any [`RecordStore`] with any [`CacheBackend`].
//! Reads check the cache first and populate it on a miss. Writes go to the
//! store first and then delete every cache entry they may have made stale.
//!
//! The cache is an optimisation only. Record operations return nothing but
//! [`StoreError`]s: a failing backend degrades to store reads and shows up
//! in logs and [`StoreStats`], never in a caller's `Result`.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use ormcache_core::{
    CacheConfig, CacheError, CacheResult, ConfigError, ConfigHandle, FieldValue,
    ForeignKeyDescriptor, Identity, Record, StoreResult,
};

use super::entry::{CacheEntry, CachedPayload};
use super::key::CacheKeyBuilder;
use super::traits::{CacheBackend, CacheLookup, CacheStats};
use crate::clock::{expiry_after, Clock, SystemClock};
use crate::store::RecordStore;

/// Counters describing how the cache layer has behaved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Reads answered with a cached record or list.
    pub hits: u64,
    /// Reads that fell through to the store.
    pub misses: u64,
    /// Reads answered by a cached absence.
    pub negative_hits: u64,
    /// Backend calls that failed or timed out.
    pub backend_errors: u64,
    /// Populate writes that failed after a store read.
    pub populate_failures: u64,
    /// Invalidation deletes that were attempted again.
    pub invalidation_retries: u64,
    /// Invalidations that failed on every attempt.
    pub consistency_warnings: u64,
    /// Entries that could not be decoded and were discarded.
    pub corrupt_entries: u64,
}

impl StoreStats {
    /// Fraction of reads served from the cache, negative hits included.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.negative_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

/// Record store decorated with a read-through cache.
///
/// # Example
///
/// ```ignore
/// let cached = CachedRecordStore::new(store, backend, CacheConfig::from_env()?);
///
/// let car = cached.find("cars", &Identity::from(5)).await?;
/// let saved = cached.save(&car.with("color", "red")).await?;
/// cached.delete("cars", &saved.identity()?).await?;
/// ```
pub struct CachedRecordStore<S, C>
where
    S: RecordStore,
    C: CacheBackend,
{
    store: Arc<S>,
    cache: Arc<C>,
    config: Arc<ConfigHandle>,
    clock: Arc<dyn Clock>,
    stats: Arc<RwLock<StoreStats>>,
}

impl<S, C> Clone for CachedRecordStore<S, C>
where
    S: RecordStore,
    C: CacheBackend,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<S, C> CachedRecordStore<S, C>
where
    S: RecordStore,
    C: CacheBackend,
{
    /// Create a cached store with its own configuration.
    pub fn new(store: Arc<S>, cache: Arc<C>, config: CacheConfig) -> Self {
        Self::with_config_handle(store, cache, Arc::new(ConfigHandle::new(config)))
    }

    /// Create a cached store sharing a reloadable configuration handle.
    pub fn with_config_handle(store: Arc<S>, cache: Arc<C>, config: Arc<ConfigHandle>) -> Self {
        Self {
            store,
            cache,
            config,
            clock: Arc::new(SystemClock),
            stats: Arc::new(RwLock::new(StoreStats::default())),
        }
    }

    /// Use the given clock for entry expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Get a reference to the cache backend.
    pub fn backend(&self) -> &C {
        &self.cache
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<CacheConfig> {
        self.config.current()
    }

    /// Replace the configuration. Operations already running keep the
    /// snapshot they started with.
    pub fn reload_config(&self, config: CacheConfig) -> Result<Arc<CacheConfig>, ConfigError> {
        let previous = self.config.reload(config)?;
        tracing::info!(
            key_prefix = %self.config.current().key_prefix,
            "Cache configuration reloaded"
        );
        Ok(previous)
    }

    /// Snapshot of the cache layer counters.
    pub fn stats(&self) -> StoreStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Statistics reported by the backend itself.
    pub async fn backend_stats(&self) -> CacheResult<CacheStats> {
        let config = self.config.current();
        self.guarded(&config, self.cache.stats()).await
    }

    /// Key builder for the given configuration snapshot.
    pub fn keys(&self) -> CacheKeyBuilder {
        CacheKeyBuilder::from_config(&self.config.current())
    }

    // ========================================================================
    // RECORD OPERATIONS
    // ========================================================================

    /// Find a record by identity, checking the cache first.
    ///
    /// Returns `Ok(None)` when the store has no such record. A cached
    /// absence is only ever written when negative caching is enabled.
    pub async fn find(&self, collection: &str, identity: &Identity) -> StoreResult<Option<Record>> {
        let config = self.config.current();
        let key = CacheKeyBuilder::from_config(&config).build_key(collection, identity);

        match self.read_entry(&config, &key).await {
            Some(CachedPayload::Record(record)) => {
                self.bump(|s| s.hits += 1);
                tracing::debug!(key = %key, "Cache hit");
                return Ok(Some(record));
            }
            Some(CachedPayload::Absent) => {
                self.bump(|s| s.negative_hits += 1);
                tracing::debug!(key = %key, "Negative cache hit");
                return Ok(None);
            }
            Some(CachedPayload::RecordList(_)) => {
                self.discard_corrupt(&config, &key, "record key holds a record list")
                    .await;
            }
            None => {}
        }

        self.bump(|s| s.misses += 1);
        tracing::debug!(key = %key, "Cache miss");

        match self.load_or_absent(collection, identity).await? {
            Some(record) => {
                self.populate(
                    &config,
                    &key,
                    CachedPayload::Record(record.clone()),
                    config.default_ttl,
                )
                .await;
                Ok(Some(record))
            }
            None => {
                if config.negative_cache_enabled {
                    self.populate(&config, &key, CachedPayload::Absent, config.negative_ttl)
                        .await;
                }
                Ok(None)
            }
        }
    }

    /// Records of `collection` whose `foreign_key` field equals `value`,
    /// checking the cache first.
    ///
    /// Lists for a null value are never cached, since no write would ever
    /// invalidate them.
    pub async fn find_related(
        &self,
        collection: &str,
        foreign_key: &ForeignKeyDescriptor,
        value: &FieldValue,
    ) -> StoreResult<Vec<Record>> {
        if value.is_null() {
            return self.store.load_related(collection, foreign_key, value).await;
        }

        let config = self.config.current();
        let key = CacheKeyBuilder::from_config(&config).build_related_key(
            collection,
            foreign_key,
            value,
        );

        match self.read_entry(&config, &key).await {
            Some(CachedPayload::RecordList(records)) => {
                self.bump(|s| s.hits += 1);
                tracing::debug!(key = %key, count = records.len(), "Cache hit");
                return Ok(records);
            }
            Some(_) => {
                self.discard_corrupt(&config, &key, "related key holds a single entry")
                    .await;
            }
            None => {}
        }

        self.bump(|s| s.misses += 1);
        tracing::debug!(key = %key, "Cache miss");

        let records = self
            .store
            .load_related(collection, foreign_key, value)
            .await?;
        self.populate(
            &config,
            &key,
            CachedPayload::RecordList(records.clone()),
            config.default_ttl,
        )
        .await;
        Ok(records)
    }

    /// Save a record, then invalidate its cache entry and every related
    /// list it belongs to.
    ///
    /// A store failure is returned unchanged and leaves the cache untouched.
    /// Returns the record as persisted.
    pub async fn save(&self, record: &Record) -> StoreResult<Record> {
        let config = self.config.current();
        let saved = self.store.save(record).await?;
        let keys = CacheKeyBuilder::from_config(&config);

        let mut stale = BTreeSet::new();
        match saved.identity() {
            Ok(identity) => {
                stale.insert(keys.build_key(saved.collection(), &identity));
            }
            Err(e) => {
                tracing::warn!(
                    collection = %saved.collection(),
                    error = %e,
                    "Store returned a record without identity, record key not invalidated"
                );
            }
        }
        // The caller's copy still remembers the previous parent.
        stale.extend(keys.build_foreign_key_invalidation_keys(record));
        stale.extend(keys.build_foreign_key_invalidation_keys(&saved));

        for key in &stale {
            self.invalidate_key(&config, key).await;
        }

        Ok(saved)
    }

    /// Delete a record, then invalidate its cache entry.
    ///
    /// The entry is invalidated even when the store fails, and the store's
    /// outcome is returned. The related lists the record belonged to are
    /// invalidated as well; their foreign values come from the cached copy,
    /// or from the store when the record is not cached.
    pub async fn delete(&self, collection: &str, identity: &Identity) -> StoreResult<()> {
        let config = self.config.current();
        let keys = CacheKeyBuilder::from_config(&config);
        let key = keys.build_key(collection, identity);

        let related = match self.read_entry(&config, &key).await {
            Some(CachedPayload::Record(cached)) => keys.build_foreign_key_invalidation_keys(&cached),
            Some(CachedPayload::Absent) => BTreeSet::new(),
            _ => match self.load_or_absent(collection, identity).await {
                Ok(Some(current)) => keys.build_foreign_key_invalidation_keys(&current),
                Ok(None) => BTreeSet::new(),
                Err(e) => {
                    tracing::warn!(
                        key = %key,
                        error = %e,
                        "Could not load record before delete, related lists left to expire"
                    );
                    BTreeSet::new()
                }
            },
        };

        let outcome = match self.store.delete(collection, identity).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        };
        if let Err(e) = &outcome {
            tracing::warn!(key = %key, error = %e, "Store delete failed, invalidating anyway");
        }

        self.invalidate_key(&config, &key).await;
        for related_key in &related {
            self.invalidate_key(&config, related_key).await;
        }

        outcome
    }

    // ========================================================================
    // CACHE ADMINISTRATION
    // ========================================================================

    /// Drop the cached entry for one record.
    pub async fn invalidate(&self, collection: &str, identity: &Identity) -> CacheResult<()> {
        let config = self.config.current();
        let key = CacheKeyBuilder::from_config(&config).build_key(collection, identity);
        self.delete_with_retries(&config, &key).await
    }

    /// Drop every entry in the backend's namespace.
    pub async fn flush(&self) -> CacheResult<u64> {
        let config = self.config.current();
        let removed = self.guarded(&config, self.cache.flush()).await?;
        tracing::info!(removed, "Cache flushed");
        Ok(removed)
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    async fn load_or_absent(
        &self,
        collection: &str,
        identity: &Identity,
    ) -> StoreResult<Option<Record>> {
        match self.store.load(collection, identity).await {
            Err(e) if e.is_not_found() => Ok(None),
            other => other,
        }
    }

    fn bump(&self, update: impl FnOnce(&mut StoreStats)) {
        if let Ok(mut stats) = self.stats.write() {
            update(&mut stats);
        }
    }

    /// Run a backend call under the configured timeout.
    async fn guarded<T>(
        &self,
        config: &CacheConfig,
        call: impl Future<Output = CacheResult<T>>,
    ) -> CacheResult<T> {
        match tokio::time::timeout(config.backend_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::unavailable(format!(
                "backend call timed out after {}ms",
                config.backend_timeout.as_millis()
            ))),
        }
    }

    /// Read and decode an entry. Every failure is reported as a miss.
    async fn read_entry(&self, config: &CacheConfig, key: &str) -> Option<CachedPayload> {
        let bytes = match self.guarded(config, self.cache.get(key)).await {
            Ok(CacheLookup::Hit(bytes)) => bytes,
            Ok(CacheLookup::Miss) => return None,
            Err(e) => {
                self.bump(|s| s.backend_errors += 1);
                tracing::warn!(
                    key = %key,
                    error = %e,
                    kind = e.kind(),
                    "Cache read failed, falling back to store"
                );
                return None;
            }
        };

        let entry = match CacheEntry::decode(key, &bytes) {
            Ok(entry) => entry,
            Err(e) => {
                self.discard_corrupt(config, key, &e.to_string()).await;
                return None;
            }
        };

        if entry.is_expired(self.clock.now()) {
            tracing::debug!(key = %key, "Cached entry expired");
            return None;
        }

        Some(entry.payload)
    }

    async fn discard_corrupt(&self, config: &CacheConfig, key: &str, reason: &str) {
        self.bump(|s| s.corrupt_entries += 1);
        tracing::warn!(key = %key, reason = %reason, "Discarding undecodable cache entry");
        if let Err(e) = self.guarded(config, self.cache.delete(key)).await {
            self.bump(|s| s.backend_errors += 1);
            tracing::warn!(key = %key, error = %e, "Failed to delete corrupt cache entry");
        }
    }

    /// Best-effort cache write after a store read.
    async fn populate(&self, config: &CacheConfig, key: &str, payload: CachedPayload, ttl: Duration) {
        let now = self.clock.now();
        let entry = CacheEntry::new(key, payload, now, expiry_after(now, Some(ttl)));

        let result = match entry.encode() {
            Ok(bytes) => self.guarded(config, self.cache.set(key, bytes, Some(ttl))).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            self.bump(|s| s.populate_failures += 1);
            tracing::warn!(
                key = %key,
                error = %e,
                kind = e.kind(),
                "Cache populate failed"
            );
        }
    }

    /// Delete a key, attempting again up to `invalidation_retries` times.
    async fn delete_with_retries(&self, config: &CacheConfig, key: &str) -> CacheResult<()> {
        let mut attempt = 0;
        loop {
            match self.guarded(config, self.cache.delete(key)).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.bump(|s| s.backend_errors += 1);
                    if attempt >= config.invalidation_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    self.bump(|s| s.invalidation_retries += 1);
                    tracing::debug!(key = %key, attempt, error = %e, "Retrying cache invalidation");
                }
            }
        }
    }

    /// Invalidate after a write. A key that cannot be deleted may serve a
    /// stale value until its TTL runs out.
    async fn invalidate_key(&self, config: &CacheConfig, key: &str) {
        if let Err(e) = self.delete_with_retries(config, key).await {
            self.bump(|s| s.consistency_warnings += 1);
            tracing::warn!(
                key = %key,
                error = %e,
                consistency = "stale_until_ttl",
                ttl_secs = config.default_ttl.as_secs(),
                "Cache invalidation failed"
            );
        }
    }
}
