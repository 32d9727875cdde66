//! Shared in-memory cache backend.
//!
//! One [`InMemoryCacheBackend`] owns a segment of memory that any number of
//! handles can share, each scoped to a namespace (think of one segment per
//! host, shared by every request handler on it). Flushing a handle only
//! clears its own namespace.
//!
//! Entries honor their TTL lazily: an expired entry is dropped the next time
//! it is read or when a write needs room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ormcache_core::{CacheError, CacheResult};

use super::traits::{CacheBackend, CacheLookup, CacheStats};
use crate::clock::{expiry_after, Clock, SystemClock};

/// Namespace used by [`InMemoryCacheBackend::new`].
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn footprint(&self, key: &str) -> usize {
        key.len() + self.bytes.len()
    }
}

/// Entries of every namespace, with running totals for limit checks.
#[derive(Debug, Default)]
struct Segment {
    /// namespace -> key -> value
    namespaces: HashMap<String, HashMap<String, StoredValue>>,
    entries: usize,
    bytes: usize,
}

impl Segment {
    fn get(&self, namespace: &str, key: &str) -> Option<&StoredValue> {
        self.namespaces.get(namespace).and_then(|ns| ns.get(key))
    }

    fn insert(&mut self, namespace: &str, key: &str, value: StoredValue) {
        self.bytes += value.footprint(key);
        let previous = self
            .namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        match previous {
            Some(old) => self.bytes -= old.footprint(key),
            None => self.entries += 1,
        }
    }

    fn remove(&mut self, namespace: &str, key: &str) -> Option<StoredValue> {
        let removed = self.namespaces.get_mut(namespace)?.remove(key)?;
        self.entries -= 1;
        self.bytes -= removed.footprint(key);
        Some(removed)
    }

    fn remove_namespace(&mut self, namespace: &str) -> usize {
        let Some(entries) = self.namespaces.remove(namespace) else {
            return 0;
        };
        self.entries -= entries.len();
        self.bytes -= entries
            .iter()
            .map(|(key, value)| value.footprint(key))
            .sum::<usize>();
        entries.len()
    }

    /// Drop expired entries from every namespace. Returns entries removed.
    fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut freed = 0;
        let mut removed = 0;
        for entries in self.namespaces.values_mut() {
            entries.retain(|key, value| {
                if value.is_expired(now) {
                    freed += value.footprint(key);
                    removed += 1;
                    false
                } else {
                    true
                }
            });
        }
        self.entries -= removed;
        self.bytes -= freed;
        removed
    }

    /// Totals after writing `value` under `key`.
    fn projected(&self, namespace: &str, key: &str, value: &StoredValue) -> (usize, usize) {
        let added = value.footprint(key);
        match self.get(namespace, key) {
            Some(old) => (self.entries, self.bytes - old.footprint(key) + added),
            None => (self.entries + 1, self.bytes + added),
        }
    }
}

/// Limits shared by every handle on a segment.
#[derive(Debug, Clone, Copy, Default)]
struct SegmentLimits {
    max_entries: Option<usize>,
    max_bytes: Option<usize>,
}

/// In-memory cache backend with namespaces, TTL and capacity limits.
///
/// # Example
///
/// ```ignore
/// let cars = InMemoryCacheBackend::new().with_max_entries(10_000);
/// let sessions = cars.namespace("sessions");
///
/// cars.set("cars:i5", bytes, Some(Duration::from_secs(60))).await?;
/// sessions.flush().await?; // leaves "cars:i5" alone
/// ```
#[derive(Clone)]
pub struct InMemoryCacheBackend {
    segment: Arc<RwLock<Segment>>,
    namespace: String,
    limits: SegmentLimits,
    clock: Arc<dyn Clock>,
    available: Arc<AtomicBool>,
    stats: Arc<RwLock<CacheStats>>,
}

impl InMemoryCacheBackend {
    /// Create a fresh segment with a single `default` namespace handle.
    pub fn new() -> Self {
        Self {
            segment: Arc::new(RwLock::new(Segment::default())),
            namespace: DEFAULT_NAMESPACE.to_string(),
            limits: SegmentLimits::default(),
            clock: Arc::new(SystemClock),
            available: Arc::new(AtomicBool::new(true)),
            stats: Arc::new(RwLock::new(CacheStats::default())),
        }
    }

    /// Use the given clock for expiry decisions.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Reject writes that would grow the segment past `max` entries.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.limits.max_entries = Some(max);
        self
    }

    /// Reject writes that would grow the segment past `max` bytes
    /// (keys plus values).
    pub fn with_max_bytes(mut self, max: usize) -> Self {
        self.limits.max_bytes = Some(max);
        self
    }

    /// Another handle on the same segment, scoped to `name`.
    ///
    /// Handles share storage, limits, clock and availability, but keep
    /// their own statistics.
    pub fn namespace(&self, name: impl Into<String>) -> Self {
        Self {
            segment: Arc::clone(&self.segment),
            namespace: name.into(),
            limits: self.limits,
            clock: Arc::clone(&self.clock),
            available: Arc::clone(&self.available),
            stats: Arc::new(RwLock::new(CacheStats::default())),
        }
    }

    pub fn namespace_name(&self) -> &str {
        &self.namespace
    }

    /// Simulate the cache service going away (or coming back).
    ///
    /// While unavailable every operation fails with
    /// `CacheError::BackendUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> CacheResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::unavailable("in-memory cache segment is offline"))
        }
    }

    fn poisoned() -> CacheError {
        CacheError::unavailable("cache segment lock poisoned")
    }

    fn record_hit(&self) {
        if let Ok(mut stats) = self.stats.write() {
            stats.hits += 1;
        }
    }

    fn record_miss(&self, evicted: bool) {
        if let Ok(mut stats) = self.stats.write() {
            stats.misses += 1;
            if evicted {
                stats.evictions += 1;
            }
        }
    }

    fn fits(&self, entries: usize, bytes: usize) -> bool {
        self.limits.max_entries.map_or(true, |max| entries <= max)
            && self.limits.max_bytes.map_or(true, |max| bytes <= max)
    }
}

impl Default for InMemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &str) -> CacheResult<CacheLookup> {
        self.ensure_available()?;
        let now = self.clock.now();

        let expired = {
            let segment = self.segment.read().map_err(|_| Self::poisoned())?;
            match segment.get(&self.namespace, key) {
                Some(value) if !value.is_expired(now) => {
                    self.record_hit();
                    return Ok(CacheLookup::Hit(value.bytes.clone()));
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut segment = self.segment.write().map_err(|_| Self::poisoned())?;
            // Re-check under the write lock; a writer may have refreshed it.
            if segment
                .get(&self.namespace, key)
                .is_some_and(|v| v.is_expired(now))
            {
                segment.remove(&self.namespace, key);
            }
        }

        self.record_miss(expired);
        Ok(CacheLookup::Miss)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        self.ensure_available()?;
        let now = self.clock.now();
        let stored = StoredValue {
            bytes: value,
            expires_at: expiry_after(now, ttl),
        };

        let mut segment = self.segment.write().map_err(|_| Self::poisoned())?;

        let (mut new_count, mut new_bytes) = segment.projected(&self.namespace, key, &stored);
        if !self.fits(new_count, new_bytes) {
            let removed = segment.purge_expired(now);
            if removed > 0 {
                if let Ok(mut stats) = self.stats.write() {
                    stats.evictions += removed as u64;
                }
            }
            (new_count, new_bytes) = segment.projected(&self.namespace, key, &stored);
        }

        if !self.fits(new_count, new_bytes) {
            return Err(CacheError::BackendCapacityExceeded {
                key: key.to_string(),
                reason: format!(
                    "segment would hold {} entries / {} bytes (limits {:?} / {:?})",
                    new_count, new_bytes, self.limits.max_entries, self.limits.max_bytes
                ),
            });
        }

        segment.insert(&self.namespace, key, stored);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.ensure_available()?;
        let mut segment = self.segment.write().map_err(|_| Self::poisoned())?;
        segment.remove(&self.namespace, key);
        Ok(())
    }

    async fn flush(&self) -> CacheResult<u64> {
        self.ensure_available()?;
        let mut segment = self.segment.write().map_err(|_| Self::poisoned())?;
        Ok(segment.remove_namespace(&self.namespace) as u64)
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        self.ensure_available()?;
        let mut stats = self
            .stats
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();

        let segment = self.segment.read().map_err(|_| Self::poisoned())?;
        if let Some(ns) = segment.namespaces.get(&self.namespace) {
            stats.entry_count = ns.len() as u64;
            stats.memory_bytes = ns
                .iter()
                .map(|(key, value)| value.footprint(key) as u64)
                .sum();
        }
        Ok(stats)
    }
}
