//! LMDB-backed cache implementation with namespace isolation.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped
//! key-value store that several processes on one host can open at once,
//! which makes it a drop-in shared cache for request handlers that do not
//! share an address space.
//!
//! # Key Format
//!
//! `[namespace bytes][0xFF][key bytes]`. `0xFF` never occurs in UTF-8, so
//! a namespace prefix scan cannot bleed into another namespace.
//!
//! # Value Format
//!
//! `[flag: 1 byte][expires_at millis: 8 bytes LE][payload]`, where the flag
//! is 1 when the entry has an expiry and 0 otherwise.

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, MdbError};
use ormcache_core::{CacheError, CacheResult};

use super::traits::{CacheBackend, CacheLookup, CacheStats};
use crate::clock::{expiry_after, Clock, SystemClock};

/// Separator byte between namespace and key.
const SEPARATOR: u8 = 0xFF;

/// Length of the value header.
const HEADER_LEN: usize = 9;

/// Error type for LMDB cache setup.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert LmdbCacheError to CacheError.
impl From<LmdbCacheError> for CacheError {
    fn from(e: LmdbCacheError) -> Self {
        CacheError::unavailable(e.to_string())
    }
}

/// Map a heed error from a write to the cache error taxonomy.
fn write_error(key: &str, e: heed::Error) -> CacheError {
    match e {
        heed::Error::Mdb(MdbError::MapFull) => CacheError::BackendCapacityExceeded {
            key: key.to_string(),
            reason: "LMDB map is full".to_string(),
        },
        other => CacheError::unavailable(other.to_string()),
    }
}

fn txn_error(e: heed::Error) -> CacheError {
    CacheError::unavailable(format!("LMDB transaction failed: {}", e))
}

/// LMDB-backed cache with namespace isolation.
///
/// # Example
///
/// ```ignore
/// use ormcache_storage::cache::LmdbCacheBackend;
///
/// let backend = LmdbCacheBackend::new("/var/cache/shop", 100, "shop")?;
/// backend.set("cars:i5", bytes, Some(Duration::from_secs(60))).await?;
/// let lookup = backend.get("cars:i5").await?;
/// ```
pub struct LmdbCacheBackend {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    /// Namespace bytes plus separator.
    prefix: Vec<u8>,
    clock: Arc<dyn Clock>,
    stats: Arc<RwLock<CacheStats>>,
}

impl LmdbCacheBackend {
    /// Create a new LMDB cache backend.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    /// * `namespace` - Namespace owning every key written through this handle
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn new<P: AsRef<Path>>(
        path: P,
        max_size_mb: usize,
        namespace: &str,
    ) -> Result<Self, LmdbCacheError> {
        // Ensure directory exists
        std::fs::create_dir_all(&path)?;

        // Open LMDB environment
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        // Open the default database
        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let mut prefix = namespace.as_bytes().to_vec();
        prefix.push(SEPARATOR);

        Ok(Self {
            env,
            db,
            prefix,
            clock: Arc::new(SystemClock),
            stats: Arc::new(RwLock::new(CacheStats::default())),
        })
    }

    /// Use the given clock for expiry decisions.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn full_key(&self, key: &str) -> Vec<u8> {
        let mut full = Vec::with_capacity(self.prefix.len() + key.len());
        full.extend_from_slice(&self.prefix);
        full.extend_from_slice(key.as_bytes());
        full
    }

    fn encode_value(expires_at: Option<DateTime<Utc>>, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        match expires_at {
            Some(at) => {
                bytes.push(1);
                bytes.extend_from_slice(&at.timestamp_millis().to_le_bytes());
            }
            None => {
                bytes.push(0);
                bytes.extend_from_slice(&0i64.to_le_bytes());
            }
        }
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Split a stored value into its expiry and payload. `None` for a value
    /// too short to carry a header.
    fn decode_value(bytes: &[u8]) -> Option<(Option<DateTime<Utc>>, &[u8])> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let millis = i64::from_le_bytes(bytes[1..HEADER_LEN].try_into().ok()?);
        let expires_at = match bytes[0] {
            0 => None,
            _ => Some(DateTime::from_timestamp_millis(millis)?),
        };
        Some((expires_at, &bytes[HEADER_LEN..]))
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

    /// Iterate over keys of this namespace and collect them.
    fn collect_namespace_keys(&self) -> CacheResult<Vec<(Vec<u8>, usize)>> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;

        let mut keys = Vec::new();
        let iter = self.db.iter(&rtxn).map_err(txn_error)?;

        for result in iter {
            match result {
                Ok((key, value)) if key.starts_with(&self.prefix) => {
                    keys.push((key.to_vec(), key.len() + value.len()))
                }
                _ => continue,
            }
        }

        Ok(keys)
    }

    fn delete_full_key(&self, full_key: &[u8]) -> CacheResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let deleted = self.db.delete(&mut wtxn, full_key).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        Ok(deleted)
    }
}

#[async_trait]
impl CacheBackend for LmdbCacheBackend {
    async fn get(&self, key: &str) -> CacheResult<CacheLookup> {
        let full_key = self.full_key(key);
        let now = self.clock.now();

        let expired = {
            let rtxn = self.env.read_txn().map_err(txn_error)?;
            match self.db.get(&rtxn, &full_key).map_err(txn_error)? {
                Some(bytes) => match Self::decode_value(bytes) {
                    Some((expires_at, payload)) => {
                        if expires_at.is_some_and(|at| now >= at) {
                            true
                        } else {
                            self.record_hit();
                            return Ok(CacheLookup::Hit(payload.to_vec()));
                        }
                    }
                    // Truncated header: not something this backend wrote.
                    None => true,
                },
                None => false,
            }
        };

        if expired {
            self.delete_full_key(&full_key)?;
        }
        self.record_miss(expired);
        Ok(CacheLookup::Miss)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        let full_key = self.full_key(key);
        let bytes = Self::encode_value(expiry_after(self.clock.now(), ttl), &value);

        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.db
            .put(&mut wtxn, &full_key, &bytes)
            .map_err(|e| write_error(key, e))?;
        wtxn.commit().map_err(|e| write_error(key, e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.delete_full_key(&self.full_key(key))?;
        Ok(())
    }

    async fn flush(&self) -> CacheResult<u64> {
        let keys_to_delete = self.collect_namespace_keys()?;

        let mut wtxn = self.env.write_txn().map_err(txn_error)?;

        let mut deleted = 0u64;
        for (key, _) in &keys_to_delete {
            if self.db.delete(&mut wtxn, key).map_err(txn_error)? {
                deleted += 1;
            }
        }

        wtxn.commit().map_err(txn_error)?;
        Ok(deleted)
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let mut stats = self
            .stats
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();

        let keys = self.collect_namespace_keys()?;
        stats.entry_count = keys.len() as u64;
        stats.memory_bytes = keys.iter().map(|(_, size)| *size as u64).sum();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn create_test_backend(namespace: &str) -> (LmdbCacheBackend, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let backend = LmdbCacheBackend::new(temp_dir.path(), 10, namespace)
            .expect("backend creation should succeed");
        (backend, temp_dir)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (backend, _temp_dir) = create_test_backend("shop");

        backend
            .set("cars:i5", b"ford".to_vec(), None)
            .await
            .expect("set should succeed");

        let lookup = backend.get("cars:i5").await.expect("get should succeed");
        assert_eq!(lookup, CacheLookup::Hit(b"ford".to_vec()));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (backend, _temp_dir) = create_test_backend("shop");
        let lookup = backend.get("cars:i404").await.expect("get should succeed");
        assert!(lookup.is_miss());
    }

    #[tokio::test]
    async fn test_empty_value_is_hit() {
        let (backend, _temp_dir) = create_test_backend("shop");
        backend.set("empty", Vec::new(), None).await.unwrap();
        assert_eq!(
            backend.get("empty").await.unwrap(),
            CacheLookup::Hit(Vec::new())
        );
    }

    #[tokio::test]
    async fn test_delete() {
        let (backend, _temp_dir) = create_test_backend("shop");

        backend.set("k", b"v".to_vec(), None).await.unwrap();
        backend.delete("k").await.expect("delete should succeed");
        backend.delete("k").await.expect("repeated delete should succeed");
        assert!(backend.get("k").await.unwrap().is_miss());
    }

    #[tokio::test]
    async fn test_ttl_enforced_on_read() {
        let clock = Arc::new(ManualClock::starting_now());
        let (backend, _temp_dir) = create_test_backend("shop");
        let backend = backend.with_clock(clock.clone());

        backend
            .set("cars:i5", b"ford".to_vec(), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(backend.get("cars:i5").await.unwrap().is_hit());

        clock.advance(Duration::from_secs(61));
        assert!(backend.get("cars:i5").await.unwrap().is_miss());

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entry_count, 0);
    }

    #[tokio::test]
    async fn test_namespace_isolation_and_flush() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let shop = LmdbCacheBackend::new(temp_dir.path(), 10, "shop").unwrap();
        let blog = LmdbCacheBackend::new(temp_dir.path(), 10, "blog").unwrap();

        for i in 0..5 {
            shop.set(&format!("cars:i{}", i), b"car".to_vec(), None)
                .await
                .unwrap();
        }
        blog.set("cars:i0", b"post".to_vec(), None).await.unwrap();

        assert_eq!(
            shop.get("cars:i0").await.unwrap(),
            CacheLookup::Hit(b"car".to_vec())
        );
        assert_eq!(
            blog.get("cars:i0").await.unwrap(),
            CacheLookup::Hit(b"post".to_vec())
        );

        let deleted = shop.flush().await.expect("flush should succeed");
        assert_eq!(deleted, 5);
        assert!(shop.get("cars:i0").await.unwrap().is_miss());
        assert!(blog.get("cars:i0").await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn test_flush_counts_every_deleted_entry() {
        let clock = Arc::new(ManualClock::starting_now());
        let (backend, _temp_dir) = create_test_backend("shop");
        let backend = backend.with_clock(clock.clone());

        backend.set("a", b"1".to_vec(), None).await.unwrap();
        backend
            .set("b", b"2".to_vec(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        backend.set("c", Vec::new(), None).await.unwrap();
        clock.advance(Duration::from_secs(5));

        // Expired but never read back, so still on disk.
        assert_eq!(backend.flush().await.unwrap(), 3);
        assert_eq!(backend.flush().await.unwrap(), 0);
        assert_eq!(backend.stats().await.unwrap().entry_count, 0);
    }

    #[tokio::test]
    async fn test_overwrite() {
        let (backend, _temp_dir) = create_test_backend("shop");
        backend.set("k", b"one".to_vec(), None).await.unwrap();
        backend.set("k", b"two".to_vec(), None).await.unwrap();
        assert_eq!(
            backend.get("k").await.unwrap(),
            CacheLookup::Hit(b"two".to_vec())
        );
    }

    #[tokio::test]
    async fn test_stats() {
        let (backend, _temp_dir) = create_test_backend("shop");

        let _ = backend.get("k").await;
        backend.set("k", b"v".to_vec(), None).await.unwrap();
        let _ = backend.get("k").await;
        let _ = backend.get("k").await;

        let stats = backend.stats().await.expect("stats should succeed");
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.entry_count, 1);
    }

    #[test]
    fn test_value_header() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let bytes = LmdbCacheBackend::encode_value(Some(at), b"x");
        let (expires_at, payload) = LmdbCacheBackend::decode_value(&bytes).unwrap();
        assert_eq!(expires_at, Some(at));
        assert_eq!(payload, b"x");

        let bytes = LmdbCacheBackend::encode_value(None, b"");
        assert_eq!(LmdbCacheBackend::decode_value(&bytes), Some((None, &b""[..])));
        assert!(LmdbCacheBackend::decode_value(&[1, 2, 3]).is_none());
    }
}
