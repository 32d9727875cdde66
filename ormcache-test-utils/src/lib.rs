//! ORMCACHE Test Utilities
//!
//! Centralized test infrastructure for the ORMCACHE workspace:
//! - Proptest generators for field values, identities and records
//! - A fault-injecting cache backend
//! - Test fixtures for the cars/manufacturers scenario
//! - Custom assertions for store and cache results
//! - Tracing setup for tests

// Re-export core types for convenience
pub use ormcache_core::{
    CacheConfig, CacheError, CacheResult, ConfigHandle, FieldValue, ForeignKeyDescriptor,
    Identity, Record, RecordSchema, StoreError, StoreResult,
};
pub use ormcache_storage::{
    CacheBackend, CacheKeyBuilder, CacheLookup, CacheStats, CachedRecordStore, Clock,
    InMemoryCacheBackend, InMemoryRecordStore, ManualClock, RecordStore, StoreStats,
};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// TRACING
// ============================================================================

/// Install a tracing subscriber for tests.
///
/// Honors `RUST_LOG`; set `ORMCACHE_LOG_JSON=1` for JSON output. Safe to call
/// from every test, only the first call installs anything.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ormcache_storage=debug,warn"));
    let registry = tracing_subscriber::registry().with(env_filter);

    let json = std::env::var("ORMCACHE_LOG_JSON").is_ok_and(|v| v == "1");
    let installed = if json {
        registry.with(fmt::layer().json().with_test_writer()).try_init()
    } else {
        registry.with(fmt::layer().with_test_writer()).try_init()
    };

    if installed.is_ok() {
        tracing::debug!(json, "Test tracing initialized");
    }
}

// ============================================================================
// FAULT-INJECTING BACKEND
// ============================================================================

/// Cache backend wrapper with switchable faults and call counters.
#[derive(Debug, Default)]
pub struct FlakyBackend<B> {
    inner: B,
    offline: AtomicBool,
    failing_sets: AtomicBool,
    failing_deletes: AtomicU32,
    latency_ms: AtomicU64,
    get_calls: AtomicU64,
    set_calls: AtomicU64,
    delete_calls: AtomicU64,
}

impl<B: CacheBackend> FlakyBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            offline: AtomicBool::new(false),
            failing_sets: AtomicBool::new(false),
            failing_deletes: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            get_calls: AtomicU64::new(0),
            set_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
        }
    }

    /// The wrapped backend, bypassing every fault.
    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Fail every call with `BackendUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail every `set` with `BackendCapacityExceeded`.
    pub fn set_failing_sets(&self, failing: bool) {
        self.failing_sets.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `count` deletes.
    pub fn fail_next_deletes(&self, count: u32) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> u64 {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, counter: &AtomicU64) -> CacheResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::unavailable("backend offline"));
        }
        Ok(())
    }
}

#[async_trait]
impl<B: CacheBackend> CacheBackend for FlakyBackend<B> {
    async fn get(&self, key: &str) -> CacheResult<CacheLookup> {
        self.enter(&self.get_calls).await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        self.enter(&self.set_calls).await?;
        if self.failing_sets.load(Ordering::SeqCst) {
            return Err(CacheError::BackendCapacityExceeded {
                key: key.to_string(),
                reason: "injected capacity fault".to_string(),
            });
        }
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.enter(&self.delete_calls).await?;
        let consumed = self
            .failing_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(CacheError::unavailable("injected delete fault"));
        }
        self.inner.delete(key).await
    }

    async fn flush(&self) -> CacheResult<u64> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::unavailable("backend offline"));
        }
        self.inner.flush().await
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        self.inner.stats().await
    }
}

// ============================================================================
// HARNESS
// ============================================================================

/// Backend type used by [`Harness`].
pub type HarnessBackend = FlakyBackend<InMemoryCacheBackend>;

/// A cached store wired to in-memory parts, with handles on each of them.
///
/// The store's clock is manual. The backend keeps the system clock, so
/// advancing `clock` ages entries without the backend ever purging them.
pub struct Harness {
    pub cached: CachedRecordStore<InMemoryRecordStore, HarnessBackend>,
    pub store: Arc<InMemoryRecordStore>,
    pub backend: Arc<HarnessBackend>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(config: CacheConfig) -> Self {
        let store = Arc::new(InMemoryRecordStore::new());
        let backend = Arc::new(FlakyBackend::new(InMemoryCacheBackend::new()));
        let clock = Arc::new(ManualClock::starting_now());
        let cached = CachedRecordStore::new(Arc::clone(&store), Arc::clone(&backend), config)
            .with_clock(clock.clone());
        Self {
            cached,
            store,
            backend,
            clock,
        }
    }

    /// Key builder matching the harness's current configuration.
    pub fn keys(&self) -> CacheKeyBuilder {
        self.cached.keys()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating ORMCACHE types.

    use super::*;
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;
    use uuid::Uuid;

    /// Generate a random UUID.
    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    /// Generate a timestamp between 2020 and 2030.
    pub fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    /// Generate text that stresses key escaping.
    pub fn arb_key_text() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9:|\\\\ ]{0,12}"
    }

    /// Generate a non-null scalar usable as an identity component.
    pub fn arb_identity_component() -> impl Strategy<Value = FieldValue> {
        prop_oneof![
            any::<i64>().prop_map(FieldValue::Int),
            arb_key_text().prop_map(FieldValue::Text),
            arb_uuid().prop_map(FieldValue::Uuid),
            arb_timestamp().prop_map(FieldValue::Timestamp),
            any::<bool>().prop_map(FieldValue::Bool),
        ]
    }

    /// Generate an identity of one to three components.
    pub fn arb_identity() -> impl Strategy<Value = Identity> {
        prop::collection::vec(arb_identity_component(), 1..4).prop_map(Identity::new)
    }

    /// Generate a collection name.
    pub fn arb_collection() -> impl Strategy<Value = String> {
        "[a-z][a-z_:]{0,10}"
    }

    /// Generate a field value, falsy values included.
    pub fn arb_field_value() -> impl Strategy<Value = FieldValue> {
        let leaf = prop_oneof![
            Just(FieldValue::Null),
            Just(FieldValue::Bool(false)),
            Just(FieldValue::Int(0)),
            Just(FieldValue::Text(String::new())),
            Just(FieldValue::List(Vec::new())),
            arb_identity_component(),
            // Quarter steps print and parse back exactly.
            (-4000i32..4000).prop_map(|q| FieldValue::Float(f64::from(q) / 4.0)),
            Just(FieldValue::Float(f64::INFINITY)),
            Just(FieldValue::Float(f64::NEG_INFINITY)),
        ];
        leaf.prop_recursive(2, 8, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(FieldValue::List),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..4).prop_map(FieldValue::Map),
            ]
        })
    }

    /// Generate an unpersisted car with the given id.
    pub fn arb_car(id: i64) -> impl Strategy<Value = Record> {
        (
            prop_oneof![Just("Ford"), Just("Opel"), Just("Tesla")],
            arb_field_value(),
            arb_field_value(),
        )
            .prop_map(move |(brand, color, extras)| {
                super::fixtures::car(id, brand)
                    .with("color", color)
                    .with("extras", extras)
            })
    }

    /// Generate a valid cache configuration.
    pub fn arb_cache_config() -> impl Strategy<Value = CacheConfig> {
        (
            1u64..7200,
            any::<bool>(),
            1u64..300,
            "[a-z]{0,6}",
            1u64..1000,
            0u32..=3,
        )
            .prop_map(|(ttl, negative, negative_ttl, prefix, timeout_ms, retries)| {
                CacheConfig::default()
                    .with_ttl(Duration::from_secs(ttl))
                    .with_negative_cache(negative)
                    .with_negative_ttl(Duration::from_secs(negative_ttl))
                    .with_key_prefix(prefix)
                    .with_backend_timeout(Duration::from_millis(timeout_ms))
                    .with_invalidation_retries(retries)
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for the cars/manufacturers scenario.

    use super::*;

    pub fn manufacturer_schema() -> RecordSchema {
        RecordSchema::new("manufacturers", ["name"])
    }

    /// Cars reference their manufacturer by name through `brand`.
    pub fn car_schema() -> RecordSchema {
        RecordSchema::new("cars", ["id"]).with_foreign_key("brand", "manufacturers")
    }

    /// Rentals have a composite identity.
    pub fn rental_schema() -> RecordSchema {
        RecordSchema::new("rentals", ["car_id", "day"]).with_foreign_key("car_id", "cars")
    }

    pub fn brand_fk() -> ForeignKeyDescriptor {
        ForeignKeyDescriptor::new("brand", "manufacturers")
    }

    pub fn manufacturer(name: &str) -> Record {
        Record::new(manufacturer_schema()).with("name", name)
    }

    pub fn car(id: i64, brand: &str) -> Record {
        Record::new(car_schema()).with("id", id).with("brand", brand)
    }

    pub fn ford_car() -> Record {
        car(5, "Ford").with("model", "Focus").with("doors", 5)
    }

    /// A car whose fields are all falsy but present.
    pub fn falsy_car(id: i64) -> Record {
        car(id, "Ford")
            .with("model", "")
            .with("doors", 0)
            .with("electric", false)
            .with("options", FieldValue::List(Vec::new()))
    }

    pub fn rental(car_id: i64, day: &str) -> Record {
        Record::new(rental_schema())
            .with("car_id", car_id)
            .with("day", day)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for ORMCACHE results.

    use super::*;

    /// Assert that a StoreResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &StoreResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a StoreResult is a ConnectionFailed error.
    #[track_caller]
    pub fn assert_connection_failed<T: std::fmt::Debug>(result: &StoreResult<T>) {
        match result {
            Err(StoreError::ConnectionFailed { .. }) => {}
            other => panic!("Expected ConnectionFailed, got: {:?}", other),
        }
    }

    /// Assert that a StoreResult is a ConstraintViolation error.
    #[track_caller]
    pub fn assert_constraint_violation<T: std::fmt::Debug>(result: &StoreResult<T>) {
        match result {
            Err(StoreError::ConstraintViolation { .. }) => {}
            other => panic!("Expected ConstraintViolation, got: {:?}", other),
        }
    }

    /// Assert that a lookup is a hit carrying exactly `expected`.
    #[track_caller]
    pub fn assert_hit(lookup: &CacheLookup, expected: &[u8]) {
        match lookup {
            CacheLookup::Hit(bytes) => assert_eq!(bytes.as_slice(), expected),
            CacheLookup::Miss => panic!("Expected Hit, got Miss"),
        }
    }

    /// Assert that two records carry the same fields.
    #[track_caller]
    pub fn assert_same_fields(actual: &Record, expected: &Record) {
        assert_eq!(
            actual.fields(),
            expected.fields(),
            "Records of {} differ",
            expected.collection()
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixtures_have_identity() {
        assert!(fixtures::ford_car().has_identity());
        assert!(fixtures::falsy_car(7).has_identity());
        assert!(fixtures::rental(5, "mon").has_identity());
        assert!(fixtures::manufacturer("Ford").has_identity());
    }

    #[tokio::test]
    async fn test_flaky_backend_faults() {
        let backend = FlakyBackend::new(InMemoryCacheBackend::new());
        backend.set("k", b"v".to_vec(), None).await.unwrap();

        backend.fail_next_deletes(1);
        assert!(backend.delete("k").await.is_err());
        assert!(backend.delete("k").await.is_ok());
        assert_eq!(backend.delete_calls(), 2);

        backend.set_failing_sets(true);
        assert!(matches!(
            backend.set("k", b"v".to_vec(), None).await,
            Err(CacheError::BackendCapacityExceeded { .. })
        ));

        backend.set_offline(true);
        assert!(backend.get("k").await.is_err());
        assert!(backend.flush().await.is_err());
    }

    #[tokio::test]
    async fn test_harness_wiring() {
        let harness = Harness::default();
        harness.store.save(&fixtures::ford_car()).await.unwrap();

        let found = harness
            .cached
            .find("cars", &Identity::from(5))
            .await
            .unwrap();
        assert!(found.is_some());
        assert_eq!(harness.backend.set_calls(), 1);
    }

    proptest! {
        #[test]
        fn prop_generated_configs_are_valid(config in generators::arb_cache_config()) {
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_generated_identities_are_non_empty(identity in generators::arb_identity()) {
            prop_assert!(!identity.is_empty());
        }
    }
}
