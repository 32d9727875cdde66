//! Persistent record store seam.
//!
//! The cache layer never talks to a database directly. It goes through
//! [`RecordStore`], which is implemented by the application's storage
//! driver. [`InMemoryRecordStore`] is a complete in-process implementation
//! used by tests and small deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use ormcache_core::{
    FieldValue, ForeignKeyDescriptor, Identity, Record, StoreError, StoreResult,
};

/// Persistent storage for records.
///
/// Implementations are the source of truth. Every error they return passes
/// through the cache layer unchanged.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Load a record by identity. `Ok(None)` when it does not exist;
    /// `Err(StoreError::NotFound)` is accepted as the same outcome.
    async fn load(&self, collection: &str, identity: &Identity) -> StoreResult<Option<Record>>;

    /// Insert or update a record, returning it as persisted.
    ///
    /// The returned record is marked persisted and carries its identity,
    /// which the store may have assigned.
    async fn save(&self, record: &Record) -> StoreResult<Record>;

    /// Delete a record. Deleting a missing record succeeds, or reports
    /// `StoreError::NotFound`, which callers treat as success.
    async fn delete(&self, collection: &str, identity: &Identity) -> StoreResult<()>;

    /// Records of `collection` whose `foreign_key.field_name` equals `value`.
    async fn load_related(
        &self,
        collection: &str,
        foreign_key: &ForeignKeyDescriptor,
        value: &FieldValue,
    ) -> StoreResult<Vec<Record>>;
}

/// Records of one collection, keyed by encoded identity.
type Collection = BTreeMap<String, Record>;

/// In-process record store.
///
/// Single-field schemas get an auto-assigned integer identity when saved
/// without one. Failures can be injected for the next load, save or delete.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    collections: RwLock<HashMap<String, Collection>>,
    next_id: AtomicI64,
    fail_next_load: Mutex<Option<StoreError>>,
    fail_next_save: Mutex<Option<StoreError>>,
    fail_next_delete: Mutex<Option<StoreError>>,
    load_calls: AtomicU64,
    related_calls: AtomicU64,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `load` fail with `error`.
    pub fn fail_next_load(&self, error: StoreError) {
        if let Ok(mut slot) = self.fail_next_load.lock() {
            *slot = Some(error);
        }
    }

    /// Make the next `save` fail with `error` without touching any data.
    pub fn fail_next_save(&self, error: StoreError) {
        if let Ok(mut slot) = self.fail_next_save.lock() {
            *slot = Some(error);
        }
    }

    /// Make the next `delete` fail with `error` without touching any data.
    pub fn fail_next_delete(&self, error: StoreError) {
        if let Ok(mut slot) = self.fail_next_delete.lock() {
            *slot = Some(error);
        }
    }

    /// Number of `load` calls served so far.
    pub fn load_calls(&self) -> u64 {
        self.load_calls.load(Ordering::Relaxed)
    }

    /// Number of `load_related` calls served so far.
    pub fn related_calls(&self) -> u64 {
        self.related_calls.load(Ordering::Relaxed)
    }

    /// Number of records in `collection`.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .map(|c| c.get(collection).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    fn take_failure(slot: &Mutex<Option<StoreError>>) -> StoreResult<()> {
        let mut slot = slot.lock().map_err(|_| StoreError::LockPoisoned)?;
        match slot.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Encoded form of an identity, usable as a map key. `FieldValue` holds
    /// floats, so `Identity` itself is not `Ord`.
    fn identity_key(identity: &Identity) -> StoreResult<String> {
        serde_json::to_string(identity).map_err(|e| StoreError::Rejected {
            collection: String::new(),
            reason: format!("identity is not encodable: {}", e),
        })
    }

    fn assign_identity(&self, record: &mut Record) -> StoreResult<()> {
        if record.has_identity() {
            return Ok(());
        }

        let collection = record.collection().to_string();
        let rejected = |reason: String| StoreError::Rejected {
            collection: collection.clone(),
            reason,
        };

        let [field] = record.schema().identity_fields() else {
            return Err(rejected(
                "composite identities must be supplied by the caller".to_string(),
            ));
        };
        let field = field.clone();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        record
            .set(field, FieldValue::Int(id))
            .map_err(|e| rejected(e.to_string()))
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn load(&self, collection: &str, identity: &Identity) -> StoreResult<Option<Record>> {
        self.load_calls.fetch_add(1, Ordering::Relaxed);
        Self::take_failure(&self.fail_next_load)?;
        let key = Self::identity_key(identity)?;
        let collections = self
            .collections
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(collections
            .get(collection)
            .and_then(|records| records.get(&key))
            .cloned())
    }

    async fn save(&self, record: &Record) -> StoreResult<Record> {
        Self::take_failure(&self.fail_next_save)?;

        record
            .check_identity_frozen()
            .map_err(|e| StoreError::Rejected {
                collection: record.collection().to_string(),
                reason: e.to_string(),
            })?;

        let mut saved = record.clone();
        self.assign_identity(&mut saved)?;
        saved.mark_persisted().map_err(|e| StoreError::Rejected {
            collection: record.collection().to_string(),
            reason: e.to_string(),
        })?;

        let key = Self::identity_key(&saved.identity().map_err(|e| StoreError::Rejected {
            collection: record.collection().to_string(),
            reason: e.to_string(),
        })?)?;

        let mut collections = self
            .collections
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        collections
            .entry(saved.collection().to_string())
            .or_default()
            .insert(key, saved.clone());
        Ok(saved)
    }

    async fn delete(&self, collection: &str, identity: &Identity) -> StoreResult<()> {
        Self::take_failure(&self.fail_next_delete)?;

        let key = Self::identity_key(identity)?;
        let mut collections = self
            .collections
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        if let Some(records) = collections.get_mut(collection) {
            records.remove(&key);
        }
        Ok(())
    }

    async fn load_related(
        &self,
        collection: &str,
        foreign_key: &ForeignKeyDescriptor,
        value: &FieldValue,
    ) -> StoreResult<Vec<Record>> {
        self.related_calls.fetch_add(1, Ordering::Relaxed);
        let collections = self
            .collections
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(collections
            .get(collection)
            .map(|records| {
                records
                    .values()
                    .filter(|r| r.get(&foreign_key.field_name) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormcache_core::RecordSchema;

    fn car_schema() -> RecordSchema {
        RecordSchema::new("cars", ["id"]).with_foreign_key("brand", "manufacturers")
    }

    #[tokio::test]
    async fn test_save_assigns_identity() {
        let store = InMemoryRecordStore::new();
        let first = store
            .save(&Record::new(car_schema()).with("brand", "Ford"))
            .await
            .unwrap();
        let second = store
            .save(&Record::new(car_schema()).with("brand", "Opel"))
            .await
            .unwrap();

        assert_eq!(first.identity().unwrap(), Identity::from(1i64));
        assert_eq!(second.identity().unwrap(), Identity::from(2i64));
        assert!(first.is_persisted());
        assert_eq!(store.len("cars"), 2);
    }

    #[tokio::test]
    async fn test_save_keeps_explicit_identity() {
        let store = InMemoryRecordStore::new();
        let saved = store
            .save(&Record::new(car_schema()).with("id", 5).with("brand", "Ford"))
            .await
            .unwrap();
        assert_eq!(saved.identity().unwrap(), Identity::from(5));

        let loaded = store.load("cars", &Identity::from(5)).await.unwrap();
        assert_eq!(loaded, Some(saved));
        assert_eq!(store.load_calls(), 1);
    }

    #[tokio::test]
    async fn test_composite_identity_must_be_supplied() {
        let store = InMemoryRecordStore::new();
        let schema = RecordSchema::new("rentals", ["car_id", "day"]);
        let err = store
            .save(&Record::new(schema).with("car_id", 5))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected { .. }));
        assert!(store.is_empty("rentals"));
    }

    #[tokio::test]
    async fn test_save_rejects_rekeyed_persisted_record() {
        let store = InMemoryRecordStore::new();
        let saved = store
            .save(&Record::new(car_schema()).with("id", 5).with("brand", "Ford"))
            .await
            .unwrap();

        // Identity fields edited behind the record's back, e.g. in transit.
        let mut json = serde_json::to_value(&saved).unwrap();
        json["fields"]["id"] = serde_json::json!({"type": "int", "value": 99});
        let rekeyed: Record = serde_json::from_value(json).unwrap();

        let err = store.save(&rekeyed).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected { ref reason, .. } if reason.contains("cannot change")));
        assert_eq!(store.len("cars"), 1);
        assert!(store.load("cars", &Identity::from(99)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryRecordStore::new();
        store
            .save(&Record::new(car_schema()).with("id", 5))
            .await
            .unwrap();

        store.delete("cars", &Identity::from(5)).await.unwrap();
        store.delete("cars", &Identity::from(5)).await.unwrap();
        store.delete("boats", &Identity::from(5)).await.unwrap();
        assert!(store.load("cars", &Identity::from(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failures_fire_once() {
        let store = InMemoryRecordStore::new();
        store.fail_next_save(StoreError::ConnectionFailed {
            reason: "down".to_string(),
        });

        let car = Record::new(car_schema()).with("id", 5);
        assert!(store.save(&car).await.is_err());
        assert!(store.is_empty("cars"));
        assert!(store.save(&car).await.is_ok());

        store.fail_next_delete(StoreError::ConnectionFailed {
            reason: "down".to_string(),
        });
        assert!(store.delete("cars", &Identity::from(5)).await.is_err());
        assert_eq!(store.len("cars"), 1);
    }

    #[tokio::test]
    async fn test_load_related() {
        let store = InMemoryRecordStore::new();
        for (id, brand) in [(1, "Ford"), (2, "Opel"), (3, "Ford")] {
            store
                .save(&Record::new(car_schema()).with("id", id).with("brand", brand))
                .await
                .unwrap();
        }

        let fk = ForeignKeyDescriptor::new("brand", "manufacturers");
        let fords = store
            .load_related("cars", &fk, &FieldValue::from("Ford"))
            .await
            .unwrap();
        assert_eq!(fords.len(), 2);
        assert_eq!(store.related_calls(), 1);

        let none = store
            .load_related("cars", &fk, &FieldValue::from("Tesla"))
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
