//! Cache entry envelope.
//!
//! The record store never hands raw records to a backend. It wraps them in
//! a [`CacheEntry`] that carries the key it was written under and its own
//! expiry, so expiry is enforced on read even when a backend keeps serving
//! an entry past its TTL.

use chrono::{DateTime, Utc};
use ormcache_core::{CacheError, CacheResult, Record};
use serde::{Deserialize, Serialize};

/// What a cache entry holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CachedPayload {
    /// A single record.
    Record(Record),
    /// A related-record list (children of one parent).
    RecordList(Vec<Record>),
    /// Negative entry: the store reported the record as absent.
    Absent,
}

/// A decoded cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key the entry was written under.
    pub key: String,
    pub payload: CachedPayload,
    pub cached_at: DateTime<Utc>,
    /// `None` means the entry never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        payload: CachedPayload,
        cached_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            key: key.into(),
            payload,
            cached_at,
            expires_at,
        }
    }

    /// True once `now` has reached the expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Serialize for storage in a backend.
    pub fn encode(&self) -> CacheResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CacheError::Serialization {
            key: self.key.clone(),
            reason: e.to_string(),
        })
    }

    /// Decode bytes read from `key`.
    ///
    /// An entry that decodes but names a different key is rejected as well;
    /// it can only come from a foreign writer sharing the namespace.
    pub fn decode(key: &str, bytes: &[u8]) -> CacheResult<Self> {
        let entry: Self = serde_json::from_slice(bytes).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        if entry.key != key {
            return Err(CacheError::Serialization {
                key: key.to_string(),
                reason: format!("entry was written for key {}", entry.key),
            });
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormcache_core::RecordSchema;

    fn car() -> Record {
        Record::new(RecordSchema::new("cars", ["id"]))
            .with("id", 5)
            .with("brand", "Ford")
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let entry = CacheEntry::new(
            "cars:i5",
            CachedPayload::Record(car()),
            now,
            Some(now + chrono::Duration::seconds(60)),
        );
        assert!(!entry.is_expired(now));
        assert!(!entry.is_expired(now + chrono::Duration::seconds(59)));
        assert!(entry.is_expired(now + chrono::Duration::seconds(60)));
        assert!(entry.is_expired(now + chrono::Duration::seconds(61)));

        let forever = CacheEntry::new("cars:i5", CachedPayload::Absent, now, None);
        assert!(!forever.is_expired(now + chrono::Duration::days(365)));
    }

    #[test]
    fn test_decode_garbage_is_serialization_error() {
        let err = CacheEntry::decode("cars:i5", b"not json").unwrap_err();
        assert!(matches!(err, CacheError::Serialization { .. }));

        let err = CacheEntry::decode("cars:i5", b"").unwrap_err();
        assert!(matches!(err, CacheError::Serialization { .. }));
    }

    #[test]
    fn test_decode_rejects_foreign_key() {
        let entry = CacheEntry::new("cars:i6", CachedPayload::Absent, Utc::now(), None);
        let bytes = entry.encode().unwrap();
        let err = CacheEntry::decode("cars:i5", &bytes).unwrap_err();
        assert!(matches!(err, CacheError::Serialization { .. }));
    }

    #[test]
    fn test_decode_preserves_payload() {
        let entry = CacheEntry::new(
            "cars:i5",
            CachedPayload::RecordList(vec![car(), car().with("id", 6)]),
            Utc::now(),
            None,
        );
        let decoded = CacheEntry::decode("cars:i5", &entry.encode().unwrap()).unwrap();
        assert_eq!(decoded, entry);
    }
}
