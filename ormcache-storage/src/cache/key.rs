//! Cache key construction.
//!
//! Every key the cache layer touches is built here, so that the record
//! store, invalidation and any application code agree on the exact format.
//!
//! # Format
//!
//! ```text
//! record key:   [prefix:]collection:component|component|...
//! related key:  [prefix:]collection:~rel:related_collection:field:component
//! ```
//!
//! Each segment escapes `\`, `:` and `|` with a backslash, and each identity
//! component starts with a one-letter type tag (`i5`, `sFord`, `n`), so
//! `Int(5)` and `Text("5")` never share a key and no two distinct identity
//! tuples can produce the same string.

use std::collections::BTreeSet;

use ormcache_core::{CacheConfig, FieldValue, ForeignKeyDescriptor, Identity, Record};

/// Separator between key segments.
const SEGMENT_SEPARATOR: char = ':';

/// Separator between identity components.
const COMPONENT_SEPARATOR: char = '|';

/// Marker segment of related (foreign key) keys.
const RELATED_MARKER: &str = "~rel";

/// Builds cache keys for one key namespace.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheKeyBuilder {
    /// Escaped prefix including its trailing separator, or empty.
    prefix: String,
}

impl CacheKeyBuilder {
    /// Create a builder for the given namespace prefix. An empty prefix
    /// yields bare keys.
    pub fn new(prefix: &str) -> Self {
        let prefix = if prefix.is_empty() {
            String::new()
        } else {
            let mut p = escape_segment(prefix);
            p.push(SEGMENT_SEPARATOR);
            p
        };
        Self { prefix }
    }

    /// Create a builder using the configured key prefix.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(&config.key_prefix)
    }

    /// Key of the entry caching a single record.
    pub fn build_key(&self, collection: &str, identity: &Identity) -> String {
        let mut key = self.prefix.clone();
        key.push_str(&escape_segment(collection));
        key.push(SEGMENT_SEPARATOR);
        for (i, component) in identity.components().iter().enumerate() {
            if i > 0 {
                key.push(COMPONENT_SEPARATOR);
            }
            key.push_str(&encode_component(component));
        }
        key
    }

    /// Key of the entry listing records of `collection` whose
    /// `foreign_key.field_name` equals `value`, i.e. the children of one
    /// parent in `foreign_key.related_collection`.
    pub fn build_related_key(
        &self,
        collection: &str,
        foreign_key: &ForeignKeyDescriptor,
        value: &FieldValue,
    ) -> String {
        let segments = [
            escape_segment(collection),
            RELATED_MARKER.to_string(),
            escape_segment(&foreign_key.related_collection),
            escape_segment(&foreign_key.field_name),
            encode_component(value),
        ];
        let mut key = self.prefix.clone();
        key.push_str(&segments.join(&SEGMENT_SEPARATOR.to_string()));
        key
    }

    /// Keys of every related-list entry the record belongs to.
    ///
    /// One key per declared foreign key with a non-null value. When the
    /// record has moved to another parent since it was loaded, the previous
    /// parent's key is included as well.
    pub fn build_foreign_key_invalidation_keys(&self, record: &Record) -> BTreeSet<String> {
        let collection = record.collection();
        let mut keys = BTreeSet::new();

        for fk in record.schema().foreign_keys() {
            let current = record.get(&fk.field_name).filter(|v| !v.is_null());
            let previous = record
                .persisted_foreign_value(&fk.field_name)
                .filter(|v| !v.is_null());

            for value in current.into_iter().chain(previous) {
                keys.insert(self.build_related_key(collection, fk, value));
            }
        }

        keys
    }
}

/// Escape `\`, `:` and `|` so they cannot be confused with separators.
fn escape_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | SEGMENT_SEPARATOR | COMPONENT_SEPARATOR) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Type-tagged, escaped encoding of one identity component.
fn encode_component(value: &FieldValue) -> String {
    let raw = match value {
        FieldValue::Null => "n".to_string(),
        FieldValue::Bool(b) => format!("b{}", u8::from(*b)),
        FieldValue::Int(i) => format!("i{}", i),
        // Bit pattern, so 0.1 and 0.1000000001 never round to the same text.
        FieldValue::Float(x) => format!("f{:016x}", x.to_bits()),
        FieldValue::Text(s) => format!("s{}", s),
        FieldValue::Uuid(u) => format!("u{}", u.as_hyphenated()),
        FieldValue::Timestamp(t) => {
            format!("t{}.{:09}", t.timestamp(), t.timestamp_subsec_nanos())
        }
        FieldValue::List(_) | FieldValue::Map(_) => {
            // Structured identities are rare; JSON keeps them deterministic
            // because maps are BTreeMaps.
            format!("j{}", serde_json::to_string(value).unwrap_or_default())
        }
    };
    escape_segment(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormcache_core::RecordSchema;

    fn car_schema() -> RecordSchema {
        RecordSchema::new("cars", ["id"]).with_foreign_key("brand", "manufacturers")
    }

    #[test]
    fn test_simple_key() {
        let keys = CacheKeyBuilder::new("");
        assert_eq!(keys.build_key("cars", &Identity::from(5)), "cars:i5");

        let prefixed = CacheKeyBuilder::new("shop");
        assert_eq!(prefixed.build_key("cars", &Identity::from(5)), "shop:cars:i5");
    }

    #[test]
    fn test_key_is_deterministic() {
        let keys = CacheKeyBuilder::new("shop");
        let id = Identity::new(vec![5.into(), "mon".into()]);
        assert_eq!(keys.build_key("rentals", &id), keys.build_key("rentals", &id));
    }

    #[test]
    fn test_types_do_not_collide() {
        let keys = CacheKeyBuilder::new("");
        assert_ne!(
            keys.build_key("cars", &Identity::from(5)),
            keys.build_key("cars", &Identity::from("5"))
        );
    }

    #[test]
    fn test_delimiters_are_escaped() {
        let keys = CacheKeyBuilder::new("");
        // ("a|sb") as one component vs ("a", "b") as two.
        let one = Identity::from("a|sb");
        let two = Identity::new(vec!["a".into(), "b".into()]);
        assert_ne!(keys.build_key("t", &one), keys.build_key("t", &two));

        // Colon in the collection vs colon between collection and identity.
        assert_ne!(
            keys.build_key("a:sx", &Identity::from("y")),
            keys.build_key("a", &Identity::from("x:sy"))
        );
    }

    #[test]
    fn test_non_finite_floats_in_lists_do_not_collide() {
        let keys = CacheKeyBuilder::new("");
        let list = |x: f64| Identity::from(FieldValue::List(vec![FieldValue::Float(x)]));
        let nan = keys.build_key("t", &list(f64::NAN));
        let inf = keys.build_key("t", &list(f64::INFINITY));
        let neg_inf = keys.build_key("t", &list(f64::NEG_INFINITY));

        assert_ne!(nan, inf);
        assert_ne!(inf, neg_inf);
        assert_ne!(nan, keys.build_key("t", &Identity::from(FieldValue::List(vec![FieldValue::Null]))));
    }

    #[test]
    fn test_prefix_namespaces_keys() {
        let a = CacheKeyBuilder::new("blue");
        let b = CacheKeyBuilder::new("green");
        let id = Identity::from(5);
        assert_ne!(a.build_key("cars", &id), b.build_key("cars", &id));
    }

    #[test]
    fn test_related_key_differs_from_record_key() {
        let keys = CacheKeyBuilder::new("");
        let fk = ForeignKeyDescriptor::new("brand", "manufacturers");
        let related = keys.build_related_key("cars", &fk, &FieldValue::from("Ford"));
        assert_eq!(related, "cars:~rel:manufacturers:brand:sFord");
        assert_ne!(related, keys.build_key("cars", &Identity::from("Ford")));
    }

    #[test]
    fn test_foreign_key_invalidation_keys() {
        let keys = CacheKeyBuilder::new("");
        let car = Record::new(car_schema()).with("id", 5).with("brand", "Ford");

        let invalidated = keys.build_foreign_key_invalidation_keys(&car);
        let fk = ForeignKeyDescriptor::new("brand", "manufacturers");
        let children_of_ford = keys.build_related_key("cars", &fk, &"Ford".into());

        assert_eq!(invalidated.len(), 1);
        assert!(invalidated.contains(&children_of_ford));
        assert_eq!(invalidated, keys.build_foreign_key_invalidation_keys(&car));
    }

    #[test]
    fn test_foreign_key_skips_null_and_missing() {
        let keys = CacheKeyBuilder::new("");
        let schema = car_schema().with_foreign_key("owner_id", "people");
        let car = Record::new(schema)
            .with("id", 5)
            .with("brand", FieldValue::Null);
        assert!(keys.build_foreign_key_invalidation_keys(&car).is_empty());
    }

    #[test]
    fn test_foreign_key_includes_previous_parent() {
        let keys = CacheKeyBuilder::new("");
        let fk = ForeignKeyDescriptor::new("brand", "manufacturers");
        let mut car = Record::new(car_schema()).with("id", 5).with("brand", "Ford");
        car.mark_persisted().unwrap();
        car.set("brand", "Opel").unwrap();

        let invalidated = keys.build_foreign_key_invalidation_keys(&car);
        assert_eq!(invalidated.len(), 2);
        assert!(invalidated.contains(&keys.build_related_key("cars", &fk, &"Ford".into())));
        assert!(invalidated.contains(&keys.build_related_key("cars", &fk, &"Opel".into())));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn component_strategy() -> impl Strategy<Value = FieldValue> {
        prop_oneof![
            Just(FieldValue::Null),
            any::<bool>().prop_map(FieldValue::Bool),
            any::<i64>().prop_map(FieldValue::Int),
            "[a-z:|\\\\]{0,6}".prop_map(FieldValue::Text),
            any::<[u8; 16]>().prop_map(|b| FieldValue::Uuid(uuid::Uuid::from_bytes(b))),
        ]
    }

    fn identity_strategy() -> impl Strategy<Value = Identity> {
        prop::collection::vec(component_strategy(), 1..4).prop_map(Identity::new)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(1000))]

        /// Distinct (collection, identity) pairs never share a key.
        #[test]
        fn prop_build_key_is_injective(
            c1 in "[a-z:|]{1,4}",
            c2 in "[a-z:|]{1,4}",
            id1 in identity_strategy(),
            id2 in identity_strategy(),
        ) {
            let keys = CacheKeyBuilder::new("ns");
            let k1 = keys.build_key(&c1, &id1);
            let k2 = keys.build_key(&c2, &id2);
            if c1 == c2 && id1 == id2 {
                prop_assert_eq!(k1, k2);
            } else {
                prop_assert_ne!(k1, k2, "Different inputs must have different keys");
            }
        }

        /// Every key starts with the namespace prefix.
        #[test]
        fn prop_keys_carry_prefix(
            prefix in "[a-z]{1,8}",
            id in identity_strategy(),
        ) {
            let keys = CacheKeyBuilder::new(&prefix);
            let expected = format!("{}:", prefix);
            let key = keys.build_key("cars", &id);
            prop_assert!(key.starts_with(&expected));
        }
    }
}
