//! Record data model.
//!
//! A [`Record`] is a mapping from field name to [`FieldValue`], described by
//! a [`RecordSchema`] that names the identity fields and the foreign keys of
//! its collection.

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// FIELD VALUES
// ============================================================================

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(#[serde(with = "float_repr")] f64),
    Text(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    List(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
}

/// JSON has no literal for non-finite floats, so those travel as strings.
mod float_repr {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Special(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() {
            serializer.serialize_str(if *value > 0.0 { "inf" } else { "-inf" })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(x) => Ok(x),
            Repr::Special(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(de::Error::invalid_value(
                    de::Unexpected::Str(other),
                    &"a number, \"NaN\", \"inf\" or \"-inf\"",
                )),
            },
        }
    }
}

impl FieldValue {
    /// Returns true for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => write!(f, "'{}'", s),
            Self::Uuid(u) => write!(f, "{}", u),
            Self::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Self::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Uuid> for FieldValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

// ============================================================================
// IDENTITY
// ============================================================================

/// The primary identity of a record: one value per identity field, in
/// schema order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity(Vec<FieldValue>);

impl Identity {
    /// Build an identity from its ordered components.
    pub fn new(components: Vec<FieldValue>) -> Self {
        Self(components)
    }

    /// Identity made of a single value.
    pub fn single(value: impl Into<FieldValue>) -> Self {
        Self(vec![value.into()])
    }

    pub fn components(&self) -> &[FieldValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let [single] = self.0.as_slice() {
            return write!(f, "{}", single);
        }
        write!(f, "(")?;
        for (i, component) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", component)?;
        }
        write!(f, ")")
    }
}

impl From<i64> for Identity {
    fn from(value: i64) -> Self {
        Self::single(value)
    }
}

impl From<i32> for Identity {
    fn from(value: i32) -> Self {
        Self::single(value)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::single(value)
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self::single(value)
    }
}

impl From<Uuid> for Identity {
    fn from(value: Uuid) -> Self {
        Self::single(value)
    }
}

impl From<FieldValue> for Identity {
    fn from(value: FieldValue) -> Self {
        Self(vec![value])
    }
}

impl From<Vec<FieldValue>> for Identity {
    fn from(value: Vec<FieldValue>) -> Self {
        Self(value)
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

/// A named reference from one collection to another.
///
/// Used only to build composite cache keys; referential integrity is the
/// persistent store's job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKeyDescriptor {
    /// Field on the referencing record that holds the parent's value.
    pub field_name: String,
    /// Collection the field points into.
    pub related_collection: String,
}

impl ForeignKeyDescriptor {
    pub fn new(field_name: impl Into<String>, related_collection: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            related_collection: related_collection.into(),
        }
    }
}

/// Describes a collection of records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    collection: String,
    identity_fields: Vec<String>,
    #[serde(default)]
    foreign_keys: Vec<ForeignKeyDescriptor>,
}

impl RecordSchema {
    /// Create a schema with the given identity fields (in order).
    pub fn new<I, S>(collection: impl Into<String>, identity_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            collection: collection.into(),
            identity_fields: identity_fields.into_iter().map(Into::into).collect(),
            foreign_keys: Vec::new(),
        }
    }

    /// Declare a foreign key.
    pub fn with_foreign_key(
        mut self,
        field_name: impl Into<String>,
        related_collection: impl Into<String>,
    ) -> Self {
        self.foreign_keys
            .push(ForeignKeyDescriptor::new(field_name, related_collection));
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn identity_fields(&self) -> &[String] {
        &self.identity_fields
    }

    pub fn foreign_keys(&self) -> &[ForeignKeyDescriptor] {
        &self.foreign_keys
    }

    /// Find the foreign key declared on `field_name`, if any.
    pub fn foreign_key(&self, field_name: &str) -> Option<&ForeignKeyDescriptor> {
        self.foreign_keys.iter().find(|fk| fk.field_name == field_name)
    }

    pub fn is_identity_field(&self, field: &str) -> bool {
        self.identity_fields.iter().any(|f| f == field)
    }

    /// Pair each identity field with the matching identity component.
    pub fn identity_fields_for(
        &self,
        identity: &Identity,
    ) -> Result<Vec<(String, FieldValue)>, ValidationError> {
        if identity.len() != self.identity_fields.len() {
            return Err(ValidationError::IdentityArity {
                collection: self.collection.clone(),
                expected: self.identity_fields.len(),
                got: identity.len(),
            });
        }
        Ok(self
            .identity_fields
            .iter()
            .cloned()
            .zip(identity.components().iter().cloned())
            .collect())
    }
}

// ============================================================================
// RECORD
// ============================================================================

/// A row of a collection.
///
/// Once a record has been persisted (see [`Record::mark_persisted`]) its
/// identity fields are frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    schema: RecordSchema,
    fields: BTreeMap<String, FieldValue>,
    /// Identity the record was first persisted under.
    #[serde(default)]
    persisted_identity: Option<Identity>,
    /// Foreign key values as of the last load or save.
    #[serde(default)]
    persisted_foreign_values: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Create an empty, unpersisted record.
    pub fn new(schema: RecordSchema) -> Self {
        Self {
            schema,
            fields: BTreeMap::new(),
            persisted_identity: None,
            persisted_foreign_values: BTreeMap::new(),
        }
    }

    /// Create an unpersisted record from field/value pairs.
    pub fn from_fields<I, K, V>(schema: RecordSchema, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FieldValue>,
    {
        let mut record = Self::new(schema);
        record.fields = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        record
    }

    /// Builder-style field assignment.
    ///
    /// Goes through the same guard as [`Record::set`]: on a persisted record
    /// a changed identity field is left as it was. Use `set` to observe the
    /// rejection.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        let _ = self.set(field, value);
        self
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    pub fn collection(&self) -> &str {
        self.schema.collection()
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Set a field.
    ///
    /// Fails when `field` is an identity field of a persisted record and the
    /// new value differs from the persisted one.
    pub fn set(
        &mut self,
        field: impl Into<String>,
        value: impl Into<FieldValue>,
    ) -> Result<(), ValidationError> {
        let field = field.into();
        let value = value.into();

        if self.persisted_identity.is_some()
            && self.schema.is_identity_field(&field)
            && self.fields.get(&field) != Some(&value)
        {
            return Err(ValidationError::IdentityImmutable {
                collection: self.schema.collection().to_string(),
                field,
            });
        }

        self.fields.insert(field, value);
        Ok(())
    }

    /// Remove a non-identity field, returning its value.
    pub fn remove(&mut self, field: &str) -> Result<Option<FieldValue>, ValidationError> {
        if self.persisted_identity.is_some() && self.schema.is_identity_field(field) {
            return Err(ValidationError::IdentityImmutable {
                collection: self.schema.collection().to_string(),
                field: field.to_string(),
            });
        }
        Ok(self.fields.remove(field))
    }

    /// The record's identity, built from its identity fields.
    ///
    /// A missing or null identity field is an error.
    pub fn identity(&self) -> Result<Identity, ValidationError> {
        let mut components = Vec::with_capacity(self.schema.identity_fields().len());
        for field in self.schema.identity_fields() {
            match self.fields.get(field) {
                Some(value) if !value.is_null() => components.push(value.clone()),
                _ => {
                    return Err(ValidationError::MissingIdentity {
                        collection: self.schema.collection().to_string(),
                        field: field.clone(),
                    })
                }
            }
        }
        Ok(Identity::new(components))
    }

    pub fn has_identity(&self) -> bool {
        self.identity().is_ok()
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted_identity.is_some()
    }

    /// Fails when a persisted record's identity fields differ from the
    /// identity it was persisted under.
    pub fn check_identity_frozen(&self) -> Result<(), ValidationError> {
        let Some(persisted) = &self.persisted_identity else {
            return Ok(());
        };
        for (field, frozen) in self
            .schema
            .identity_fields()
            .iter()
            .zip(persisted.components())
        {
            if self.fields.get(field) != Some(frozen) {
                return Err(ValidationError::IdentityImmutable {
                    collection: self.schema.collection().to_string(),
                    field: field.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn persisted_identity(&self) -> Option<&Identity> {
        self.persisted_identity.as_ref()
    }

    /// Foreign value held by `field` as of the last load or save.
    pub fn persisted_foreign_value(&self, field: &str) -> Option<&FieldValue> {
        self.persisted_foreign_values.get(field)
    }

    /// Record that this state now matches the persistent store.
    ///
    /// Freezes the identity and snapshots foreign key values. A record whose
    /// identity no longer matches the one it was persisted under is rejected.
    pub fn mark_persisted(&mut self) -> Result<(), ValidationError> {
        self.check_identity_frozen()?;
        let identity = self.identity()?;
        if self.persisted_identity.is_none() {
            self.persisted_identity = Some(identity);
        }
        self.persisted_foreign_values = self
            .schema
            .foreign_keys()
            .iter()
            .filter_map(|fk| {
                self.fields
                    .get(&fk.field_name)
                    .map(|v| (fk.field_name.clone(), v.clone()))
            })
            .collect();
        Ok(())
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn scalar_strategy() -> impl Strategy<Value = FieldValue> {
        prop_oneof![
            any::<i64>().prop_map(FieldValue::Int),
            "[a-zA-Z0-9 ]{0,12}".prop_map(FieldValue::Text),
            any::<bool>().prop_map(FieldValue::Bool),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// Once persisted, an identity field only accepts its current value.
        #[test]
        fn prop_persisted_identity_is_frozen(
            original in scalar_strategy(),
            replacement in scalar_strategy(),
        ) {
            let mut record = Record::new(RecordSchema::new("things", ["id"]))
                .with("id", original.clone());
            record.mark_persisted().unwrap();

            let result = record.set("id", replacement.clone());
            prop_assert_eq!(result.is_ok(), original == replacement);
            prop_assert_eq!(record.get("id"), Some(&original));
            prop_assert_eq!(record.persisted_identity(), Some(&Identity::single(original)));
        }

        /// Identity components follow schema order, not insertion order.
        #[test]
        fn prop_identity_follows_schema_order(
            a in scalar_strategy(),
            b in scalar_strategy(),
            reversed in any::<bool>(),
        ) {
            let schema = RecordSchema::new("pairs", ["a", "b"]);
            let record = if reversed {
                Record::new(schema).with("b", b.clone()).with("a", a.clone())
            } else {
                Record::new(schema).with("a", a.clone()).with("b", b.clone())
            };
            prop_assert_eq!(record.identity().unwrap(), Identity::new(vec![a, b]));
        }
    }
}
