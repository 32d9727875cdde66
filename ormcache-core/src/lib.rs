//! ORMCACHE Core - Record Types
//!
//! Data model, error hierarchy and configuration shared by the storage and
//! cache crates. This crate contains no I/O beyond reading config files.

pub mod config;
pub mod error;
pub mod record;

pub use config::{CacheConfig, ConfigHandle};
pub use error::{
    CacheError, CacheResult, ConfigError, OrmError, OrmResult, StoreError, StoreResult,
    ValidationError,
};
pub use record::{FieldValue, ForeignKeyDescriptor, Identity, Record, RecordSchema};
