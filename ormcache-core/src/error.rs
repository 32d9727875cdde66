//! Error types for ORMCACHE operations

use std::path::PathBuf;
use thiserror::Error;

/// Persistent store errors.
///
/// These are the only errors a `CachedRecordStore` ever returns to its
/// caller; they pass through the cache layer unchanged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Absence reported as an error by stores that have no `Option` to
    /// return. The cache layer treats it as a normal "no such record".
    #[error("Record not found: {collection} with identity {identity}")]
    NotFound { collection: String, identity: String },

    #[error("Connection to persistent store failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Constraint violation on {constraint}: {reason}")]
    ConstraintViolation { constraint: String, reason: String },

    #[error("Write rejected for {collection}: {reason}")]
    Rejected { collection: String, reason: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// True when the store reported the record as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Cache backend errors.
///
/// A missing key is never an error; backends report it as a miss.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    #[error("Cache backend rejected write of {key}: {reason}")]
    BackendCapacityExceeded { key: String, reason: String },

    #[error("Cache payload for {key} could not be decoded: {reason}")]
    Serialization { key: String, reason: String },
}

impl CacheError {
    /// Shorthand for an unavailable backend.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            reason: reason.into(),
        }
    }

    /// Short label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::BackendCapacityExceeded { .. } => "backend_capacity_exceeded",
            Self::Serialization { .. } => "serialization",
        }
    }
}

/// Record validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Identity field {field} of {collection} cannot change once persisted")]
    IdentityImmutable { collection: String, field: String },

    #[error("Identity field {field} of {collection} is missing")]
    MissingIdentity { collection: String, field: String },

    #[error("Identity for {collection} needs {expected} components, got {got}")]
    IdentityArity {
        collection: String,
        expected: usize,
        got: usize,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },

    #[error("Failed to read configuration file {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("Configuration lock poisoned")]
    LockPoisoned,
}

/// Master error type for all ORMCACHE errors.
#[derive(Debug, Clone, Error)]
pub enum OrmError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for persistent store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for cache backend operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Result type alias for ORMCACHE operations.
pub type OrmResult<T> = Result<T, OrmError>;

// =============================================================================
// TESTS
// =============================================================================
