//! Error types for SIEVE operations

use crate::ObjectKey;
use thiserror::Error;

/// Query document errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("Fragment not defined: {name}")]
    UndefinedFragment { name: String },

    #[error("Fragment cycle detected through {name}")]
    FragmentCycle { name: String },

    #[error("Operation {operation} has no top-level field")]
    MissingOperationField { operation: String },

    #[error("Invalid input for {operation}: {reason}")]
    InvalidInput { operation: String, reason: String },
}

/// Errors raised while reducing a document against a cache snapshot.
///
/// These never reach callers of `reduce`: the reducer falls back to the full
/// document instead of returning a wrong partial result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReductionError {
    #[error("Malformed reference at {field}: {reason}")]
    MalformedReference { field: String, reason: String },

    #[error("Cannot reduce {kind} operation")]
    UnsupportedOperation { kind: String },

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
}

/// Cache modifier errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModifierError {
    #[error("Modifier rejected the value: {reason}")]
    Rejected { reason: String },

    #[error("Modifier for {field} failed: {reason}")]
    Failed { field: String, reason: String },

    #[error("Modifier engine re-entered while applying")]
    Reentrant,
}

impl ModifierError {
    /// Convenience constructor for modifier closures.
    pub fn rejected(reason: impl Into<String>) -> Self {
        ModifierError::Rejected {
            reason: reason.into(),
        }
    }
}

/// Cache store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Cache lock poisoned")]
    LockPoisoned,

    #[error("Payload must be an object, got {found}")]
    InvalidPayload { found: String },

    #[error("Object not found: {key}")]
    ObjectNotFound { key: ObjectKey },

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
}

/// Transport errors reported by the remote service boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request {operation} failed: {reason}")]
    RequestFailed { operation: String, reason: String },

    #[error("Remote returned errors for {operation}: {messages:?}")]
    Remote {
        operation: String,
        messages: Vec<String>,
    },

    #[error("Transport closed")]
    Closed,
}

/// Write coordination errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("Invalid write transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Mutation {operation} returned no data for {field}")]
    MissingPayload { operation: String, field: String },
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
}

/// Master error type for all SIEVE errors.
#[derive(Debug, Clone, Error)]
pub enum SieveError {
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Reduction error: {0}")]
    Reduction(#[from] ReductionError),

    #[error("Modifier error: {0}")]
    Modifier(#[from] ModifierError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for SIEVE operations.
pub type SieveResult<T> = Result<T, SieveError>;

// =============================================================================
// TESTS
// =============================================================================
