//! SIEVE Core - Document Model, Cache Keys, Errors, Configuration
//!
//! Pure data structures shared by every other crate. No cache state and no
//! I/O lives here.

pub mod config;
pub mod document;
pub mod error;
pub mod keys;

pub use config::{FetchPolicy, ReadOptions, RequestContext, SieveConfig};
pub use document::{
    canonical_variables, Argument, Document, Field, FragmentDefinition, InlineFragment,
    OperationKind, Selection, SelectionSet, VariableDefinition, Variables,
};
pub use error::{
    ConfigError, DocumentError, ModifierError, ReductionError, SieveError, SieveResult,
    StorageError, TransportError, WriteError,
};
pub use keys::{
    canonical_json, is_identity_field, make_ref, read_ref, FieldKey, ObjectKey, RefValue,
    ID_FIELDS, REF_FIELD, TYPENAME_FIELD,
};

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
