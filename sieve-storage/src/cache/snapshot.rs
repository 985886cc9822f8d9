//! Read-only view of cache state.

use sieve_core::{FieldKey, ObjectKey};
use serde_json::Value;
use std::fmt;

/// Where a field lives: the root entry table or a normalized object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Location {
    Root,
    Object(ObjectKey),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Root => write!(f, "ROOT"),
            Location::Object(key) => write!(f, "{}", key),
        }
    }
}

/// Presence/value lookups against a cache state.
///
/// `field` distinguishes a recorded `null` (`Some(Value::Null)`) from true
/// absence (`None`); only absence counts as missing.
pub trait CacheSnapshot {
    /// Value recorded at `key` under `location`, if any.
    fn field(&self, location: &Location, key: &FieldKey) -> Option<Value>;

    /// Every field key recorded under `location`.
    fn field_keys(&self, location: &Location) -> Vec<FieldKey>;

    /// True when the object entry holds at least one field.
    fn has_object(&self, object: &ObjectKey) -> bool {
        !self.field_keys(&Location::Object(object.clone())).is_empty()
    }

    fn root_field(&self, key: &FieldKey) -> Option<Value> {
        self.field(&Location::Root, key)
    }

    fn object_field(&self, object: &ObjectKey, key: &FieldKey) -> Option<Value> {
        self.field(&Location::Object(object.clone()), key)
    }
}

/// Where the children of a selected field are looked up.
///
/// Normalized objects live in their own entries; embedded objects (no
/// identity) are stored inline as maps keyed by the rendered [`FieldKey`].
#[derive(Debug, Clone, Copy)]
pub enum FieldSource<'a> {
    Normalized(&'a Location),
    Embedded(&'a serde_json::Map<String, Value>),
}

impl FieldSource<'_> {
    pub fn lookup<S: CacheSnapshot + ?Sized>(&self, snapshot: &S, key: &FieldKey) -> Option<Value> {
        match self {
            FieldSource::Normalized(location) => snapshot.field(location, key),
            FieldSource::Embedded(map) => map.get(&key.to_string()).cloned(),
        }
    }
}
