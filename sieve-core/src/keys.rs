//! Cache key types.
//!
//! Root entries are addressed by [`FieldKey`] alone; object entries by an
//! [`ObjectKey`] plus a [`FieldKey`]. Field keys embed the canonical rendering
//! of the field's arguments so `posts(first: 10)` and `posts(first: 20)` live
//! in different slots.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Field carrying an object's type name.
pub const TYPENAME_FIELD: &str = "__typename";

/// Marker key of a normalized reference value: `{"__ref": "Post:5"}`.
pub const REF_FIELD: &str = "__ref";

/// Field names that carry an object's identity.
pub const ID_FIELDS: [&str; 2] = ["id", "_id"];

/// Returns true for fields that make up an object's identity.
pub fn is_identity_field(name: &str) -> bool {
    name == TYPENAME_FIELD || ID_FIELDS.contains(&name)
}

/// Storage key of a field: name plus canonical arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldKey {
    name: String,
    args: Option<String>,
}

impl FieldKey {
    /// Key for a field without arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: None,
        }
    }

    /// Key for a field with already-substituted arguments.
    ///
    /// An empty argument map produces the same key as [`FieldKey::new`].
    pub fn with_args(name: impl Into<String>, args: &Map<String, Value>) -> Self {
        let args = if args.is_empty() {
            None
        } else {
            Some(canonical_json(&Value::Object(args.clone())))
        };
        Self {
            name: name.into(),
            args,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical JSON of the arguments, if any.
    pub fn args(&self) -> Option<&str> {
        self.args.as_deref()
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.args {
            Some(args) => write!(f, "{}({})", self.name, args),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Identity of a normalized object entry, rendered `Typename:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(typename: &str, id: &str) -> Self {
        Self(format!("{}:{}", typename, id))
    }

    /// Wrap an already-rendered key (as found inside a `__ref`).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Identify a result object by its `__typename` and `id`/`_id` fields.
    ///
    /// Returns `None` when the object does not carry both.
    pub fn identify(object: &Map<String, Value>) -> Option<Self> {
        let typename = object.get(TYPENAME_FIELD)?.as_str()?;
        ID_FIELDS.iter().find_map(|field| match object.get(*field)? {
            Value::String(id) => Some(Self::new(typename, id)),
            Value::Number(id) => Some(Self::new(typename, &id.to_string())),
            _ => None,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The type name part of the key.
    pub fn typename(&self) -> &str {
        self.0.split_once(':').map(|(t, _)| t).unwrap_or(&self.0)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build a reference value pointing at an object entry.
pub fn make_ref(key: &ObjectKey) -> Value {
    let mut map = Map::new();
    map.insert(REF_FIELD.to_string(), Value::String(key.0.clone()));
    Value::Object(map)
}

/// Classification of a stored reference-shaped value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefValue {
    /// Not a reference at all.
    NotRef,
    /// A well-formed reference.
    Ref(ObjectKey),
    /// Carries `__ref` but not as a lone string.
    Malformed,
}

/// Inspect a value for a normalized reference.
pub fn read_ref(value: &Value) -> RefValue {
    let Value::Object(map) = value else {
        return RefValue::NotRef;
    };
    match map.get(REF_FIELD) {
        None => RefValue::NotRef,
        Some(Value::String(raw)) if map.len() == 1 => RefValue::Ref(ObjectKey::from_raw(raw.clone())),
        Some(_) => RefValue::Malformed,
    }
}

/// Render a JSON value with object keys sorted at every level.
///
/// Relies on `serde_json::Map` keeping keys sorted (no `preserve_order`).
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    proptest! {
        #[test]
        fn prop_field_key_ignores_argument_order(
            pairs in proptest::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..6)
        ) {
            let forward: Map<String, Value> =
                pairs.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            let reverse: Map<String, Value> =
                pairs.iter().rev().map(|(k, v)| (k.clone(), json!(v))).collect();
            prop_assert_eq!(
                FieldKey::with_args("field", &forward),
                FieldKey::with_args("field", &reverse)
            );
        }
    }

    #[test]
    fn test_field_key_display() {
        assert_eq!(FieldKey::new("name").to_string(), "name");

        let args = json!({"first": 10, "after": "c1"});
        let key = FieldKey::with_args("posts", args.as_object().unwrap());
        assert_eq!(key.to_string(), r#"posts({"after":"c1","first":10})"#);
        assert_eq!(key.name(), "posts");
    }

    #[test]
    fn test_field_key_empty_args_equals_bare() {
        assert_eq!(FieldKey::with_args("me", &Map::new()), FieldKey::new("me"));
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let a = json!({"b": {"y": 1, "x": [ {"d": 1, "c": 2} ]}, "a": null});
        assert_eq!(canonical_json(&a), r#"{"a":null,"b":{"x":[{"c":2,"d":1}],"y":1}}"#);
    }

    #[test]
    fn test_argument_order_does_not_split_keys() {
        let mut forward = Map::new();
        forward.insert("first".to_string(), json!(10));
        forward.insert("after".to_string(), json!({"z": 1, "a": 2}));
        let mut backward = Map::new();
        backward.insert("after".to_string(), json!({"a": 2, "z": 1}));
        backward.insert("first".to_string(), json!(10));

        let key = FieldKey::with_args("posts", &forward);
        assert_eq!(key, FieldKey::with_args("posts", &backward));
        assert_eq!(key.to_string(), r#"posts({"after":{"a":2,"z":1},"first":10})"#);
    }

    #[test]
    fn test_identify_object() {
        let obj = json!({"__typename": "User", "id": 1, "name": "Ann"});
        assert_eq!(
            ObjectKey::identify(obj.as_object().unwrap()),
            Some(ObjectKey::new("User", "1"))
        );

        let obj = json!({"__typename": "Doc", "_id": "abc"});
        assert_eq!(
            ObjectKey::identify(obj.as_object().unwrap()).map(|k| k.to_string()),
            Some("Doc:abc".to_string())
        );

        let anonymous = json!({"id": 1});
        assert_eq!(ObjectKey::identify(anonymous.as_object().unwrap()), None);
    }

    #[test]
    fn test_read_ref() {
        let key = ObjectKey::new("Post", "5");
        assert_eq!(read_ref(&make_ref(&key)), RefValue::Ref(key.clone()));
        assert_eq!(key.typename(), "Post");
        assert_eq!(read_ref(&json!({"title": "x"})), RefValue::NotRef);
        assert_eq!(read_ref(&json!({"__ref": 5})), RefValue::Malformed);
        assert_eq!(read_ref(&json!("Post:5")), RefValue::NotRef);
    }
}
