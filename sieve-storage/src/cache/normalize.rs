//! Result normalization and denormalizing reads.
//!
//! Writing walks the document alongside the response: identifiable objects
//! (`__typename` + `id`) become their own entries and are replaced by a
//! reference, everything else is stored inline. Reading reverses this and
//! yields `None` as soon as a selected field is absent.

use serde_json::{Map, Value};
use sieve_core::{
    make_ref, read_ref, Document, FieldKey, ObjectKey, RefValue, SelectionSet, StorageError,
    Variables, REF_FIELD,
};

use super::snapshot::{CacheSnapshot, FieldSource, Location};
use super::store::CacheTransaction;

/// Write a query result into the cache under the root entries.
pub fn write_result(
    tx: &mut CacheTransaction<'_>,
    document: &Document,
    variables: &Variables,
    data: &Value,
) -> Result<(), StorageError> {
    let Value::Object(data) = data else {
        return Err(StorageError::InvalidPayload {
            found: kind_of(data).to_string(),
        });
    };
    let expanded = document.expand_fragments()?;
    let variables = document.effective_variables(variables);
    write_selection(tx, &Location::Root, &expanded.selection_set, &variables, data);
    Ok(())
}

/// Read the full result of `document` from the cache.
///
/// Returns `Ok(None)` when any selected field is missing.
pub fn read_result<S: CacheSnapshot + ?Sized>(
    snapshot: &S,
    document: &Document,
    variables: &Variables,
) -> Result<Option<Value>, StorageError> {
    let expanded = document.expand_fragments()?;
    let variables = document.effective_variables(variables);
    let root = Location::Root;
    Ok(read_selection(
        snapshot,
        FieldSource::Normalized(&root),
        &expanded.selection_set,
        &variables,
    )
    .map(Value::Object))
}

fn write_selection(
    tx: &mut CacheTransaction<'_>,
    location: &Location,
    set: &SelectionSet,
    variables: &Variables,
    data: &Map<String, Value>,
) {
    for field in set.fields() {
        let Some(value) = data.get(field.response_key()) else {
            continue;
        };
        let key = field.storage_key(variables);
        let existing = tx.field(location, &key);
        let incoming = match &field.selection_set {
            None => value.clone(),
            Some(children) => match (existing.as_ref().map(read_ref), value) {
                // A reduced response may omit identity fields; keep writing
                // into the object the field already points at.
                (Some(RefValue::Ref(target)), Value::Object(map))
                    if ObjectKey::identify(map).is_none() =>
                {
                    write_selection(tx, &Location::Object(target.clone()), children, variables, map);
                    make_ref(&target)
                }
                _ => normalize_selected(tx, children, variables, value),
            },
        };
        let merged = match existing {
            Some(existing) => merge_value(existing, incoming),
            None => incoming,
        };
        tx.write_field(location, key, merged);
    }
}

fn normalize_selected(
    tx: &mut CacheTransaction<'_>,
    set: &SelectionSet,
    variables: &Variables,
    value: &Value,
) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| normalize_selected(tx, set, variables, item))
                .collect(),
        ),
        Value::Object(map) => match ObjectKey::identify(map) {
            Some(key) => {
                write_selection(tx, &Location::Object(key.clone()), set, variables, map);
                make_ref(&key)
            }
            None => {
                let mut embedded = Map::new();
                for field in set.fields() {
                    let Some(child) = map.get(field.response_key()) else {
                        continue;
                    };
                    let stored = match &field.selection_set {
                        None => child.clone(),
                        Some(children) => normalize_selected(tx, children, variables, child),
                    };
                    embedded.insert(field.storage_key(variables).to_string(), stored);
                }
                Value::Object(embedded)
            }
        },
        other => other.clone(),
    }
}

fn read_selection<S: CacheSnapshot + ?Sized>(
    snapshot: &S,
    source: FieldSource<'_>,
    set: &SelectionSet,
    variables: &Variables,
) -> Option<Map<String, Value>> {
    let mut out = Map::new();
    for field in set.fields() {
        let stored = source.lookup(snapshot, &field.storage_key(variables))?;
        let value = match &field.selection_set {
            None => stored,
            Some(children) => resolve_value(snapshot, &stored, children, variables)?,
        };
        out.insert(field.response_key().to_string(), value);
    }
    Some(out)
}

fn resolve_value<S: CacheSnapshot + ?Sized>(
    snapshot: &S,
    stored: &Value,
    set: &SelectionSet,
    variables: &Variables,
) -> Option<Value> {
    match read_ref(stored) {
        RefValue::Ref(key) => {
            let location = Location::Object(key);
            return read_selection(snapshot, FieldSource::Normalized(&location), set, variables)
                .map(Value::Object);
        }
        RefValue::Malformed => return None,
        RefValue::NotRef => {}
    }
    match stored {
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(snapshot, item, set, variables))
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            read_selection(snapshot, FieldSource::Embedded(map), set, variables).map(Value::Object)
        }
        other => Some(other.clone()),
    }
}

/// Store an arbitrary payload value, normalizing identifiable objects.
///
/// Used where no document describes the payload (modifier payloads). Object
/// fields are keyed by their plain name.
pub fn normalize_untyped(tx: &mut CacheTransaction<'_>, value: &Value) -> Value {
    match value {
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| normalize_untyped(tx, item)).collect())
        }
        Value::Object(map) if matches!(read_ref(value), RefValue::NotRef) => {
            match ObjectKey::identify(map) {
                Some(key) => {
                    write_untyped(tx, &Location::Object(key.clone()), map);
                    make_ref(&key)
                }
                None => Value::Object(
                    map.iter()
                        .map(|(name, child)| (name.clone(), normalize_untyped(tx, child)))
                        .collect(),
                ),
            }
        }
        other => other.clone(),
    }
}

/// Default merge of one untyped payload into `location`.
pub fn write_untyped(tx: &mut CacheTransaction<'_>, location: &Location, map: &Map<String, Value>) {
    for (name, value) in map {
        let key = FieldKey::new(name.as_str());
        let incoming = normalize_untyped(tx, value);
        let merged = match tx.field(location, &key) {
            Some(existing) => merge_value(existing, incoming),
            None => incoming,
        };
        tx.write_field(location, key, merged);
    }
}

/// Merge an incoming stored value over an existing one.
///
/// Two embedded objects merge key by key; anything else is replaced.
pub fn merge_value(existing: Value, incoming: Value) -> Value {
    match (existing, incoming) {
        (Value::Object(mut base), Value::Object(update))
            if !base.contains_key(REF_FIELD) && !update.contains_key(REF_FIELD) =>
        {
            for (key, value) in update {
                let merged = match base.remove(&key) {
                    Some(current) => merge_value(current, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, incoming) => incoming,
    }
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
