//! Property-Based Tests for Query Reduction
//!
//! **Property 1: Idempotence**
//! Reducing an already reduced document against the same cache yields it
//! again unchanged.
//!
//! **Property 2: Safety**
//! No non-identity field the cache can answer survives reduction.
//!
//! **Property 3: Completeness**
//! Once the cache holds an answer for every field of the reduced document,
//! the original document reduces to nothing and reads fully from the cache.

use proptest::prelude::*;
use serde_json::{json, Map, Value};
use sieve_core::{is_identity_field, read_ref, Argument, Field, RefValue, SelectionSet};
use sieve_query::{reduce, Document, Variables};
use sieve_storage::{read_result, write_result, CacheSnapshot, CacheStore, Location, WriteTarget};
use sieve_test_utils::generators::{arb_request, arb_seed};

// ============================================================================
// HELPERS
// ============================================================================

fn seeded(document: &Document, data: &Value) -> CacheStore {
    let store = CacheStore::new();
    store
        .transact(WriteTarget::Base, |tx| write_result(tx, document, &Variables::new(), data))
        .unwrap()
        .unwrap();
    store
}

/// A response answering every field of `set` with null, keeping the
/// identity of `user` objects so they normalize.
fn answer(set: &SelectionSet, user_id: Option<&Value>) -> Value {
    let mut object = Map::new();
    for field in set.fields() {
        let value = match (&field.selection_set, field.name.as_str()) {
            (Some(children), _) => answer(children, field.arguments.get("id").and_then(literal)),
            (None, "__typename") => json!("User"),
            (None, "id") => user_id.cloned().unwrap_or(Value::Null),
            (None, _) => Value::Null,
        };
        object.insert(field.response_key().to_string(), value);
    }
    Value::Object(object)
}

fn literal(argument: &Argument) -> Option<&Value> {
    match argument {
        Argument::Value(value) => Some(value),
        Argument::Variable(_) => None,
    }
}

/// Fields of `set` the cache can answer at `location`, identity excluded.
fn answerable<S: CacheSnapshot>(cache: &S, location: &Location, set: &SelectionSet) -> Vec<String> {
    let mut found = Vec::new();
    for field in set.fields() {
        if field.is_leaf() && is_identity_field(&field.name) {
            continue;
        }
        let Some(stored) = cache.field(location, &field.storage_key(&Variables::new())) else {
            continue;
        };
        match (&field.selection_set, read_ref(&stored)) {
            (None, _) => found.push(field.name.clone()),
            (Some(children), RefValue::Ref(key)) if cache.has_object(&key) => {
                let nested = answerable(cache, &Location::Object(key), children);
                // The object field itself is only redundant when nothing below it is missing.
                let wanted = children
                    .fields()
                    .filter(|f| !(f.is_leaf() && is_identity_field(&f.name)))
                    .count();
                if nested.len() == wanted {
                    found.push(field.name.clone());
                }
                found.extend(nested.into_iter().map(|name| format!("{}.{}", field.name, name)));
            }
            _ => {}
        }
    }
    found
}

fn field_paths(set: &SelectionSet) -> Vec<String> {
    let mut paths = Vec::new();
    for field in set.fields() {
        paths.push(field.name.clone());
        if let Some(children) = &field.selection_set {
            paths.extend(children.fields().map(|child: &Field| format!("{}.{}", field.name, child.name)));
        }
    }
    paths
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// **Property 1: Idempotence**
    #[test]
    fn prop_reduction_is_idempotent(
        (seed, data) in arb_seed(),
        request in arb_request(),
    ) {
        let store = seeded(&seed, &data);
        let vars = Variables::new();

        let once = store.read(|cache| reduce(&request, &vars, cache)).unwrap();
        if let Some(reduced) = once {
            let twice = store.read(|cache| reduce(&reduced, &vars, cache)).unwrap();
            prop_assert_eq!(twice, Some(reduced));
        }
    }

    /// **Property 2: Safety**
    #[test]
    fn prop_reduction_drops_answerable_fields(
        (seed, data) in arb_seed(),
        request in arb_request(),
    ) {
        let store = seeded(&seed, &data);
        let vars = Variables::new();

        let Some(reduced) = store.read(|cache| reduce(&request, &vars, cache)).unwrap() else {
            return Ok(());
        };
        let answerable = store
            .read(|cache| answerable(cache, &Location::Root, &request.selection_set))
            .unwrap();
        let kept = field_paths(&reduced.selection_set);
        for path in &answerable {
            prop_assert!(!kept.contains(path), "answerable field {} was kept", path);
        }
    }

    /// **Property 3: Completeness**
    #[test]
    fn prop_answering_reduced_fields_completes_cache(
        (seed, data) in arb_seed(),
        request in arb_request(),
    ) {
        let store = seeded(&seed, &data);
        let vars = Variables::new();

        if let Some(reduced) = store.read(|cache| reduce(&request, &vars, cache)).unwrap() {
            let response = answer(&reduced.selection_set, None);
            store
                .transact(WriteTarget::Base, |tx| write_result(tx, &reduced, &vars, &response))
                .unwrap()
                .unwrap();
        }

        let again = store.read(|cache| reduce(&request, &vars, cache)).unwrap();
        prop_assert_eq!(again, None);
        let full = store.read(|cache| read_result(cache, &request, &vars)).unwrap().unwrap();
        prop_assert!(full.is_some());
    }
}
