//! Query reduction.
//!
//! Strips a document down to the fields the cache cannot answer.
//!
//! # Rules
//!
//! | stored value at the field's key | result                          |
//! |---------------------------------|---------------------------------|
//! | absent                          | field kept with its subtree     |
//! | any value on a leaf (incl null) | field dropped                   |
//! | null below a selection          | field dropped                   |
//! | list                            | field dropped (not per element) |
//! | reference to a missing object   | field kept with its subtree     |
//! | reference / embedded object     | recurse, keep missing children  |
//!
//! A partially reduced object keeps the identity fields (`__typename`, `id`,
//! `_id`) the original selection asked for, so the response still normalizes.

use serde_json::Value;
use sieve_core::{
    is_identity_field, read_ref, Document, Field, OperationKind, ReadOptions, ReductionError,
    RefValue, Selection, SelectionSet, Variables,
};
use sieve_storage::{CacheSnapshot, FieldSource, Location};
use tracing::{debug, warn};

/// What a read has to send over the network.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadPlan {
    /// Reduction does not apply; send the full document.
    Bypass(Document),
    /// Send only the missing fields.
    Fetch(Document),
    /// The cache answers everything.
    Satisfied,
}

impl ReadPlan {
    /// Document to send, if any.
    pub fn document(&self) -> Option<&Document> {
        match self {
            ReadPlan::Bypass(doc) | ReadPlan::Fetch(doc) => Some(doc),
            ReadPlan::Satisfied => None,
        }
    }

    pub fn is_satisfied(&self) -> bool {
        matches!(self, ReadPlan::Satisfied)
    }
}

/// Reduce `document` to the fields missing from `snapshot`.
///
/// Returns `None` when every requested field is resolvable. Any
/// [`ReductionError`] yields the full document unchanged.
pub fn reduce<S: CacheSnapshot + ?Sized>(
    document: &Document,
    variables: &Variables,
    snapshot: &S,
) -> Option<Document> {
    match try_reduce(document, variables, snapshot) {
        Ok(reduced) => reduced,
        Err(err) => {
            warn!(
                operation = document.operation_name(),
                error = %err,
                "Reduction failed, requesting full document"
            );
            Some(document.clone())
        }
    }
}

/// Like [`reduce`], surfacing the error instead of falling back.
pub fn try_reduce<S: CacheSnapshot + ?Sized>(
    document: &Document,
    variables: &Variables,
    snapshot: &S,
) -> Result<Option<Document>, ReductionError> {
    if document.kind != OperationKind::Query {
        return Err(ReductionError::UnsupportedOperation {
            kind: document.kind.to_string(),
        });
    }
    let expanded = document.expand_fragments()?;
    let variables = document.effective_variables(variables);
    let root = Location::Root;
    let reduced = reduce_set(
        snapshot,
        FieldSource::Normalized(&root),
        &expanded.selection_set,
        &variables,
        "",
    )?;
    Ok(reduced.map(|selection_set| Document {
        selection_set,
        ..expanded
    }))
}

/// Decide how a read proceeds.
///
/// Reduction is bypassed when disabled, under a cache-bypassing or
/// network-bypassing policy, for polling reads and for anything that is not
/// a query.
pub fn plan<S: CacheSnapshot + ?Sized>(
    document: &Document,
    variables: &Variables,
    snapshot: &S,
    options: &ReadOptions,
    reduce_by_default: bool,
) -> ReadPlan {
    let operation = document.operation_name();
    if document.kind != OperationKind::Query || !options.reduction_enabled(reduce_by_default) {
        debug!(
            operation,
            kind = %document.kind,
            fetch_policy = %options.fetch_policy,
            "Reduction bypassed"
        );
        return ReadPlan::Bypass(document.clone());
    }
    match reduce(document, variables, snapshot) {
        Some(reduced) => {
            debug!(operation, "Reduced read planned");
            ReadPlan::Fetch(reduced)
        }
        None => {
            debug!(operation, "Read satisfied from cache");
            ReadPlan::Satisfied
        }
    }
}

fn reduce_set<S: CacheSnapshot + ?Sized>(
    snapshot: &S,
    source: FieldSource<'_>,
    set: &SelectionSet,
    variables: &Variables,
    path: &str,
) -> Result<Option<SelectionSet>, ReductionError> {
    let mut kept = Vec::new();
    for field in set.fields() {
        if let Some(reduced) = reduce_field(snapshot, source, field, variables, path)? {
            kept.push(Selection::Field(reduced));
        }
    }
    Ok((!kept.is_empty()).then_some(SelectionSet { selections: kept }))
}

fn reduce_field<S: CacheSnapshot + ?Sized>(
    snapshot: &S,
    source: FieldSource<'_>,
    field: &Field,
    variables: &Variables,
    path: &str,
) -> Result<Option<Field>, ReductionError> {
    let Some(stored) = source.lookup(snapshot, &field.storage_key(variables)) else {
        return Ok(Some(field.clone()));
    };
    let Some(children) = &field.selection_set else {
        return Ok(None);
    };
    let path = if path.is_empty() {
        field.response_key().to_string()
    } else {
        format!("{}.{}", path, field.response_key())
    };

    let reduced = match read_ref(&stored) {
        RefValue::Ref(key) => {
            if !snapshot.has_object(&key) {
                return Ok(Some(field.clone()));
            }
            let location = Location::Object(key);
            reduce_set(snapshot, FieldSource::Normalized(&location), children, variables, &path)?
        }
        RefValue::Malformed => {
            return Err(ReductionError::MalformedReference {
                field: path,
                reason: "reference must be an object holding only a string __ref".to_string(),
            });
        }
        RefValue::NotRef => match &stored {
            Value::Object(map) => {
                reduce_set(snapshot, FieldSource::Embedded(map), children, variables, &path)?
            }
            // Lists count as resolvable as a whole; scalars and null cannot
            // hold any further selection.
            _ => None,
        },
    };

    Ok(reduced.map(|partial| Field {
        selection_set: Some(with_identity(children, partial)),
        ..field.clone()
    }))
}

fn with_identity(original: &SelectionSet, mut partial: SelectionSet) -> SelectionSet {
    let identity: Vec<Selection> = original
        .fields()
        .filter(|f| f.is_leaf() && is_identity_field(&f.name))
        .filter(|f| {
            !partial
                .fields()
                .any(|kept| kept.response_key() == f.response_key())
        })
        .cloned()
        .map(Selection::Field)
        .collect();
    partial.selections.splice(0..0, identity);
    partial
}
