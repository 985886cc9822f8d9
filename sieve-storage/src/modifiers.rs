//! Cache modifiers.
//!
//! A modifier rewrites one cached field after a write. It sees the value
//! currently stored and the value carried by the payload, and returns either
//! a replacement or [`ModifierOutcome::Delete`] to evict the field.
//!
//! ```text
//! payload {id, __typename, posts, title}
//!            │                 │      │
//!            │          modifier("posts")   default merge
//!            ▼                 ▼      ▼
//!     target = Post:5   Write(v) | Delete
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use sieve_core::{FieldKey, ModifierError, ObjectKey, SieveError, SieveResult, StorageError};
use sieve_events::{InvalidationBroadcaster, ResetEvent};
use tracing::{debug, warn};

use crate::cache::{normalize, CacheSnapshot, CacheStore, CacheTransaction, Location, WriteTarget};

/// What a modifier sees for one stored variant of a field.
#[derive(Debug, Clone, Copy)]
pub struct ModifierInput<'a> {
    /// Storage key of the variant being modified.
    pub field: &'a FieldKey,
    /// Value currently stored, or `None` when nothing is.
    pub current: Option<&'a Value>,
    /// Value carried by the write payload.
    pub incoming: &'a Value,
}

/// Result of a modifier.
#[derive(Debug, Clone, PartialEq)]
pub enum ModifierOutcome {
    Write(Value),
    /// Evict the field.
    Delete,
}

type ModifierFn = dyn Fn(ModifierInput<'_>) -> Result<ModifierOutcome, ModifierError> + Send + Sync;

/// A single field modifier.
#[derive(Clone)]
pub struct Modifier(Arc<ModifierFn>);

impl Modifier {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(ModifierInput<'_>) -> Result<ModifierOutcome, ModifierError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Always evict the field.
    pub fn delete() -> Self {
        Self::new(|_| Ok(ModifierOutcome::Delete))
    }

    pub fn call(&self, input: ModifierInput<'_>) -> Result<ModifierOutcome, ModifierError> {
        (self.0)(input)
    }
}

impl fmt::Debug for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Modifier(..)")
    }
}

/// Field name → modifier.
#[derive(Debug, Clone, Default)]
pub struct ModifierSet {
    modifiers: BTreeMap<String, Modifier>,
}

impl ModifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, modifier: Modifier) -> Self {
        self.insert(field, modifier);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, modifier: Modifier) {
        self.modifiers.insert(field.into(), modifier);
    }

    pub fn get(&self, field: &str) -> Option<&Modifier> {
        self.modifiers.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.modifiers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.modifiers.len()
    }
}

/// What one application of a modifier set did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModifierReport {
    /// Location the payload was applied to.
    pub target: Option<Location>,
    pub written: Vec<FieldKey>,
    pub evicted: Vec<FieldKey>,
    /// Fields skipped because their modifier failed.
    pub failures: Vec<(String, ModifierError)>,
}

impl ModifierReport {
    pub fn has_evictions(&self) -> bool {
        !self.evicted.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Apply a payload and its modifiers inside an open transaction.
///
/// The target is the object the payload identifies, otherwise the root.
/// A payload without identity only reaches the root through its modifiers:
/// its other keys are wrappers of the operation, so just the identifiable
/// objects nested in them are stored.
pub fn apply_modifiers(
    tx: &mut CacheTransaction<'_>,
    payload: &Value,
    modifiers: &ModifierSet,
) -> Result<ModifierReport, StorageError> {
    let Value::Object(payload) = payload else {
        return Err(StorageError::InvalidPayload {
            found: normalize::kind_of(payload).to_string(),
        });
    };
    let location = match ObjectKey::identify(payload) {
        Some(key) => Location::Object(key),
        None => Location::Root,
    };
    let mut report = ModifierReport {
        target: Some(location.clone()),
        ..ModifierReport::default()
    };

    let mut unmodified = Map::new();
    for (name, incoming) in payload {
        let Some(modifier) = modifiers.get(name) else {
            unmodified.insert(name.clone(), incoming.clone());
            continue;
        };

        let mut variants: Vec<FieldKey> = tx
            .field_keys(&location)
            .into_iter()
            .filter(|key| key.name() == name)
            .collect();
        if variants.is_empty() {
            variants.push(FieldKey::new(name.as_str()));
        }

        let mut outcomes = Vec::with_capacity(variants.len());
        let mut failed = None;
        for key in &variants {
            let current = tx.field(&location, key);
            let input = ModifierInput {
                field: key,
                current: current.as_ref(),
                incoming,
            };
            match modifier.call(input) {
                Ok(outcome) => outcomes.push((key.clone(), outcome)),
                Err(err) => {
                    failed = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failed {
            warn!(location = %location, field = %name, error = %err, "Modifier failed, field skipped");
            report.failures.push((name.clone(), err));
            continue;
        }

        for (key, outcome) in outcomes {
            match outcome {
                ModifierOutcome::Write(value) => {
                    tx.write_field(&location, key.clone(), value);
                    report.written.push(key);
                }
                ModifierOutcome::Delete => {
                    tx.evict_field(&location, &key);
                    debug!(location = %location, field = %key, "Field evicted by modifier");
                    report.evicted.push(key);
                }
            }
        }
    }

    if unmodified.is_empty() {
        return Ok(report);
    }
    match &location {
        Location::Object(_) => {
            report
                .written
                .extend(unmodified.keys().map(|name| FieldKey::new(name.as_str())));
            normalize::write_untyped(tx, &location, &unmodified);
        }
        Location::Root => {
            for value in unmodified.values() {
                normalize::normalize_untyped(tx, value);
            }
            debug!(fields = ?unmodified.keys().collect::<Vec<_>>(), "Unidentified payload keys kept out of the root");
        }
    }
    Ok(report)
}

/// Applies modifier sets to a store and announces evictions.
#[derive(Debug, Clone)]
pub struct ModifierEngine {
    store: CacheStore,
    broadcaster: InvalidationBroadcaster,
    applying: Arc<AtomicBool>,
}

impl ModifierEngine {
    pub fn new(store: CacheStore, broadcaster: InvalidationBroadcaster) -> Self {
        Self {
            store,
            broadcaster,
            applying: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Apply `payload` with `modifiers` to `target` in one transaction.
    ///
    /// Publishes a single reset after the transaction when anything was
    /// evicted. Calling `apply` from inside a modifier fails with
    /// [`ModifierError::Reentrant`]; reset handlers run after the engine is
    /// released and may apply again.
    pub fn apply(
        &self,
        target: WriteTarget,
        payload: &Value,
        modifiers: &ModifierSet,
    ) -> SieveResult<ModifierReport> {
        self.apply_with(target, payload, modifiers, |_| Ok(()))
    }

    /// Like [`apply`](Self::apply), running `before` in the same transaction
    /// ahead of the payload.
    pub fn apply_with<F>(
        &self,
        target: WriteTarget,
        payload: &Value,
        modifiers: &ModifierSet,
        before: F,
    ) -> SieveResult<ModifierReport>
    where
        F: FnOnce(&mut CacheTransaction<'_>) -> Result<(), StorageError>,
    {
        let running = self.enter()?;
        let report = self.store.transact(target, |tx| {
            before(tx)?;
            apply_modifiers(tx, payload, modifiers)
        })??;
        drop(running);

        if report.has_evictions() {
            self.publish();
        }
        Ok(report)
    }

    /// Evict a whole object entry and every reference to it.
    pub fn evict_object(&self, target: WriteTarget, key: &ObjectKey) -> SieveResult<()> {
        let running = self.enter()?;
        let existed = self.store.transact(target, |tx| tx.evict_object(key))?;
        drop(running);
        if !existed {
            return Err(StorageError::ObjectNotFound { key: key.clone() }.into());
        }
        debug!(object = %key, "Object evicted");
        self.publish();
        Ok(())
    }

    fn publish(&self) -> ResetEvent {
        self.broadcaster.publish_reset()
    }

    fn enter(&self) -> Result<RunningGuard<'_>, SieveError> {
        if self.applying.swap(true, Ordering::AcqRel) {
            return Err(ModifierError::Reentrant.into());
        }
        Ok(RunningGuard(&self.applying))
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
