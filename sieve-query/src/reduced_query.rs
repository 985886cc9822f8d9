//! Live reduced queries.
//!
//! A [`ReducedQuery`] owns the read plan of one consumer. The plan is derived
//! from (document, variables, cache snapshot) and is recomputed, never
//! patched: on every cache reset and whenever the variables change.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use sieve_core::{canonical_variables, Document, ReadOptions, StorageError, Variables};
use sieve_events::{InvalidationBroadcaster, ResetSubscription};
use sieve_storage::CacheStore;
use tracing::{debug, warn};

use crate::reducer::{plan, ReadPlan};

struct ReducedState {
    store: CacheStore,
    document: Document,
    variables: Variables,
    canonical: String,
    options: ReadOptions,
    reduce_by_default: bool,
    plan: ReadPlan,
    recomputations: u64,
}

impl ReducedState {
    fn recompute(&mut self) -> Result<(), StorageError> {
        let next = self.store.read(|cache| {
            plan(
                &self.document,
                &self.variables,
                cache,
                &self.options,
                self.reduce_by_default,
            )
        })?;
        self.plan = next;
        self.recomputations += 1;
        Ok(())
    }
}

/// A consumer's reduced document, kept current against resets.
///
/// Subscribes to the broadcaster on creation and unsubscribes when dropped.
pub struct ReducedQuery {
    state: Arc<Mutex<ReducedState>>,
    _subscription: ResetSubscription,
}

impl ReducedQuery {
    pub fn new(
        store: CacheStore,
        broadcaster: &InvalidationBroadcaster,
        document: Document,
        variables: Variables,
        options: ReadOptions,
        reduce_by_default: bool,
    ) -> Result<Self, StorageError> {
        let mut state = ReducedState {
            store,
            canonical: canonical_variables(&variables),
            document,
            variables,
            options,
            reduce_by_default,
            plan: ReadPlan::Satisfied,
            recomputations: 0,
        };
        state.recompute()?;

        let state = Arc::new(Mutex::new(state));
        let weak: Weak<Mutex<ReducedState>> = Arc::downgrade(&state);
        let subscription = broadcaster.subscribe(move |event| {
            let Some(state) = weak.upgrade() else {
                return;
            };
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            match state.recompute() {
                Ok(()) => debug!(
                    operation = state.document.operation_name(),
                    generation = event.generation,
                    "Reduced query recomputed after reset"
                ),
                Err(err) => warn!(
                    operation = state.document.operation_name(),
                    error = %err,
                    "Reduced query recompute failed"
                ),
            }
        });

        Ok(Self {
            state,
            _subscription: subscription,
        })
    }

    /// Current plan.
    pub fn plan(&self) -> ReadPlan {
        self.lock().plan.clone()
    }

    /// Current reduced document; `None` when the cache answers everything.
    pub fn reduced(&self) -> Option<Document> {
        self.lock().plan.document().cloned()
    }

    pub fn document(&self) -> Document {
        self.lock().document.clone()
    }

    pub fn variables(&self) -> Variables {
        self.lock().variables.clone()
    }

    pub fn options(&self) -> ReadOptions {
        self.lock().options.clone()
    }

    /// Times the plan has been computed.
    pub fn recomputations(&self) -> u64 {
        self.lock().recomputations
    }

    /// Rebind variables. Recomputes only when they actually differ.
    pub fn set_variables(&self, variables: Variables) -> Result<bool, StorageError> {
        let mut state = self.lock();
        let canonical = canonical_variables(&variables);
        if canonical == state.canonical {
            return Ok(false);
        }
        state.variables = variables;
        state.canonical = canonical;
        state.recompute()?;
        Ok(true)
    }

    /// Recompute against the current cache state.
    pub fn recompute(&self) -> Result<(), StorageError> {
        self.lock().recompute()
    }

    fn lock(&self) -> MutexGuard<'_, ReducedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ReducedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ReducedQuery")
            .field("operation", &state.document.operation_name())
            .field("plan", &state.plan)
            .finish()
    }
}
