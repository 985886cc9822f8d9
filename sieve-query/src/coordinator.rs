//! Write ordering.
//!
//! Sequences the optimistic and authoritative cache writes of one mutation
//! against the reads in flight when its result arrives.
//!
//! ```text
//!            apply_optimistic
//!   Pending ─────────────────→ OptimisticApplied
//!      │                              │
//!      │ apply_authoritative          │ apply_authoritative
//!      ▼                              ▼
//!   (reads in flight?) ── yes ──→ AwaitingServer ── drained ──┐
//!      │ no                                                   │
//!      ▼                                                      ▼
//!   ServerApplied ←───────────────────────────────────────────┘
//!
//!   fail() from any non-terminal phase → Failed (optimistic layer rolled back)
//! ```
//!
//! A write without an optimistic phase goes straight from `Pending` to the
//! authoritative apply.

use std::fmt;

use serde_json::Value;
use sieve_core::{SieveResult, WriteError};
use sieve_events::InFlightRegistry;
use sieve_storage::{LayerId, ModifierEngine, ModifierReport, ModifierSet, WriteTarget};
use tracing::{debug, info, warn};

use crate::callbacks::CacheUpdate;

/// Phase of one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePhase {
    Pending,
    OptimisticApplied,
    AwaitingServer,
    ServerApplied,
    Failed,
}

impl WritePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WritePhase::ServerApplied | WritePhase::Failed)
    }
}

impl fmt::Display for WritePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WritePhase::Pending => "Pending",
            WritePhase::OptimisticApplied => "OptimisticApplied",
            WritePhase::AwaitingServer => "AwaitingServer",
            WritePhase::ServerApplied => "ServerApplied",
            WritePhase::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Drives one write through its phases.
///
/// Optimistic data goes to a layer owned by this write. The authoritative
/// apply removes that layer and writes to the base in one transaction, after
/// every read that was in flight has settled.
///
/// Dropping a coordinator before it reaches a terminal phase rolls back its
/// optimistic layer.
#[derive(Debug)]
pub struct WriteCoordinator {
    operation: String,
    engine: ModifierEngine,
    registry: InFlightRegistry,
    modifiers: ModifierSet,
    layer: LayerId,
    phase: WritePhase,
}

impl WriteCoordinator {
    pub fn new(
        operation: impl Into<String>,
        engine: ModifierEngine,
        registry: InFlightRegistry,
        modifiers: ModifierSet,
    ) -> Self {
        Self {
            operation: operation.into(),
            engine,
            registry,
            modifiers,
            layer: LayerId::new(),
            phase: WritePhase::Pending,
        }
    }

    pub fn phase(&self) -> WritePhase {
        self.phase
    }

    pub fn layer(&self) -> LayerId {
        self.layer
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Apply the speculative payload into this write's optimistic layer.
    ///
    /// Never waits on in-flight reads.
    pub fn apply_optimistic(&mut self, payload: &Value) -> SieveResult<ModifierReport> {
        self.apply_optimistic_with(payload, None)
    }

    /// Like [`apply_optimistic`](Self::apply_optimistic), running `update`
    /// with its result in the same transaction first.
    pub fn apply_optimistic_with(
        &mut self,
        payload: &Value,
        update: Option<(&CacheUpdate, &Value)>,
    ) -> SieveResult<ModifierReport> {
        self.expect(&[WritePhase::Pending], "optimistic")?;
        let report = self.engine.apply_with(
            WriteTarget::Optimistic(self.layer),
            payload,
            &self.modifiers,
            |tx| match update {
                Some((update, result)) => update.call(tx, result),
                None => Ok(()),
            },
        )?;
        self.transition(WritePhase::OptimisticApplied);
        Ok(report)
    }

    /// Apply the authoritative payload once no read is in flight.
    pub async fn apply_authoritative(&mut self, payload: &Value) -> SieveResult<ModifierReport> {
        self.apply_authoritative_with(payload, None).await
    }

    /// Like [`apply_authoritative`](Self::apply_authoritative), running
    /// `update` with its result after the layer is dropped and before the
    /// modifiers.
    pub async fn apply_authoritative_with(
        &mut self,
        payload: &Value,
        update: Option<(&CacheUpdate, &Value)>,
    ) -> SieveResult<ModifierReport> {
        self.expect(
            &[WritePhase::Pending, WritePhase::OptimisticApplied],
            "authoritative",
        )?;

        if self.registry.is_any_in_flight() {
            self.transition(WritePhase::AwaitingServer);
            info!(
                operation = %self.operation,
                in_flight = ?self.registry.snapshot().iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
                "Deferring authoritative write until reads drain"
            );
            self.registry.wait_for_drain().await;
        }

        let layer = self.layer;
        let result = self.engine.apply_with(
            WriteTarget::Base,
            payload,
            &self.modifiers,
            |tx| {
                tx.remove_layer(layer);
                match update {
                    Some((update, result)) => update.call(tx, result),
                    None => Ok(()),
                }
            },
        );
        match result {
            Ok(report) => {
                self.transition(WritePhase::ServerApplied);
                Ok(report)
            }
            Err(err) => {
                warn!(operation = %self.operation, error = %err, "Authoritative write failed");
                self.rollback();
                self.transition(WritePhase::Failed);
                Err(err)
            }
        }
    }

    /// Abandon the write: no authoritative apply, optimistic data rolled back.
    pub fn fail(&mut self) -> SieveResult<()> {
        self.expect(
            &[
                WritePhase::Pending,
                WritePhase::OptimisticApplied,
                WritePhase::AwaitingServer,
            ],
            "fail",
        )?;
        self.rollback();
        self.transition(WritePhase::Failed);
        Ok(())
    }

    fn rollback(&self) {
        match self.engine.store().remove_layer(self.layer) {
            Ok(true) => debug!(operation = %self.operation, layer = %self.layer, "Optimistic layer rolled back"),
            Ok(false) => {}
            Err(err) => warn!(operation = %self.operation, error = %err, "Optimistic rollback failed"),
        }
    }

    fn expect(&self, allowed: &[WritePhase], event: &str) -> Result<(), WriteError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(WriteError::InvalidTransition {
                from: self.phase.to_string(),
                event: event.to_string(),
            })
        }
    }

    fn transition(&mut self, next: WritePhase) {
        debug!(operation = %self.operation, from = %self.phase, to = %next, "Write phase");
        self.phase = next;
    }
}

impl Drop for WriteCoordinator {
    fn drop(&mut self) {
        if !self.phase.is_terminal() {
            self.rollback();
        }
    }
}
