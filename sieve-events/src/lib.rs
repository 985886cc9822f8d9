//! SIEVE Events - Reset Broadcasting and In-Flight Read Tracking
//!
//! The two pieces of shared coordination state in SIEVE:
//!
//! - [`InvalidationBroadcaster`]: publish/subscribe channel for "cache reset"
//!   events raised when a modifier evicts cached data.
//! - [`InFlightRegistry`]: per-operation counters of outstanding reads, with
//!   a drain-wait used to order authoritative writes after pending reads.
//!
//! Neither is a global. [`Services`] bundles one instance of each; create it
//! once and hand clones to every component that needs it.

mod broadcaster;
mod registry;

pub use broadcaster::{InvalidationBroadcaster, ResetEvent, ResetSubscription};
pub use registry::{InFlightGuard, InFlightRegistry, RegistryEntry};

/// Injectable coordination services shared by a cache and its clients.
#[derive(Debug, Clone, Default)]
pub struct Services {
    pub broadcaster: InvalidationBroadcaster,
    pub registry: InFlightRegistry,
}

impl Services {
    /// Fresh services: no listeners, nothing in flight.
    pub fn new() -> Self {
        Self::default()
    }

    /// Teardown: drop every reset listener and forget in-flight reads.
    pub fn shutdown(&self) {
        self.broadcaster.unsubscribe_all();
        self.registry.clear();
    }
}
