//! Cache reset broadcasting.
//!
//! A single event kind, "cache reset", fanned out to every live listener.
//! Synchronous handlers run inside [`InvalidationBroadcaster::publish_reset`],
//! so by the time the publisher continues every reducer has recomputed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tracing::debug;

/// A published cache reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResetEvent {
    /// Monotonically increasing per broadcaster, starting at 1.
    pub generation: u64,
}

type ResetHandler = Arc<dyn Fn(&ResetEvent) + Send + Sync>;

struct BroadcasterInner {
    listeners: RwLock<BTreeMap<u64, ResetHandler>>,
    next_listener_id: AtomicU64,
    generation: AtomicU64,
}

/// Publish/subscribe channel for cache resets.
///
/// Cheap to clone; clones share listeners.
#[derive(Clone)]
pub struct InvalidationBroadcaster {
    inner: Arc<BroadcasterInner>,
}

impl InvalidationBroadcaster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                listeners: RwLock::new(BTreeMap::new()),
                next_listener_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Register a reset handler.
    ///
    /// The handler stays registered until the returned subscription is dropped.
    pub fn subscribe<F>(&self, handler: F) -> ResetSubscription
    where
        F: Fn(&ResetEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(handler));
        debug!(listener = id, "Reset listener subscribed");
        ResetSubscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Publish a reset to every current listener.
    ///
    /// Handlers are invoked outside the listener lock, so a handler may
    /// subscribe or unsubscribe without deadlocking.
    pub fn publish_reset(&self) -> ResetEvent {
        let event = ResetEvent {
            generation: self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1,
        };

        let handlers: Vec<ResetHandler> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for handler in &handlers {
            handler(&event);
        }

        debug!(
            generation = event.generation,
            listeners = handlers.len(),
            "Published cache reset"
        );
        event
    }

    /// Number of registered synchronous listeners.
    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Generation of the most recent reset, 0 if none was published.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Drop every listener (teardown).
    pub fn unsubscribe_all(&self) {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        debug!(listeners = listeners.len(), "Unsubscribing all reset listeners");
        listeners.clear();
    }
}

impl Default for InvalidationBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InvalidationBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationBroadcaster")
            .field("listeners", &self.listener_count())
            .field("generation", &self.generation())
            .finish()
    }
}

/// Disposer for a reset listener. Dropping it unsubscribes.
#[derive(Debug)]
pub struct ResetSubscription {
    id: u64,
    inner: Weak<BroadcasterInner>,
}

impl ResetSubscription {
    /// True while the listener is still registered.
    pub fn is_active(&self) -> bool {
        self.inner.upgrade().is_some_and(|inner| {
            inner
                .listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(&self.id)
        })
    }

    /// Unsubscribe now. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl Drop for ResetSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .listeners
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
            debug!(listener = self.id, "Reset listener unsubscribed");
        }
    }
}
