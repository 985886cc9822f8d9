//! In-flight read tracking.
//!
//! Counts outstanding reads per operation name so writes can wait until
//! every read that started before them has settled.
//!
//! # Lifecycle
//!
//! ```text
//! register("Posts") ──→ count 1 ──→ register("Posts") ──→ count 2
//!                                                           │
//!        (drained) ←── count 0 ←── deregister ←── count 1 ←─┘
//! ```
//!
//! Prefer [`InFlightRegistry::track`]: the returned guard deregisters when
//! dropped, including when the future owning it is dropped mid-flight.
//! [`InFlightRegistry::clear`] starts a new epoch; guards from an earlier
//! epoch no longer count against anything.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use sieve_core::Timestamp;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct EntryState {
    count: usize,
    since: Timestamp,
}

/// Diagnostic view of one busy operation name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub name: String,
    pub count: usize,
    /// When the name last went from idle to busy.
    pub since: Timestamp,
}

#[derive(Default)]
struct RegistryInner {
    /// Only names with a non-zero count are kept.
    entries: Mutex<HashMap<String, EntryState>>,
    /// Bumped by `clear`, only while `entries` is locked.
    epoch: AtomicU64,
    drained: Notify,
}

/// Registry of in-flight named reads.
///
/// Cheap to clone; clones share counts.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    inner: Arc<RegistryInner>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more outstanding read for `name`.
    pub fn register(&self, name: &str) {
        register_in(&mut self.lock(), name);
    }

    /// Count one read for `name` as settled.
    ///
    /// Safe to call redundantly: counts are floored at zero.
    pub fn deregister(&self, name: &str) {
        let drained = deregister_in(&mut self.lock(), name);
        if drained {
            self.inner.drained.notify_waiters();
        }
    }

    /// Track a read for as long as the returned guard lives.
    pub fn track(&self, name: &str) -> InFlightGuard {
        let epoch = {
            let mut entries = self.lock();
            register_in(&mut entries, name);
            self.inner.epoch.load(Ordering::SeqCst)
        };
        InFlightGuard {
            registry: self.clone(),
            name: name.to_string(),
            epoch,
            released: false,
        }
    }

    fn deregister_tracked(&self, name: &str, epoch: u64) {
        let drained = {
            let mut entries = self.lock();
            if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                debug!(operation = name, "Guard from before a clear ignored");
                return;
            }
            deregister_in(&mut entries, name)
        };
        if drained {
            self.inner.drained.notify_waiters();
        }
    }

    /// True while any name has a non-zero count.
    pub fn is_any_in_flight(&self) -> bool {
        !self.lock().is_empty()
    }

    /// Outstanding reads for one name.
    pub fn in_flight(&self, name: &str) -> usize {
        self.lock().get(name).map(|e| e.count).unwrap_or(0)
    }

    /// Wait until nothing is in flight.
    ///
    /// Resolves immediately when the registry is already idle. There is no
    /// built-in timeout; wrap the call in `tokio::time::timeout` if needed.
    pub async fn wait_for_drain(&self) {
        loop {
            // Register interest before checking to avoid missing the wakeup.
            let notified = self.inner.drained.notified();
            if !self.is_any_in_flight() {
                return;
            }
            notified.await;
        }
    }

    /// Busy names, sorted by name.
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self
            .lock()
            .iter()
            .map(|(name, state)| RegistryEntry {
                name: name.clone(),
                count: state.count,
                since: state.since,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Forget every registration and wake drain waiters (teardown).
    ///
    /// Guards handed out before the clear are detached: dropping them later
    /// does not touch registrations made after it.
    pub fn clear(&self) {
        {
            let mut entries = self.lock();
            entries.clear();
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.drained.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, EntryState>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn register_in(entries: &mut HashMap<String, EntryState>, name: &str) {
    let entry = entries.entry(name.to_string()).or_insert(EntryState {
        count: 0,
        since: Utc::now(),
    });
    entry.count += 1;
    debug!(operation = name, count = entry.count, "Read registered");
}

/// Returns true when nothing is left in flight.
fn deregister_in(entries: &mut HashMap<String, EntryState>, name: &str) -> bool {
    match entries.get_mut(name) {
        Some(entry) if entry.count > 1 => {
            entry.count -= 1;
            debug!(operation = name, count = entry.count, "Read deregistered");
        }
        Some(_) => {
            entries.remove(name);
            debug!(operation = name, count = 0, "Read deregistered");
        }
        None => {
            debug!(operation = name, "Deregister without matching register ignored");
        }
    }
    entries.is_empty()
}

impl fmt::Debug for InFlightRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightRegistry")
            .field("entries", &self.snapshot())
            .finish()
    }
}

/// Registration of one in-flight read. Deregisters exactly once.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: InFlightRegistry,
    name: String,
    epoch: u64,
    released: bool,
}

impl InFlightGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Settle the read now instead of at drop.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.registry.deregister_tracked(&self.name, self.epoch);
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.release_once();
    }
}
