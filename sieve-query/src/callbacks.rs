//! Caller hooks run around cache writes.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use sieve_core::StorageError;
use sieve_storage::CacheTransaction;

type UpdateFn = dyn Fn(&mut CacheTransaction<'_>, &Value) -> Result<(), StorageError> + Send + Sync;

/// Custom cache edit run with a mutation result.
///
/// Runs inside the same transaction as the result's modifiers, ahead of
/// them: once with the optimistic response (into the write's layer) and once
/// with the server's data (into the base). An error aborts that apply.
#[derive(Clone)]
pub struct CacheUpdate(Arc<UpdateFn>);

impl CacheUpdate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut CacheTransaction<'_>, &Value) -> Result<(), StorageError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, tx: &mut CacheTransaction<'_>, result: &Value) -> Result<(), StorageError> {
        (self.0)(tx, result)
    }
}

impl fmt::Debug for CacheUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CacheUpdate(..)")
    }
}

/// Notified with operation data once the cache holds it.
#[derive(Clone)]
pub struct DataCallback(Arc<dyn Fn(&Value) + Send + Sync>);

impl DataCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, data: &Value) {
        (self.0)(data)
    }
}

impl fmt::Debug for DataCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataCallback(..)")
    }
}
