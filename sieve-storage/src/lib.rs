//! SIEVE Storage - Normalized Cache and Modifier Engine
//!
//! Root entries are keyed by field key, object entries by `Typename:id`.
//! Optimistic writes go to layers over the authoritative base and are rolled
//! back by removing their layer.

pub mod cache;
pub mod modifiers;

pub use cache::{
    read_result, write_result, CacheData, CacheSnapshot, CacheStore, CacheTransaction, FieldSource,
    LayerId, Location, NormalizedCache, WriteTarget,
};
pub use modifiers::{
    apply_modifiers, Modifier, ModifierEngine, ModifierInput, ModifierOutcome, ModifierReport,
    ModifierSet,
};
