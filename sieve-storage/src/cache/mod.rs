//! Normalized cache.
//!
//! - [`CacheSnapshot`]: read-only presence/value lookups
//! - [`CacheStore`]: shared store with an authoritative base and optimistic layers
//! - [`normalize`]: writing results into entries and reading them back

pub mod normalize;
mod snapshot;
mod store;

pub use normalize::{read_result, write_result};
pub use snapshot::{CacheSnapshot, FieldSource, Location};
pub use store::{
    CacheData, CacheStore, CacheTransaction, FieldMap, LayerId, NormalizedCache, WriteTarget,
};
