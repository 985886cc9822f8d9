//! SIEVE Query - Reduced Reads and Ordered Writes
//!
//! - [`reducer`]: strips a document to the fields the cache cannot answer
//! - [`reduced_query`]: live reduced documents, recomputed on every reset
//! - [`coordinator`]: optimistic/authoritative write state machine
//! - [`optimistic`]: speculative mutation results
//! - [`client`]: read and write paths over a [`Transport`]
//! - [`callbacks`]: caller hooks around cache writes

pub mod callbacks;
pub mod client;
pub mod coordinator;
pub mod optimistic;
pub mod reduced_query;
pub mod reducer;
pub mod transport;

pub use callbacks::{CacheUpdate, DataCallback};
pub use client::{
    Client, DataSource, LazyQueryOptions, MutateOptions, MutationResult, QueryResult, SubscriptionOptions,
    WatchedQuery,
};
pub use coordinator::{WriteCoordinator, WritePhase};
pub use optimistic::{OptimisticEnvelope, MUTATION_TYPENAME};
pub use reduced_query::ReducedQuery;
pub use reducer::{plan, reduce, try_reduce, ReadPlan};
pub use transport::{OperationRequest, OperationResponse, Transport};

pub use sieve_core::{
    Document, FetchPolicy, Field, FieldKey, ObjectKey, ReadOptions, SieveConfig, SieveError, SieveResult,
    Variables,
};
pub use sieve_events::{InFlightRegistry, InvalidationBroadcaster, Services};
pub use sieve_storage::{CacheStore, Modifier, ModifierOutcome, ModifierSet};
