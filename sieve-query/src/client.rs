//! Client facade.
//!
//! Ties the reducer, registry, modifier engine and write coordinator to a
//! transport. One client per cache; clones share everything.

use std::sync::Arc;

use serde_json::{Map, Value};
use sieve_core::{
    Argument, Document, DocumentError, FetchPolicy, ReadOptions, RequestContext, SieveConfig,
    SieveResult, Variables, WriteError,
};
use sieve_events::Services;
use sieve_storage::{read_result, write_result, CacheStore, ModifierEngine, ModifierReport, ModifierSet, WriteTarget};
use tracing::{debug, warn};

use crate::callbacks::{CacheUpdate, DataCallback};
use crate::coordinator::WriteCoordinator;
use crate::optimistic::OptimisticEnvelope;
use crate::reduced_query::ReducedQuery;
use crate::reducer::ReadPlan;
use crate::transport::{OperationRequest, Transport};

/// Where query data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    Cache,
    Network,
}

/// Result of a read.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// `None` only for cache-only reads the cache cannot answer.
    pub data: Option<Value>,
    pub source: DataSource,
}

/// Options of a mutation.
#[derive(Debug, Clone, Default)]
pub struct MutateOptions {
    pub variables: Variables,
    /// Bound to the mutation's only variable.
    pub input: Option<Value>,
    /// Partial response used to build the optimistic result.
    pub optimistic: Option<Value>,
    pub modifiers: ModifierSet,
    /// Custom cache edit run with the optimistic response and the server's
    /// data, ahead of the modifiers.
    pub update: Option<CacheUpdate>,
    pub context: RequestContext,
}

impl MutateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_optimistic(mut self, partial: Value) -> Self {
        self.optimistic = Some(partial);
        self
    }

    pub fn with_modifiers(mut self, modifiers: ModifierSet) -> Self {
        self.modifiers = modifiers;
        self
    }

    pub fn with_update(mut self, update: CacheUpdate) -> Self {
        self.update = Some(update);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Result of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResult {
    pub data: Value,
    pub report: ModifierReport,
}

/// Options of an on-demand query.
#[derive(Debug, Clone, Default)]
pub struct LazyQueryOptions {
    pub modifiers: ModifierSet,
    /// Called with the response data once it is cached and modified.
    pub on_completed: Option<DataCallback>,
    pub context: RequestContext,
}

/// Options of a subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    pub modifiers: ModifierSet,
    /// Called with each notification's data after it is applied.
    pub on_data: Option<DataCallback>,
}

impl SubscriptionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_modifiers(mut self, modifiers: ModifierSet) -> Self {
        self.modifiers = modifiers;
        self
    }

    pub fn on_data(mut self, callback: DataCallback) -> Self {
        self.on_data = Some(callback);
        self
    }
}

/// Entry point for reads and writes against one cache.
#[derive(Clone)]
pub struct Client {
    store: CacheStore,
    transport: Arc<dyn Transport>,
    services: Services,
    engine: ModifierEngine,
    config: SieveConfig,
}

impl Client {
    pub fn new(
        store: CacheStore,
        transport: Arc<dyn Transport>,
        services: Services,
        config: SieveConfig,
    ) -> SieveResult<Self> {
        config.validate()?;
        let engine = ModifierEngine::new(store.clone(), services.broadcaster.clone());
        Ok(Self {
            store,
            transport,
            services,
            engine,
            config,
        })
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn engine(&self) -> &ModifierEngine {
        &self.engine
    }

    pub fn config(&self) -> &SieveConfig {
        &self.config
    }

    /// Read options carrying the configured default fetch policy.
    pub fn read_options(&self) -> ReadOptions {
        self.config.read_options()
    }

    /// Start watching a query. The returned handle keeps its reduced
    /// document current until dropped.
    pub fn watch_query(
        &self,
        document: Document,
        variables: Variables,
        options: ReadOptions,
    ) -> SieveResult<WatchedQuery> {
        let reduced = ReducedQuery::new(
            self.store.clone(),
            &self.services.broadcaster,
            document,
            variables,
            options,
            self.config.reduce_queries,
        )?;
        Ok(WatchedQuery {
            client: self.clone(),
            reduced,
        })
    }

    /// One-shot read.
    pub async fn query(
        &self,
        document: Document,
        variables: Variables,
        options: ReadOptions,
    ) -> SieveResult<QueryResult> {
        self.watch_query(document, variables, options)?.fetch().await
    }

    /// Execute a mutation.
    ///
    /// The optimistic result (if any) shows immediately. The server's
    /// `data[<mutation field>]` is applied through the modifiers once every
    /// read in flight has settled. `update` runs with each result in the same
    /// transaction, ahead of the modifiers. On failure the optimistic data is
    /// rolled back and the error returned.
    pub async fn mutate(&self, document: Document, options: MutateOptions) -> SieveResult<MutationResult> {
        let operation = document.operation_name().to_string();
        let field = document.root_field()?.response_key().to_string();
        let variables = bind_input(&document, options.variables, options.input.as_ref())?;

        let mut write = WriteCoordinator::new(
            operation.clone(),
            self.engine.clone(),
            self.services.registry.clone(),
            options.modifiers,
        );
        if let Some(envelope) =
            OptimisticEnvelope::build(&field, options.input.as_ref(), options.optimistic.as_ref())
        {
            let response = envelope.response();
            let update = options.update.as_ref().map(|update| (update, &response));
            write.apply_optimistic_with(&cache_payload(envelope.payload()), update)?;
        }

        let request = self.request(document, variables, &options.context);
        let data = match self
            .transport
            .execute(request)
            .await
            .and_then(|response| response.into_data(&operation))
        {
            Ok(data) => data,
            Err(err) => {
                warn!(operation = %operation, error = %err, "Mutation failed");
                write.fail()?;
                return Err(err.into());
            }
        };

        let Some(payload) = data.get(&field) else {
            write.fail()?;
            return Err(WriteError::MissingPayload { operation, field }.into());
        };
        let update = options.update.as_ref().map(|update| (update, &data));
        let report = write
            .apply_authoritative_with(&cache_payload(payload), update)
            .await?;
        Ok(MutationResult { data, report })
    }

    /// Execute a query on demand and apply `modifiers` to its data.
    ///
    /// Always sends the full document. Only payload keys with a modifier are
    /// run through the engine; the rest was already normalized.
    pub async fn lazy_query(
        &self,
        document: Document,
        variables: Variables,
        options: LazyQueryOptions,
    ) -> SieveResult<Value> {
        let operation = document.operation_name().to_string();
        let guard = self.services.registry.track(&operation);
        let request = self.request(document.clone(), variables.clone(), &options.context);
        let data = self.transport.execute(request).await?.into_data(&operation)?;
        self.store
            .transact(WriteTarget::Base, |tx| write_result(tx, &document, &variables, &data))??;
        guard.release();

        if !options.modifiers.is_empty() {
            let modified: Map<String, Value> = data
                .as_object()
                .map(|map| {
                    map.iter()
                        .filter(|(name, _)| options.modifiers.get(name).is_some())
                        .map(|(name, value)| (name.clone(), value.clone()))
                        .collect()
                })
                .unwrap_or_default();
            if !modified.is_empty() {
                self.engine
                    .apply(WriteTarget::Base, &Value::Object(modified), &options.modifiers)?;
            }
        }
        if let Some(on_completed) = &options.on_completed {
            on_completed.call(&data);
        }
        Ok(data)
    }

    /// Apply one subscription notification, then hand it to `on_data`.
    pub fn apply_subscription_data(
        &self,
        document: &Document,
        data: &Value,
        options: &SubscriptionOptions,
    ) -> SieveResult<ModifierReport> {
        let field = document.root_field()?.response_key();
        let payload = data.get(field).ok_or_else(|| WriteError::MissingPayload {
            operation: document.operation_name().to_string(),
            field: field.to_string(),
        })?;
        debug!(operation = document.operation_name(), field, "Subscription data received");
        let report = self
            .engine
            .apply(WriteTarget::Base, &cache_payload(payload), &options.modifiers)?;
        if let Some(on_data) = &options.on_data {
            on_data.call(data);
        }
        Ok(report)
    }

    fn request(&self, document: Document, variables: Variables, context: &RequestContext) -> OperationRequest {
        OperationRequest::new(document, variables).with_context(self.config.merged_context(context))
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("services", &self.services)
            .finish()
    }
}

/// A watched query: a live reduced document plus the read path.
#[derive(Debug)]
pub struct WatchedQuery {
    client: Client,
    reduced: ReducedQuery,
}

impl WatchedQuery {
    pub fn plan(&self) -> ReadPlan {
        self.reduced.plan()
    }

    pub fn reduced_query(&self) -> &ReducedQuery {
        &self.reduced
    }

    /// Rebind variables; returns true when the plan was recomputed.
    pub fn set_variables(&self, variables: Variables) -> SieveResult<bool> {
        Ok(self.reduced.set_variables(variables)?)
    }

    /// Full result from the cache, if it can answer everything.
    pub fn read_cache(&self) -> SieveResult<Option<Value>> {
        let document = self.reduced.document();
        let variables = self.reduced.variables();
        Ok(self
            .client
            .store
            .read(|cache| read_result(cache, &document, &variables))??)
    }

    /// Run the read path.
    ///
    /// The read stays registered as in flight from the request until its
    /// result is in the cache, including when this future is dropped early.
    pub async fn fetch(&self) -> SieveResult<QueryResult> {
        let document = self.reduced.document();
        let variables = self.reduced.variables();
        let options = self.reduced.options();
        let operation = document.operation_name().to_string();

        if options.fetch_policy == FetchPolicy::CacheOnly {
            return Ok(QueryResult {
                data: self.read_cache()?,
                source: DataSource::Cache,
            });
        }

        let outbound = match self.reduced.plan() {
            ReadPlan::Satisfied => match self.read_cache()? {
                Some(data) => {
                    return Ok(QueryResult {
                        data: Some(data),
                        source: DataSource::Cache,
                    })
                }
                // Lists are resolvable as a whole; their elements may not be.
                None => {
                    debug!(operation = %operation, "Cache could not answer a satisfied plan, fetching full document");
                    document.clone()
                }
            },
            ReadPlan::Fetch(reduced) => reduced,
            ReadPlan::Bypass(full) => full,
        };

        let guard = self.client.services.registry.track(&operation);
        let request = self.client.request(outbound.clone(), variables.clone(), &options.context);
        let data = self
            .client
            .transport
            .execute(request)
            .await?
            .into_data(&operation)?;

        if options.fetch_policy == FetchPolicy::NoCache {
            guard.release();
            return Ok(QueryResult {
                data: Some(data),
                source: DataSource::Network,
            });
        }

        self.client
            .store
            .transact(WriteTarget::Base, |tx| write_result(tx, &outbound, &variables, &data))??;
        guard.release();
        self.reduced.recompute()?;

        let full = self.read_cache()?;
        Ok(QueryResult {
            data: full.or(Some(data)),
            source: DataSource::Network,
        })
    }
}

/// Bind a mutation's `input` to its only declared variable.
fn bind_input(document: &Document, mut variables: Variables, input: Option<&Value>) -> Result<Variables, DocumentError> {
    let Some(input) = input else {
        return Ok(variables);
    };
    let name = match document.variable_definitions.as_slice() {
        [only] => only.name.clone(),
        _ => single_argument_variable(document)?,
    };
    variables.insert(name, input.clone());
    Ok(variables)
}

fn single_argument_variable(document: &Document) -> Result<String, DocumentError> {
    let field = document.root_field()?;
    let mut arguments = field.arguments.values();
    match (arguments.next(), arguments.next()) {
        (Some(Argument::Variable(variable)), None) => Ok(variable.clone()),
        _ => Err(DocumentError::InvalidInput {
            operation: document.operation_name().to_string(),
            reason: "input needs exactly one variable to bind to".to_string(),
        }),
    }
}

/// Payloads without fields (scalars, null) carry nothing for the cache.
fn cache_payload(payload: &Value) -> Value {
    if payload.is_object() {
        payload.clone()
    } else {
        Value::Object(Map::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sieve_core::Field;

    #[test]
    fn test_bind_input_single_variable() {
        let doc = Document::mutation("UpdatePost")
            .variable("post", None)
            .select([Field::new("updatePost").var("input", "post").select(["id"])]);
        let vars = bind_input(&doc, Variables::new(), Some(&json!({"id": "5"}))).unwrap();
        assert_eq!(vars.get("post"), Some(&json!({"id": "5"})));
    }

    #[test]
    fn test_bind_input_from_argument() {
        let doc = Document::mutation("UpdatePost")
            .select([Field::new("updatePost").var("input", "payload").select(["id"])]);
        let vars = bind_input(&doc, Variables::new(), Some(&json!(1))).unwrap();
        assert_eq!(vars.get("payload"), Some(&json!(1)));
    }

    #[test]
    fn test_bind_input_ambiguous() {
        let doc = Document::mutation("Move")
            .variable("from", None)
            .variable("to", None)
            .select([Field::new("move").var("from", "from").var("to", "to")]);
        assert!(matches!(
            bind_input(&doc, Variables::new(), Some(&json!(1))),
            Err(DocumentError::InvalidInput { .. })
        ));
        assert!(bind_input(&doc, Variables::new(), None).is_ok());
    }

    #[test]
    fn test_cache_payload_drops_scalars() {
        assert_eq!(cache_payload(&json!(true)), json!({}));
        assert_eq!(cache_payload(&json!({"a": 1})), json!({"a": 1}));
    }
}
