//! SIEVE Test Utilities
//!
//! Shared test infrastructure for the SIEVE workspace:
//! - A scripted mock transport with gated (hand-released) responses
//! - Proptest generators for cache seeds and request documents
//! - Fixtures for the common post/user documents
//! - Test logging setup

pub use sieve_core::{
    Document, Field, FieldKey, ObjectKey, ReadOptions, SieveConfig, SieveError, SieveResult,
    TransportError, Variables,
};
pub use sieve_query::{Client, OperationRequest, OperationResponse, Transport};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

// ============================================================================
// MOCK TRANSPORT
// ============================================================================

type Reply = Result<OperationResponse, TransportError>;

enum Scripted {
    Ready(Reply),
    Gated(oneshot::Receiver<Reply>),
}

#[derive(Default)]
struct MockState {
    scripts: HashMap<String, VecDeque<Scripted>>,
    requests: Vec<OperationRequest>,
}

/// Transport answering from per-operation scripts, in order.
///
/// An operation without a scripted reply fails with
/// [`TransportError::RequestFailed`].
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply for `operation`.
    pub fn respond(&self, operation: &str, data: Value) -> &Self {
        self.push(operation, Scripted::Ready(Ok(OperationResponse::data(data))));
        self
    }

    /// Queue a failing reply for `operation`.
    pub fn fail(&self, operation: &str, error: TransportError) -> &Self {
        self.push(operation, Scripted::Ready(Err(error)));
        self
    }

    /// Queue a reply released by hand through the returned gate.
    pub fn gate(&self, operation: &str) -> ResponseGate {
        let (tx, rx) = oneshot::channel();
        self.push(operation, Scripted::Gated(rx));
        ResponseGate { tx }
    }

    /// Every request executed so far, in order.
    pub fn requests(&self) -> Vec<OperationRequest> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self, operation: &str) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.operation_name() == operation)
            .count()
    }

    /// Most recent request for `operation`.
    pub fn last_request(&self, operation: &str) -> Option<OperationRequest> {
        self.lock()
            .requests
            .iter()
            .rev()
            .find(|r| r.operation_name() == operation)
            .cloned()
    }

    fn push(&self, operation: &str, scripted: Scripted) {
        self.lock()
            .scripts
            .entry(operation.to_string())
            .or_default()
            .push_back(scripted);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: OperationRequest) -> Result<OperationResponse, TransportError> {
        let operation = request.operation_name().to_string();
        let scripted = {
            let mut state = self.lock();
            state.requests.push(request);
            state.scripts.get_mut(&operation).and_then(VecDeque::pop_front)
        };
        match scripted {
            Some(Scripted::Ready(reply)) => reply,
            Some(Scripted::Gated(rx)) => rx.await.unwrap_or(Err(TransportError::Closed)),
            None => Err(TransportError::RequestFailed {
                operation,
                reason: "no scripted response".to_string(),
            }),
        }
    }
}

/// Hand-released reply of a [`MockTransport`].
///
/// Dropping the gate without releasing it fails the request with
/// [`TransportError::Closed`].
#[derive(Debug)]
pub struct ResponseGate {
    tx: oneshot::Sender<Reply>,
}

impl ResponseGate {
    pub fn respond(self, data: Value) {
        let _ = self.tx.send(Ok(OperationResponse::data(data)));
    }

    pub fn fail(self, error: TransportError) {
        let _ = self.tx.send(Err(error));
    }
}

// ============================================================================
// LOGGING
// ============================================================================

/// Install a test subscriber honouring `RUST_LOG` (default `warn`).
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies over a small fixed schema.
    //!
    //! Root scalars: [`ROOT_SCALARS`]. One object field `user(id: n)` whose
    //! children are drawn from [`USER_FIELDS`]. Seeds always carry the user's
    //! identity so it normalizes into a `User:n` entry.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Map};

    pub const ROOT_SCALARS: [&str; 4] = ["motd", "version", "count", "flag"];
    pub const USER_FIELDS: [&str; 4] = ["name", "age", "email", "bio"];

    /// Any JSON scalar, null included.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<i64>().prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
            "[a-z]{0,8}".prop_map(Value::from),
        ]
    }

    pub fn arb_user_id() -> impl Strategy<Value = i64> {
        1i64..=3
    }

    fn arb_names(names: &'static [&'static str], min: usize) -> impl Strategy<Value = Vec<&'static str>> {
        proptest::sample::subsequence(names.to_vec(), min..=names.len())
    }

    fn user_field(id: i64, children: &[&str], identity: bool) -> Field {
        let mut selections: Vec<&str> = Vec::new();
        if identity {
            selections.extend(["__typename", "id"]);
        }
        selections.extend(children.iter().copied());
        Field::new("user").arg("id", id).select(selections)
    }

    /// A seed: a document and the result data to write for it.
    pub fn arb_seed() -> impl Strategy<Value = (Document, Value)> {
        (
            arb_names(&ROOT_SCALARS, 0),
            prop::collection::vec(arb_scalar(), ROOT_SCALARS.len()),
            prop::option::of((
                arb_user_id(),
                arb_names(&USER_FIELDS, 0),
                prop::collection::vec(arb_scalar(), USER_FIELDS.len()),
            )),
        )
            .prop_map(|(roots, root_values, user)| {
                let mut document = Document::query("Seed");
                let mut data = Map::new();
                for (name, value) in roots.iter().zip(root_values) {
                    document = document.select([*name]);
                    data.insert(name.to_string(), value);
                }
                if let Some((id, fields, values)) = user {
                    document = document.select([user_field(id, &fields, true)]);
                    let mut object = Map::new();
                    object.insert("__typename".to_string(), json!("User"));
                    object.insert("id".to_string(), json!(id));
                    for (name, value) in fields.iter().zip(values) {
                        object.insert(name.to_string(), value);
                    }
                    data.insert("user".to_string(), Value::Object(object));
                }
                (document, Value::Object(data))
            })
    }

    /// A request document over the same schema.
    pub fn arb_request() -> impl Strategy<Value = Document> {
        (
            arb_names(&ROOT_SCALARS, 0),
            prop::option::of((arb_user_id(), arb_names(&USER_FIELDS, 1), any::<bool>())),
        )
            .prop_map(|(roots, user)| {
                let mut document = Document::query("Request").select(roots);
                if let Some((id, fields, identity)) = user {
                    document = document.select([user_field(id, &fields, identity)]);
                }
                document
            })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built documents, payloads and clients.

    use super::*;
    use serde_json::json;
    use sieve_events::Services;
    use sieve_storage::{write_result, CacheStore, WriteTarget};

    /// `query GetPost { post(id: "5") { __typename id title } }`
    pub fn post_query() -> Document {
        Document::query("GetPost").select([Field::new("post")
            .arg("id", "5")
            .select(["__typename", "id", "title"])])
    }

    /// `query GetUser($id) { user(id: $id) { name age } }`
    pub fn user_query() -> Document {
        Document::query("GetUser")
            .variable("id", None)
            .select([Field::new("user").var("id", "id").select(["name", "age"])])
    }

    /// `mutation UpdatePost($input) { updatePost(input: $input) { __typename id title } }`
    pub fn update_post_mutation() -> Document {
        Document::mutation("UpdatePost")
            .variable("input", None)
            .select([Field::new("updatePost")
                .var("input", "input")
                .select(["__typename", "id", "title"])])
    }

    pub fn post_payload(title: &str) -> Value {
        json!({"__typename": "Post", "id": "5", "title": title})
    }

    pub fn variables(value: Value) -> Variables {
        match value {
            Value::Object(map) => map,
            _ => Variables::new(),
        }
    }

    /// Store holding `user(id: 1) { __typename id name: "Ann" }`.
    pub fn store_with_ann() -> CacheStore {
        let store = CacheStore::new();
        let seed = Document::query("Seed")
            .variable("id", None)
            .select([Field::new("user").var("id", "id").select(["__typename", "id", "name"])]);
        let data = json!({"user": {"__typename": "User", "id": 1, "name": "Ann"}});
        store
            .transact(WriteTarget::Base, |tx| {
                write_result(tx, &seed, &variables(json!({"id": 1})), &data)
            })
            .and_then(|written| written)
            .unwrap_or_else(|err| panic!("seeding fixture store failed: {err}"));
        store
    }

    /// Client over `store` and a fresh mock transport.
    pub fn test_client(store: CacheStore) -> (Client, MockTransport) {
        let transport = MockTransport::new();
        let client = Client::new(
            store,
            Arc::new(transport.clone()),
            Services::default(),
            SieveConfig::default(),
        )
        .unwrap_or_else(|err| panic!("default config must be valid: {err}"));
        (client, transport)
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! SIEVE-specific assertion helpers.

    use super::*;

    /// Field names of a selection set, in order.
    pub fn field_names(set: &sieve_core::SelectionSet) -> Vec<String> {
        set.fields().map(|f| f.name.clone()).collect()
    }

    /// Child field names under the first top-level field.
    #[track_caller]
    pub fn root_children(document: &Document) -> Vec<String> {
        let root = document
            .root_field()
            .unwrap_or_else(|err| panic!("document has no root field: {err}"));
        root.selection_set
            .as_ref()
            .map(field_names)
            .unwrap_or_default()
    }

    /// Assert a result is a transport error.
    #[track_caller]
    pub fn assert_transport_error<T: std::fmt::Debug>(result: &SieveResult<T>) {
        match result {
            Err(SieveError::Transport(_)) => {}
            other => panic!("Expected Transport error, got: {:?}", other),
        }
    }
}
