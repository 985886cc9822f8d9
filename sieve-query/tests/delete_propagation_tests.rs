//! Field eviction reaching live queries.

use serde_json::{json, Value};
use sieve_core::ModifierError;
use sieve_query::{
    Document, Field, FieldKey, LazyQueryOptions, Modifier, ModifierOutcome, ModifierSet,
    MutateOptions, ObjectKey, ReadOptions, ReadPlan, Variables,
};
use sieve_storage::{write_result, CacheSnapshot, CacheStore, WriteTarget};
use sieve_test_utils::assertions::root_children;
use sieve_test_utils::fixtures::test_client;

fn post_with_comments() -> Document {
    Document::query("GetPost").select([Field::new("post")
        .arg("id", "5")
        .select(["__typename", "id", "title", "commentCount"])])
}

fn delete_comment() -> Document {
    Document::mutation("DeleteComment")
        .variable("id", None)
        .select([Field::new("deleteComment")
            .var("id", "id")
            .select(["__typename", "id", "commentCount"])])
}

fn seeded() -> CacheStore {
    let store = CacheStore::new();
    let data = json!({"post": {"__typename": "Post", "id": "5", "title": "Hello", "commentCount": 3}});
    store
        .transact(WriteTarget::Base, |tx| {
            write_result(tx, &post_with_comments(), &Variables::new(), &data)
        })
        .unwrap()
        .unwrap();
    store
}

fn post_field(store: &CacheStore, name: &str) -> Option<Value> {
    store
        .read(|cache| cache.object_field(&ObjectKey::new("Post", "5"), &FieldKey::new(name)))
        .unwrap()
}

#[tokio::test]
async fn test_delete_modifier_refetches_field() {
    let (client, transport) = test_client(seeded());
    let watched = client
        .watch_query(post_with_comments(), Variables::new(), ReadOptions::new())
        .unwrap();
    assert_eq!(watched.plan(), ReadPlan::Satisfied);
    let before = watched.reduced_query().recomputations();

    transport.respond(
        "DeleteComment",
        json!({"deleteComment": {"__typename": "Post", "id": "5", "commentCount": 2}}),
    );
    let result = client
        .mutate(
            delete_comment(),
            MutateOptions::new()
                .with_input(json!("c1"))
                .with_modifiers(ModifierSet::new().with("commentCount", Modifier::delete())),
        )
        .await
        .unwrap();

    assert!(result.report.has_evictions());
    assert_eq!(post_field(client.store(), "commentCount"), None);
    assert_eq!(post_field(client.store(), "title"), Some(json!("Hello")));
    assert!(watched.reduced_query().recomputations() > before);

    let ReadPlan::Fetch(reduced) = watched.plan() else {
        panic!("evicted field should be fetched again");
    };
    assert_eq!(root_children(&reduced), vec!["__typename", "id", "commentCount"]);

    transport.respond(
        "GetPost",
        json!({"post": {"__typename": "Post", "id": "5", "commentCount": 2}}),
    );
    let refreshed = watched.fetch().await.unwrap();
    assert_eq!(
        refreshed.data,
        Some(json!({"post": {"__typename": "Post", "id": "5", "title": "Hello", "commentCount": 2}}))
    );
}

#[tokio::test]
async fn test_failing_modifier_leaves_field_untouched() {
    let (client, transport) = test_client(seeded());
    transport.respond(
        "DeleteComment",
        json!({"deleteComment": {"__typename": "Post", "id": "5", "commentCount": 2}}),
    );
    let failing = Modifier::new(|input| {
        Err(ModifierError::Failed {
            field: input.field.to_string(),
            reason: "refused".to_string(),
        })
    });

    let result = client
        .mutate(
            delete_comment(),
            MutateOptions::new()
                .with_input(json!("c1"))
                .with_modifiers(ModifierSet::new().with("commentCount", failing)),
        )
        .await
        .unwrap();

    assert!(!result.report.is_clean());
    assert_eq!(post_field(client.store(), "commentCount"), Some(json!(3)));
}

#[tokio::test]
async fn test_lazy_query_applies_modifiers() {
    let (client, transport) = test_client(CacheStore::new());
    let motd = Document::query("Motd").select(["motd", "version"]);
    transport.respond("Motd", json!({"motd": "hello", "version": 7}));

    let shout = Modifier::new(|input| {
        let text = input.incoming.as_str().unwrap_or_default().to_uppercase();
        Ok(ModifierOutcome::Write(Value::String(text)))
    });
    let options = LazyQueryOptions {
        modifiers: ModifierSet::new().with("motd", shout),
        ..LazyQueryOptions::default()
    };
    let data = client.lazy_query(motd, Variables::new(), options).await.unwrap();
    assert_eq!(data, json!({"motd": "hello", "version": 7}));

    let (motd, version) = client
        .store()
        .read(|cache| {
            (
                cache.root_field(&FieldKey::new("motd")),
                cache.root_field(&FieldKey::new("version")),
            )
        })
        .unwrap();
    assert_eq!(motd, Some(json!("HELLO")));
    assert_eq!(version, Some(json!(7)));
    assert!(!client.services().registry.is_any_in_flight());
}
