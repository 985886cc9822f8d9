//! Caller hooks on mutations, lazy queries and subscriptions.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use sieve_query::{
    CacheUpdate, DataCallback, Document, Field, FieldKey, LazyQueryOptions, Modifier, ModifierOutcome,
    ModifierSet, MutateOptions, ObjectKey, SubscriptionOptions, Variables,
};
use sieve_storage::{write_result, CacheSnapshot, CacheStore, Location, WriteTarget};
use sieve_test_utils::fixtures::{post_payload, post_query, test_client, update_post_mutation};

fn store_with_post(title: &str) -> CacheStore {
    let store = CacheStore::new();
    store
        .transact(WriteTarget::Base, |tx| {
            write_result(tx, &post_query(), &Variables::new(), &json!({"post": post_payload(title)}))
        })
        .unwrap()
        .unwrap();
    store
}

fn recorder() -> (Arc<Mutex<Vec<Value>>>, DataCallback) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    (seen, DataCallback::new(move |data| record.lock().unwrap().push(data.clone())))
}

fn post_title(store: &CacheStore) -> Option<Value> {
    store
        .read(|cache| cache.object_field(&ObjectKey::new("Post", "5"), &FieldKey::new("title")))
        .unwrap()
}

#[tokio::test]
async fn test_mutation_update_sees_optimistic_and_server_results() {
    let (client, transport) = test_client(store_with_post("Old"));
    transport.respond("UpdatePost", json!({"updatePost": post_payload("Final")}));

    let results = Arc::new(Mutex::new(Vec::new()));
    let record = results.clone();
    let update = CacheUpdate::new(move |tx, result| {
        record.lock().unwrap().push(result.clone());
        let key = FieldKey::new("recentTitles");
        let mut titles = tx.field(&Location::Root, &key).unwrap_or_else(|| json!([]));
        if let Value::Array(items) = &mut titles {
            items.push(result["updatePost"]["title"].clone());
        }
        tx.write_field(&Location::Root, key, titles);
        Ok(())
    });

    client
        .mutate(
            update_post_mutation(),
            MutateOptions::new()
                .with_input(json!({"id": "5"}))
                .with_optimistic(json!({"__typename": "Post", "title": "Draft"}))
                .with_update(update),
        )
        .await
        .unwrap();

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["__typename"], json!("Mutation"));
    assert_eq!(results[0]["updatePost"]["title"], json!("Draft"));
    assert_eq!(results[1], json!({"updatePost": post_payload("Final")}));

    // The optimistic edit went away with its layer; only the server's stays.
    let titles = client
        .store()
        .read(|cache| cache.root_field(&FieldKey::new("recentTitles")))
        .unwrap();
    assert_eq!(titles, Some(json!(["Final"])));
    assert_eq!(post_title(client.store()), Some(json!("Final")));
}

#[tokio::test]
async fn test_lazy_query_completion_sees_modified_cache() {
    let (client, transport) = test_client(CacheStore::new());
    transport.respond("Motd", json!({"motd": "hello"}));

    let store = client.store().clone();
    let cached = Arc::new(Mutex::new(None));
    let slot = cached.clone();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let on_completed = DataCallback::new(move |data| {
        record.lock().unwrap().push(data.clone());
        *slot.lock().unwrap() = store.read(|c| c.root_field(&FieldKey::new("motd"))).unwrap();
    });
    let shout = Modifier::new(|input| {
        let text = input.incoming.as_str().unwrap_or_default().to_uppercase();
        Ok(ModifierOutcome::Write(Value::String(text)))
    });

    let options = LazyQueryOptions {
        modifiers: ModifierSet::new().with("motd", shout),
        on_completed: Some(on_completed),
        ..LazyQueryOptions::default()
    };
    client
        .lazy_query(Document::query("Motd").select(["motd"]), Variables::new(), options)
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![json!({"motd": "hello"})]);
    assert_eq!(*cached.lock().unwrap(), Some(json!("HELLO")));
}

#[tokio::test]
async fn test_failed_lazy_query_skips_completion() {
    let (client, _transport) = test_client(CacheStore::new());
    let (seen, on_completed) = recorder();
    let options = LazyQueryOptions {
        on_completed: Some(on_completed),
        ..LazyQueryOptions::default()
    };

    let result = client
        .lazy_query(Document::query("Motd").select(["motd"]), Variables::new(), options)
        .await;
    assert!(result.is_err());
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn test_subscription_data_is_cached_then_delivered() {
    let (client, _transport) = test_client(store_with_post("Old"));
    let post_updated = Document::subscription("PostUpdated")
        .select([Field::new("postUpdated").select(["__typename", "id", "title"])]);
    let (seen, on_data) = recorder();
    let options = SubscriptionOptions::new().on_data(on_data);

    let notification = json!({"postUpdated": post_payload("Live")});
    let report = client
        .apply_subscription_data(&post_updated, &notification, &options)
        .unwrap();

    assert_eq!(report.target, Some(Location::Object(ObjectKey::new("Post", "5"))));
    assert_eq!(post_title(client.store()), Some(json!("Live")));
    assert_eq!(*seen.lock().unwrap(), vec![notification]);

    let missing = client.apply_subscription_data(&post_updated, &json!({"other": 1}), &options);
    assert!(missing.is_err());
    assert_eq!(seen.lock().unwrap().len(), 1);
}
