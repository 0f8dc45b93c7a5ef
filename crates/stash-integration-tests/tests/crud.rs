//! Integration tests for collection and index data operations.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use stash_db::prelude::*;
use stash_test::prelude::*;

#[tokio::test]
async fn test_put_then_get_round_trips() {
    let (stash, _engine) = recording_stash();
    let kv = stash.database("app").collection("kv");
    let value = json!({"nested": {"list": [1, 2, 3], "flag": true}, "text": "hi"});

    let (key, same_pass) = tokio::join!(kv.put_with_key(value.clone(), "k"), kv.get("k"));
    assert_eq!(key.unwrap(), Key::Text("k".into()));
    assert_eq!(same_pass.unwrap(), Some(value.clone()));

    assert_eq!(kv.get("k").await.unwrap(), Some(value));
}

#[tokio::test]
async fn test_add_on_occupied_key_fails_and_put_overwrites() {
    let (stash, _engine) = recording_stash();
    let kv = stash.database("app").collection("kv");
    kv.add_with_key(json!("original"), 1_i64).await.unwrap();

    let err = kv.add_with_key(json!("duplicate"), 1_i64).await.unwrap_err();
    assert!(matches!(
        err,
        StashError::RequestFailed(EngineError::Constraint(_))
    ));
    assert_eq!(kv.get(1_i64).await.unwrap(), Some(json!("original")));

    kv.put_with_key(json!("overwritten"), 1_i64).await.unwrap();
    assert_eq!(kv.get(1_i64).await.unwrap(), Some(json!("overwritten")));
}

#[tokio::test]
async fn test_cursor_yields_ascending_and_early_exit_is_clean() {
    let (stash, _engine) = recording_stash();
    let kv = stash.database("app").collection("kv");
    let _ = tokio::join!(
        kv.put_with_key(json!("second"), 2_i64),
        kv.put_with_key(json!("first"), 1_i64),
    );

    let entries: Vec<CursorEntry> = kv
        .open_cursor(.., Direction::Next)
        .into_stream()
        .map(Result::unwrap)
        .collect()
        .await;
    let keys: Vec<Key> = entries.iter().map(|e| e.key.clone()).collect();
    assert_eq!(keys, vec![Key::Int(1), Key::Int(2)]);

    let mut cursor = kv.open_cursor(.., Direction::Next);
    let first = cursor.next().await.unwrap().unwrap();
    assert_eq!(first.value, json!("first"));
    drop(cursor);

    assert_eq!(kv.get(2_i64).await.unwrap(), Some(json!("second")));
    assert_eq!(kv.count(..).await.unwrap(), 2);
}

#[tokio::test]
async fn test_auto_increment_keys() {
    let (stash, engine) = recording_stash();
    let db = stash.database("app");
    let store = db.collection_with("store1", auto_increment(), []);

    let first = store.add(json!({"n": "a"}));
    let second = store.add(json!({"n": "b"}));
    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap(), Key::Int(1));
    assert_eq!(second.unwrap(), Key::Int(2));
    assert_eq!(store.count(..).await.unwrap(), 2);
    assert_eq!(engine.transactions().len(), 2);
}

#[tokio::test]
async fn test_key_path_and_ranges() {
    let (stash, _engine) = recording_stash();
    let store = stash
        .database("app")
        .collection_with("people", keyed_by_id(), [by_age()]);
    let writes: Vec<_> = people().into_iter().map(|p| store.put(p)).collect();
    for key in futures::future::join_all(writes).await {
        key.unwrap();
    }

    assert_eq!(
        store
            .get_all_keys(KeyRange::bound(1_i64, 3_i64, false, true), None)
            .await
            .unwrap(),
        vec![Key::Int(1), Key::Int(2)]
    );
    assert_eq!(store.get_all(.., Some(1)).await.unwrap(), vec![person(1, "ada", 36)]);

    let by_age = store.index("by_age");
    assert_eq!(by_age.get_key(41_i64).await.unwrap(), Some(Key::Int(3)));
    let mut oldest_first = by_age.open_key_cursor(.., Direction::Prev);
    let oldest = oldest_first.next().await.unwrap().unwrap();
    assert_eq!(oldest.primary_key, Key::Int(3));

    store.delete(KeyRange::upper_bound(2_i64, false)).await.unwrap();
    assert_eq!(store.get_all_keys(.., None).await.unwrap(), vec![Key::Int(3)]);
}

#[tokio::test]
async fn test_unique_index_rejects_duplicates() {
    let (stash, _engine) = recording_stash();
    let store = stash
        .database("app")
        .collection_with("people", keyed_by_id(), [unique_name()]);
    store.put(person(1, "ada", 36)).await.unwrap();

    let err = store.put(person(2, "ada", 50)).await.unwrap_err();
    assert!(err.is_constraint());
    assert_eq!(store.count(..).await.unwrap(), 1);
}

#[tokio::test]
async fn test_typed_records() {
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Task {
        title: String,
        done: bool,
    }

    let (stash, _engine) = recording_stash();
    let tasks = stash.database("app").collection_with("tasks", auto_increment(), []);
    let task = Task {
        title: "write tests".into(),
        done: false,
    };

    let key = tasks.add_json(None, &task).await.unwrap();
    let back = tasks.get_json::<Task>(key.clone()).await.unwrap();
    assert_eq!(back, Some(task));

    let mut cursor = tasks.open_cursor(key, Direction::Next);
    let entry = cursor.next().await.unwrap().unwrap();
    assert!(!entry.value_as::<Task>().unwrap().done);
    assert!(cursor.next().await.is_none());
}

#[tokio::test]
async fn test_metadata_reports_declared_shape() {
    let (stash, _engine) = recording_stash();
    let store = stash
        .database("app")
        .collection_with("people", keyed_by_id(), [by_age(), unique_name()]);

    let info = store.metadata().await.unwrap();
    assert_eq!(info.key_path, Some(KeyPath::from("id")));
    assert_eq!(info.index_names, vec!["by_age", "by_name"]);

    let index = store.index("by_name").metadata().await.unwrap();
    assert!(index.unique);
    assert_eq!(index.key_path, Some(KeyPath::from("name")));
}
