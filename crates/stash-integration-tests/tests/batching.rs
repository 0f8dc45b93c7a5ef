//! Integration tests for burst coalescing.
//!
//! Operations started without the caller awaiting in between share one
//! transaction; operations awaited one at a time get one each.

#![allow(clippy::arithmetic_side_effects)]

use serde_json::json;
use stash_db::engine::TransactionMode;
use stash_db::prelude::*;
use stash_test::prelude::*;

/// Create `names` in one pass and forget the setup traffic.
async fn seeded(names: &[&str]) -> (Database, std::sync::Arc<RecordingEngine>) {
    let (stash, engine) = recording_stash();
    let db = stash.database("app");
    for name in names {
        let _ = db.collection(*name).put_with_key(json!("seed"), 1_i64);
    }
    db.flush().await;
    engine.clear();
    (db, engine)
}

#[tokio::test]
async fn test_burst_opens_one_transaction_over_the_union() {
    setup_test_logging_default();
    let (db, engine) = seeded(&["a", "b", "c"]).await;
    let a = db.collection("a");
    let b = db.collection("b");

    let write = a.put_with_key(json!("x"), 10_i64);
    let read = b.get(1_i64);
    let count = a.count(..);
    let (write, read, count) = tokio::join!(write, read, count);
    write.unwrap();
    assert_eq!(read.unwrap(), Some(json!("seed")));
    assert_eq!(count.unwrap(), 2);

    assert_eq!(
        engine.transactions(),
        vec![TransactionRecord {
            database: "app".into(),
            collections: vec!["a".into(), "b".into()],
            mode: TransactionMode::ReadWrite,
        }]
    );
}

#[tokio::test]
async fn test_read_only_burst_uses_read_only_mode() {
    let (db, engine) = seeded(&["a", "b"]).await;
    let a = db.collection("a");
    let b = db.collection("b");

    let (first, second) = tokio::join!(b.get(1_i64), a.get_all(.., None));
    assert_eq!(first.unwrap(), Some(json!("seed")));
    assert_eq!(second.unwrap(), vec![json!("seed")]);

    let transactions = engine.transactions();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].collections, vec!["b", "a"]);
    assert_eq!(transactions[0].mode, TransactionMode::ReadOnly);
}

#[tokio::test]
async fn test_awaited_operations_open_one_transaction_each() {
    let (db, engine) = seeded(&["kv"]).await;
    let kv = db.collection("kv");
    let before = db.passes();

    for i in 1..=4_i64 {
        kv.put_with_key(json!(i), i).await.unwrap();
    }
    assert_eq!(kv.count(..).await.unwrap(), 5);

    assert_eq!(engine.transactions().len(), 5);
    assert_eq!(db.passes(), before + 5);
}

#[tokio::test]
async fn test_burst_of_many_writes_is_one_transaction() {
    let (db, engine) = seeded(&["kv"]).await;
    let kv = db.collection("kv");

    let pending: Vec<_> = (1..=25_i64).map(|i| kv.put_with_key(json!(i), i)).collect();
    for result in futures::future::join_all(pending).await {
        result.unwrap();
    }

    assert_eq!(engine.transactions().len(), 1);
    assert_eq!(kv.count(..).await.unwrap(), 25);
}

#[tokio::test]
async fn test_operations_complete_in_submission_order() {
    let (db, _engine) = seeded(&["kv"]).await;
    let kv = db.collection("kv");

    let first = kv.put_with_key(json!("first"), 7_i64);
    let read = kv.get(7_i64);
    let second = kv.put_with_key(json!("second"), 7_i64);
    let (first, read, second) = tokio::join!(first, read, second);
    first.unwrap();
    second.unwrap();
    assert_eq!(read.unwrap(), Some(json!("first")));
    assert_eq!(kv.get(7_i64).await.unwrap(), Some(json!("second")));
}

#[tokio::test]
async fn test_schema_and_data_share_a_pass() {
    let (stash, engine) = recording_stash();
    let db = stash.database("app");
    let store = db.collection_with("people", keyed_by_id(), [by_age()]);

    let writes: Vec<_> = people().into_iter().map(|p| store.put(p)).collect();
    for result in futures::future::join_all(writes).await {
        result.unwrap();
    }

    assert_eq!(db.passes(), 1);
    assert_eq!(engine.upgrades(), vec![(1, 2)]);
    assert_eq!(engine.transactions().len(), 1);
    assert_eq!(db.version(), Some(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_burst_stays_whole_on_a_multi_thread_runtime() {
    let (db, engine) = seeded(&["kv"]).await;
    let kv = db.collection("kv");

    for round in 0..20_i64 {
        engine.clear();
        let writes: Vec<_> = (0..200_i64)
            .map(|i| kv.put_with_key(json!(i), round * 1000 + i))
            .collect();
        for key in futures::future::join_all(writes).await {
            key.unwrap();
        }
        assert_eq!(engine.transactions().len(), 1, "round {round}");
    }
    assert_eq!(kv.count(..).await.unwrap(), 4000);
}
