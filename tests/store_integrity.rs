use std::sync::Arc;

use serde_json::json;

use entgldb::model::{OpKind, OplogEntry, GENESIS_HASH};
use entgldb::store::{FilePersistence, MemoryPeerStore, PeerStore};
use entgldb::HlcTimestamp;

#[tokio::test]
async fn put_get_round_trip_through_the_store() {
    let store = MemoryPeerStore::new("node-a");
    store
        .save_document("users", "u1", json!({"name": "Alice", "age": 30}))
        .await
        .unwrap();

    let doc = store.get_document("users", "u1").await.unwrap().unwrap();
    assert_eq!(doc.content, json!({"name": "Alice", "age": 30}));
}

#[tokio::test]
async fn chain_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    {
        let store = MemoryPeerStore::with_persistence(
            "node-a",
            Arc::new(FilePersistence::new(path.clone())),
        )
        .unwrap();
        for i in 0..5 {
            store
                .save_document("kv", &format!("k{i}"), json!({"i": i}))
                .await
                .unwrap();
        }
        store.delete_document("kv", "k0").await.unwrap();
    }

    let reopened = MemoryPeerStore::with_persistence(
        "node-a",
        Arc::new(FilePersistence::new(path.clone())),
    )
    .unwrap();
    let entries = reopened.get_oplog_after(None, 100).await.unwrap();
    assert_eq!(entries.len(), 6);
    entgldb::model::verify_chain(&entries).unwrap();

    // The tombstone survived the restart.
    assert!(reopened.get_document("kv", "k0").await.unwrap().is_none());
    let record = reopened
        .get_document_record("kv", "k0")
        .await
        .unwrap()
        .unwrap();
    assert!(record.is_deleted);

    // New writes keep extending the restored chain.
    reopened
        .save_document("kv", "post-restart", json!(true))
        .await
        .unwrap();
    let entries = reopened.get_oplog_after(None, 100).await.unwrap();
    entgldb::model::verify_chain(&entries).unwrap();
}

#[tokio::test]
async fn restart_never_reissues_old_timestamps() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let head = {
        let store = MemoryPeerStore::with_persistence(
            "node-a",
            Arc::new(FilePersistence::new(path.clone())),
        )
        .unwrap();
        store.save_document("kv", "k", json!(1)).await.unwrap();
        store.get_latest_timestamp().await.unwrap()
    };

    let reopened = MemoryPeerStore::with_persistence(
        "node-a",
        Arc::new(FilePersistence::new(path.clone())),
    )
    .unwrap();
    let doc = reopened.save_document("kv", "k", json!(2)).await.unwrap();
    assert!(doc.updated_at > head);
}

#[tokio::test]
async fn tampered_payload_is_detected_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    {
        let store = MemoryPeerStore::with_persistence(
            "node-a",
            Arc::new(FilePersistence::new(path.clone())),
        )
        .unwrap();
        for i in 0..5 {
            store
                .save_document("kv", &format!("k{i}"), json!({"value": i}))
                .await
                .unwrap();
        }
    }

    // Flip a payload byte in the persisted oplog.
    let mut state: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    state["oplog"][3]["payload"]["value"] = json!(999);
    std::fs::write(&path, serde_json::to_vec(&state).unwrap()).unwrap();

    let err = MemoryPeerStore::with_persistence(
        "node-a",
        Arc::new(FilePersistence::new(path.clone())),
    )
    .unwrap_err();
    assert_eq!(err.code_str(), "DATABASE_CORRUPTION");
}

#[tokio::test]
async fn broken_chain_linkage_is_detected_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    {
        let store = MemoryPeerStore::with_persistence(
            "node-a",
            Arc::new(FilePersistence::new(path.clone())),
        )
        .unwrap();
        store.save_document("kv", "k1", json!(1)).await.unwrap();
        store.save_document("kv", "k2", json!(2)).await.unwrap();
    }

    // Remove the first entry so the survivor's prev_hash dangles.
    let mut state: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    let entries = state["oplog"].as_array_mut().unwrap();
    entries.remove(0);
    std::fs::write(&path, serde_json::to_vec(&state).unwrap()).unwrap();

    let err = MemoryPeerStore::with_persistence(
        "node-a",
        Arc::new(FilePersistence::new(path)),
    )
    .unwrap_err();
    assert_eq!(err.code_str(), "DATABASE_CORRUPTION");
}

#[tokio::test]
async fn rejected_batches_leave_no_trace() {
    let store = MemoryPeerStore::new("node-b");

    let good = OplogEntry::chained(
        GENESIS_HASH,
        "kv",
        "good",
        OpKind::Put,
        Some(json!(1)),
        HlcTimestamp::new(100, 0, "node-a"),
    );
    let mut bad = OplogEntry::chained(
        good.hash,
        "kv",
        "bad",
        OpKind::Put,
        Some(json!(2)),
        HlcTimestamp::new(101, 0, "node-a"),
    );
    bad.payload = Some(json!("tampered"));

    let err = store
        .apply_batch(Vec::new(), vec![good.clone(), bad])
        .await
        .unwrap_err();
    assert_eq!(err.code_str(), "SYNC_ERROR");

    assert!(store.get_oplog_after(None, 10).await.unwrap().is_empty());
    assert!(store.get_document("kv", "good").await.unwrap().is_none());
    assert!(store.get_vector_clock().await.unwrap().is_empty());

    // The intact prefix alone applies cleanly afterwards.
    store.apply_batch(Vec::new(), vec![good]).await.unwrap();
    assert!(store.get_document("kv", "good").await.unwrap().is_some());
}
