use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_lock::Mutex;
use async_trait::async_trait;
use serde_json::Value;

use crate::clock::{HlcClock, HlcTimestamp};
use crate::error::{sync_error, EntglResult};
use crate::model::{
    Document, Hash, OpKind, OplogEntry, RemotePeer, SnapshotMetadata, VectorClock,
    GENESIS_HASH, SYSTEM_PEERS_COLLECTION,
};
use crate::query::Filter;
use crate::store::persistence::{PersistedState, StorePersistence};
use crate::store::{ChangeBroadcast, ChangesListener, ChangesSubscription, PeerStore};

#[derive(Default)]
struct StoreState {
    documents: BTreeMap<(String, String), Document>,
    oplog: Vec<OplogEntry>,
    seen_hashes: HashSet<Hash>,
    chain_heads: HashMap<String, Hash>,
    vector_clock: VectorClock,
    snapshots: BTreeMap<String, SnapshotMetadata>,
    indexes: BTreeMap<String, BTreeSet<String>>,
}

impl StoreState {
    fn from_persisted(persisted: PersistedState) -> Self {
        let mut state = StoreState {
            vector_clock: persisted.vector_clock,
            snapshots: persisted
                .snapshots
                .into_iter()
                .map(|meta| (meta.node_id.clone(), meta))
                .collect(),
            ..StoreState::default()
        };
        // Checkpoint hashes seed chain heads for nodes whose entries were
        // fully pruned.
        for meta in state.snapshots.values() {
            state
                .chain_heads
                .insert(meta.node_id.clone(), meta.hash);
        }
        for doc in persisted.documents {
            state
                .documents
                .insert((doc.collection.clone(), doc.key.clone()), doc);
        }
        for entry in persisted.oplog {
            state.seen_hashes.insert(entry.hash);
            state
                .chain_heads
                .insert(entry.node_id().to_owned(), entry.hash);
            state.oplog.push(entry);
        }
        state
    }

    fn to_persisted(&self) -> PersistedState {
        PersistedState {
            documents: self.documents.values().cloned().collect(),
            oplog: self.oplog.clone(),
            vector_clock: self.vector_clock.clone(),
            snapshots: self.snapshots.values().cloned().collect(),
        }
    }

    fn latest_entry_timestamp(&self) -> Option<HlcTimestamp> {
        self.oplog
            .iter()
            .map(|entry| entry.timestamp.clone())
            .max()
    }
}

/// Reference `PeerStore` driver holding everything in memory, with an optional
/// persistence hook that snapshots state and re-verifies the hash chain on
/// load.
pub struct MemoryPeerStore {
    clock: HlcClock,
    state: Mutex<StoreState>,
    changes: Arc<ChangeBroadcast>,
    persistence: Option<Arc<dyn StorePersistence>>,
}

impl std::fmt::Debug for MemoryPeerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPeerStore").finish_non_exhaustive()
    }
}

impl MemoryPeerStore {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            clock: HlcClock::new(node_id),
            state: Mutex::new(StoreState::default()),
            changes: Arc::new(ChangeBroadcast::default()),
            persistence: None,
        }
    }

    pub fn with_max_drift(node_id: impl Into<String>, max_drift: Duration) -> Self {
        Self {
            clock: HlcClock::with_max_drift(node_id, max_drift),
            state: Mutex::new(StoreState::default()),
            changes: Arc::new(ChangeBroadcast::default()),
            persistence: None,
        }
    }

    /// Opens a store backed by `persistence`. Fails with `DATABASE_CORRUPTION`
    /// when the persisted oplog does not verify against its hash chain.
    pub fn with_persistence(
        node_id: impl Into<String>,
        persistence: Arc<dyn StorePersistence>,
    ) -> EntglResult<Self> {
        let state = match persistence.load_state()? {
            Some(persisted) => {
                let checkpoint_heads = persisted
                    .snapshots
                    .iter()
                    .map(|meta| (meta.node_id.clone(), meta.hash))
                    .collect();
                crate::model::verify_chain_from(&persisted.oplog, &checkpoint_heads)?;
                StoreState::from_persisted(persisted)
            }
            None => StoreState::default(),
        };

        let clock = HlcClock::new(node_id);
        if let Some(head) = state.latest_entry_timestamp() {
            clock.restore(&head);
        }

        Ok(Self {
            clock,
            state: Mutex::new(state),
            changes: Arc::new(ChangeBroadcast::default()),
            persistence: Some(persistence),
        })
    }

    pub fn node_id(&self) -> &str {
        self.clock.node_id()
    }

    fn persist(&self, state: &StoreState) -> EntglResult<()> {
        if let Some(persistence) = &self.persistence {
            persistence.save_state(&state.to_persisted())?;
        }
        Ok(())
    }

    fn append_local(
        &self,
        state: &mut StoreState,
        collection: &str,
        key: &str,
        op: OpKind,
        payload: Option<Value>,
    ) -> (Document, OplogEntry) {
        let timestamp = self.clock.tick();
        let prev = state
            .chain_heads
            .get(self.clock.node_id())
            .copied()
            .unwrap_or(GENESIS_HASH);
        let entry = OplogEntry::chained(prev, collection, key, op, payload, timestamp.clone());

        let document = match op {
            OpKind::Put => Document::new(
                collection,
                key,
                entry.payload.clone().unwrap_or(Value::Null),
                timestamp.clone(),
            ),
            OpKind::Delete => Document::tombstone(collection, key, timestamp.clone()),
        };

        state.documents.insert(
            (collection.to_owned(), key.to_owned()),
            document.clone(),
        );
        state.seen_hashes.insert(entry.hash);
        state
            .chain_heads
            .insert(self.clock.node_id().to_owned(), entry.hash);
        state.vector_clock.advance(&timestamp);
        state.oplog.push(entry.clone());
        (document, entry)
    }
}

#[async_trait]
impl PeerStore for MemoryPeerStore {
    async fn save_document(
        &self,
        collection: &str,
        key: &str,
        content: Value,
    ) -> EntglResult<Document> {
        let (document, entry) = {
            let mut state = self.state.lock().await;
            let pair = self.append_local(&mut state, collection, key, OpKind::Put, Some(content));
            self.persist(&state)?;
            pair
        };
        self.changes.emit(std::slice::from_ref(&entry));
        Ok(document)
    }

    async fn delete_document(&self, collection: &str, key: &str) -> EntglResult<Document> {
        let (document, entry) = {
            let mut state = self.state.lock().await;
            let pair = self.append_local(&mut state, collection, key, OpKind::Delete, None);
            self.persist(&state)?;
            pair
        };
        self.changes.emit(std::slice::from_ref(&entry));
        Ok(document)
    }

    async fn get_document(&self, collection: &str, key: &str) -> EntglResult<Option<Document>> {
        let state = self.state.lock().await;
        Ok(state
            .documents
            .get(&(collection.to_owned(), key.to_owned()))
            .filter(|doc| !doc.is_deleted)
            .cloned())
    }

    async fn get_document_record(
        &self,
        collection: &str,
        key: &str,
    ) -> EntglResult<Option<Document>> {
        let state = self.state.lock().await;
        Ok(state
            .documents
            .get(&(collection.to_owned(), key.to_owned()))
            .cloned())
    }

    async fn apply_batch(
        &self,
        docs: Vec<Document>,
        entries: Vec<OplogEntry>,
    ) -> EntglResult<Vec<OplogEntry>> {
        let applied = {
            let mut state = self.state.lock().await;

            let mut batch = entries;
            batch.sort_by(|left, right| left.sort_key().cmp(&right.sort_key()));

            // Validation pass over scratch chain state: the batch commits only
            // if every fresh entry verifies and links, so a failure leaves no
            // partial writes behind.
            let mut scratch_heads = state.chain_heads.clone();
            let mut fresh = Vec::with_capacity(batch.len());
            for entry in batch {
                if state.seen_hashes.contains(&entry.hash) {
                    continue;
                }
                if entry.hash != entry.expected_hash() {
                    return Err(sync_error(format!(
                        "rejected batch: entry for {}/{} fails hash verification",
                        entry.collection, entry.key
                    )));
                }
                let expected_prev = scratch_heads
                    .get(entry.node_id())
                    .copied()
                    .unwrap_or(GENESIS_HASH);
                if entry.prev_hash != expected_prev {
                    return Err(sync_error(format!(
                        "rejected batch: entry for {}/{} breaks the chain of node {}",
                        entry.collection,
                        entry.key,
                        entry.node_id()
                    )));
                }
                scratch_heads.insert(entry.node_id().to_owned(), entry.hash);
                fresh.push(entry);
            }

            if fresh.is_empty() {
                return Ok(Vec::new());
            }

            // Commit pass.
            let mut incoming_docs: HashMap<(String, String), Document> = docs
                .into_iter()
                .map(|doc| ((doc.collection.clone(), doc.key.clone()), doc))
                .collect();

            for entry in &fresh {
                let slot = (entry.collection.clone(), entry.key.clone());
                let incoming = incoming_docs.remove(&slot).unwrap_or_else(|| match entry.op {
                    OpKind::Put => Document::new(
                        &entry.collection,
                        &entry.key,
                        entry.payload.clone().unwrap_or(Value::Null),
                        entry.timestamp.clone(),
                    ),
                    OpKind::Delete => {
                        Document::tombstone(&entry.collection, &entry.key, entry.timestamp.clone())
                    }
                });

                let stale = state
                    .documents
                    .get(&slot)
                    .map(|stored| stored.updated_at >= incoming.updated_at)
                    .unwrap_or(false);
                if !stale {
                    state.documents.insert(slot, incoming);
                }

                state.seen_hashes.insert(entry.hash);
                state
                    .chain_heads
                    .insert(entry.node_id().to_owned(), entry.hash);
                state.vector_clock.advance(&entry.timestamp);
                self.clock.observe(&entry.timestamp);
                state.oplog.push(entry.clone());
            }

            self.persist(&state)?;
            fresh
        };

        self.changes.emit(&applied);
        Ok(applied)
    }

    async fn get_oplog_after(
        &self,
        cursor: Option<&HlcTimestamp>,
        limit: usize,
    ) -> EntglResult<Vec<OplogEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<OplogEntry> = state
            .oplog
            .iter()
            .filter(|entry| match cursor {
                Some(cursor) => &entry.timestamp > cursor,
                None => true,
            })
            .cloned()
            .collect();
        entries.sort_by(|left, right| left.sort_key().cmp(&right.sort_key()));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn get_vector_clock(&self) -> EntglResult<VectorClock> {
        let state = self.state.lock().await;
        Ok(state.vector_clock.clone())
    }

    async fn advance_cursor(&self, peer_id: &str, timestamp: &HlcTimestamp) -> EntglResult<()> {
        let mut state = self.state.lock().await;
        if state.vector_clock.advance_entry(peer_id, timestamp) {
            self.persist(&state)?;
        }
        Ok(())
    }

    async fn get_latest_timestamp(&self) -> EntglResult<HlcTimestamp> {
        Ok(self.clock.head())
    }

    async fn observe_remote(&self, remote: &HlcTimestamp) -> EntglResult<HlcTimestamp> {
        Ok(self.clock.observe(remote))
    }

    async fn query_documents(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> EntglResult<Vec<Document>> {
        let state = self.state.lock().await;
        Ok(state
            .documents
            .values()
            .filter(|doc| doc.collection == collection && !doc.is_deleted)
            .filter(|doc| filter.matches(&doc.content))
            .cloned()
            .collect())
    }

    async fn count_documents(
        &self,
        collection: &str,
        filter: Option<&Filter>,
    ) -> EntglResult<usize> {
        let state = self.state.lock().await;
        Ok(state
            .documents
            .values()
            .filter(|doc| doc.collection == collection && !doc.is_deleted)
            .filter(|doc| filter.map(|f| f.matches(&doc.content)).unwrap_or(true))
            .count())
    }

    async fn get_collections(&self) -> EntglResult<Vec<String>> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state
            .documents
            .values()
            .filter(|doc| !doc.is_deleted)
            .map(|doc| doc.collection.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn ensure_index(&self, collection: &str, path: &str) -> EntglResult<()> {
        let mut state = self.state.lock().await;
        state
            .indexes
            .entry(collection.to_owned())
            .or_default()
            .insert(path.to_owned());
        Ok(())
    }

    async fn save_remote_peer(&self, peer: RemotePeer) -> EntglResult<()> {
        let key = peer.node_id.clone();
        let content = serde_json::to_value(&peer)?;
        self.save_document(SYSTEM_PEERS_COLLECTION, &key, content)
            .await?;
        Ok(())
    }

    async fn remove_remote_peer(&self, node_id: &str) -> EntglResult<()> {
        self.delete_document(SYSTEM_PEERS_COLLECTION, node_id)
            .await?;
        Ok(())
    }

    async fn get_remote_peers(&self) -> EntglResult<Vec<RemotePeer>> {
        let state = self.state.lock().await;
        let mut peers = Vec::new();
        for doc in state.documents.values() {
            if doc.collection == SYSTEM_PEERS_COLLECTION && !doc.is_deleted {
                peers.push(serde_json::from_value(doc.content.clone())?);
            }
        }
        Ok(peers)
    }

    async fn get_remote_peer(&self, node_id: &str) -> EntglResult<Option<RemotePeer>> {
        let state = self.state.lock().await;
        match state
            .documents
            .get(&(SYSTEM_PEERS_COLLECTION.to_owned(), node_id.to_owned()))
        {
            Some(doc) if !doc.is_deleted => Ok(Some(serde_json::from_value(doc.content.clone())?)),
            _ => Ok(None),
        }
    }

    async fn save_snapshot_metadata(&self, metadata: SnapshotMetadata) -> EntglResult<()> {
        let mut state = self.state.lock().await;
        state.snapshots.insert(metadata.node_id.clone(), metadata);
        self.persist(&state)?;
        Ok(())
    }

    async fn prune_oplog(&self) -> EntglResult<usize> {
        let mut state = self.state.lock().await;
        if state.snapshots.is_empty() {
            return Ok(0);
        }

        let snapshots = state.snapshots.clone();
        let before = state.oplog.len();
        state.oplog.retain(|entry| {
            snapshots
                .get(entry.node_id())
                .map(|meta| entry.timestamp > meta.timestamp)
                .unwrap_or(true)
        });
        let removed = before - state.oplog.len();

        // A tombstone is dropped once every checkpoint has passed it.
        if let Some(floor) = snapshots.values().map(|meta| meta.timestamp.clone()).min() {
            state
                .documents
                .retain(|_, doc| !doc.is_deleted || doc.updated_at > floor);
        }

        self.persist(&state)?;
        Ok(removed)
    }

    fn subscribe_changes(&self, listener: ChangesListener) -> ChangesSubscription {
        self.changes.subscribe(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn save_then_get_round_trip() {
        let store = MemoryPeerStore::new("node-a");
        store
            .save_document("users", "u1", json!({"name": "Alice", "age": 30}))
            .await
            .unwrap();

        let doc = store.get_document("users", "u1").await.unwrap().unwrap();
        assert_eq!(doc.content, json!({"name": "Alice", "age": 30}));
        assert!(!doc.is_deleted);
    }

    #[tokio::test]
    async fn every_document_write_appends_a_matching_entry() {
        let store = MemoryPeerStore::new("node-a");
        let doc = store
            .save_document("users", "u1", json!({"v": 1}))
            .await
            .unwrap();

        let entries = store.get_oplog_after(None, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].collection, "users");
        assert_eq!(entries[0].key, "u1");
        assert_eq!(entries[0].timestamp, doc.updated_at);
    }

    #[tokio::test]
    async fn delete_leaves_a_tombstone() {
        let store = MemoryPeerStore::new("node-a");
        store
            .save_document("users", "u1", json!({"v": 1}))
            .await
            .unwrap();
        store.delete_document("users", "u1").await.unwrap();

        assert!(store.get_document("users", "u1").await.unwrap().is_none());
        let record = store
            .get_document_record("users", "u1")
            .await
            .unwrap()
            .unwrap();
        assert!(record.is_deleted);
    }

    #[tokio::test]
    async fn local_chain_links_across_writes() {
        let store = MemoryPeerStore::new("node-a");
        for i in 0..5 {
            store
                .save_document("users", &format!("u{i}"), json!({"i": i}))
                .await
                .unwrap();
        }
        let entries = store.get_oplog_after(None, 100).await.unwrap();
        crate::model::verify_chain(&entries).expect("chain intact");
    }

    #[tokio::test]
    async fn apply_batch_is_idempotent() {
        let source = MemoryPeerStore::new("node-a");
        source
            .save_document("users", "u1", json!({"v": 1}))
            .await
            .unwrap();
        source
            .save_document("users", "u2", json!({"v": 2}))
            .await
            .unwrap();
        let entries = source.get_oplog_after(None, 100).await.unwrap();

        let target = MemoryPeerStore::new("node-b");
        let applied = target
            .apply_batch(Vec::new(), entries.clone())
            .await
            .unwrap();
        assert_eq!(applied.len(), 2);

        // Re-delivering any prefix leaves the store unchanged.
        let replay = target
            .apply_batch(Vec::new(), entries[..1].to_vec())
            .await
            .unwrap();
        assert!(replay.is_empty());
        assert_eq!(target.get_oplog_after(None, 100).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn apply_batch_skips_stale_documents_but_keeps_entries() {
        let local = MemoryPeerStore::new("node-b");
        local
            .save_document("users", "u1", json!({"v": "local"}))
            .await
            .unwrap();
        let local_ts = local.get_latest_timestamp().await.unwrap();

        // A remote entry older than the local document.
        let stale_entry = OplogEntry::chained(
            GENESIS_HASH,
            "users",
            "u1",
            OpKind::Put,
            Some(json!({"v": "remote"})),
            HlcTimestamp::new(local_ts.physical - 10_000, 0, "node-a"),
        );
        let applied = local
            .apply_batch(Vec::new(), vec![stale_entry.clone()])
            .await
            .unwrap();

        // The entry lands in the oplog for chain continuity.
        assert_eq!(applied.len(), 1);
        assert_eq!(local.get_oplog_after(None, 100).await.unwrap().len(), 2);
        // The stale payload does not clobber the newer document.
        let doc = local.get_document("users", "u1").await.unwrap().unwrap();
        assert_eq!(doc.content, json!({"v": "local"}));
    }

    #[tokio::test]
    async fn apply_batch_rejects_tampered_entries_atomically() {
        let source = MemoryPeerStore::new("node-a");
        source
            .save_document("users", "u1", json!({"v": 1}))
            .await
            .unwrap();
        source
            .save_document("users", "u2", json!({"v": 2}))
            .await
            .unwrap();
        let mut entries = source.get_oplog_after(None, 100).await.unwrap();
        entries[1].payload = Some(json!({"v": "tampered"}));

        let target = MemoryPeerStore::new("node-b");
        let err = target.apply_batch(Vec::new(), entries).await.unwrap_err();
        assert_eq!(err.code_str(), "SYNC_ERROR");

        // Nothing from the rejected batch is observable.
        assert!(target.get_oplog_after(None, 100).await.unwrap().is_empty());
        assert!(target.get_document("users", "u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_edit_never_resurrects_tombstone() {
        let local = MemoryPeerStore::new("node-b");
        let delete_ts = HlcTimestamp::new(200, 0, "node-a");
        let delete = OplogEntry::chained(
            GENESIS_HASH,
            "users",
            "k",
            OpKind::Delete,
            None,
            delete_ts,
        );
        local.apply_batch(Vec::new(), vec![delete.clone()]).await.unwrap();

        let stale_edit = OplogEntry::chained(
            GENESIS_HASH,
            "users",
            "k",
            OpKind::Put,
            Some(json!({"v": "late"})),
            HlcTimestamp::new(150, 0, "node-c"),
        );
        local
            .apply_batch(Vec::new(), vec![stale_edit])
            .await
            .unwrap();

        assert!(local.get_document("users", "k").await.unwrap().is_none());
        let record = local
            .get_document_record("users", "k")
            .await
            .unwrap()
            .unwrap();
        assert!(record.is_deleted);
        assert_eq!(record.updated_at, HlcTimestamp::new(200, 0, "node-a"));
    }

    #[tokio::test]
    async fn oplog_cursor_is_strictly_greater() {
        let store = MemoryPeerStore::new("node-a");
        store.save_document("c", "k1", json!(1)).await.unwrap();
        let mid = store.get_latest_timestamp().await.unwrap();
        store.save_document("c", "k2", json!(2)).await.unwrap();

        let after = store.get_oplog_after(Some(&mid), 100).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].key, "k2");
    }

    #[tokio::test]
    async fn vector_clock_tracks_local_and_remote_heads() {
        let store = MemoryPeerStore::new("node-b");
        store.save_document("c", "k", json!(1)).await.unwrap();

        let remote = OplogEntry::chained(
            GENESIS_HASH,
            "c",
            "r",
            OpKind::Put,
            Some(json!(2)),
            HlcTimestamp::new(123, 0, "node-a"),
        );
        store.apply_batch(Vec::new(), vec![remote]).await.unwrap();

        let clock = store.get_vector_clock().await.unwrap();
        assert_eq!(clock.get("node-a").unwrap().physical, 123);
        assert_eq!(
            clock.get("node-b"),
            Some(&store.get_latest_timestamp().await.unwrap())
        );
    }

    #[tokio::test]
    async fn changes_fire_for_local_and_replicated_writes() {
        let store = MemoryPeerStore::new("node-b");
        let seen: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let captured = Arc::clone(&seen);
        let _subscription = store.subscribe_changes(Arc::new(move |entries| {
            let mut guard = captured.lock().unwrap();
            for entry in entries {
                guard.push(entry.key.clone());
            }
        }));

        store.save_document("c", "local", json!(1)).await.unwrap();
        let remote = OplogEntry::chained(
            GENESIS_HASH,
            "c",
            "remote",
            OpKind::Put,
            Some(json!(2)),
            HlcTimestamp::new(50, 0, "node-a"),
        );
        store.apply_batch(Vec::new(), vec![remote]).await.unwrap();

        let keys = seen.lock().unwrap().clone();
        assert_eq!(keys, vec!["local".to_string(), "remote".to_string()]);
    }

    #[tokio::test]
    async fn remote_peers_live_in_the_reserved_collection() {
        let store = MemoryPeerStore::new("node-a");
        store
            .save_remote_peer(RemotePeer::new("node-b", "10.0.0.2:4100", crate::model::PeerKind::StaticRemote))
            .await
            .unwrap();

        let peers = store.get_remote_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].node_id, "node-b");

        // Peer mutations ride the normal oplog.
        let entries = store.get_oplog_after(None, 10).await.unwrap();
        assert_eq!(entries[0].collection, SYSTEM_PEERS_COLLECTION);

        store.remove_remote_peer("node-b").await.unwrap();
        assert!(store.get_remote_peer("node-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pruning_respects_checkpoints() {
        let store = MemoryPeerStore::new("node-a");
        store.save_document("c", "k1", json!(1)).await.unwrap();
        store.delete_document("c", "k1").await.unwrap();
        let checkpoint = store.get_latest_timestamp().await.unwrap();
        store.save_document("c", "k2", json!(2)).await.unwrap();

        let entries = store.get_oplog_after(None, 100).await.unwrap();
        let checkpoint_hash = entries
            .iter()
            .find(|entry| entry.timestamp == checkpoint)
            .unwrap()
            .hash;
        store
            .save_snapshot_metadata(SnapshotMetadata::new(
                "node-a",
                checkpoint.clone(),
                checkpoint_hash,
            ))
            .await
            .unwrap();

        let removed = store.prune_oplog().await.unwrap();
        assert_eq!(removed, 2);
        let remaining = store.get_oplog_after(None, 100).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, "k2");

        // The pruned tombstone is gone; the live document stays.
        assert!(store
            .get_document_record("c", "k1")
            .await
            .unwrap()
            .is_none());
        assert!(store.get_document("c", "k2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn query_and_count_skip_tombstones() {
        let store = MemoryPeerStore::new("node-a");
        store
            .save_document("users", "u1", json!({"age": 30}))
            .await
            .unwrap();
        store
            .save_document("users", "u2", json!({"age": 17}))
            .await
            .unwrap();
        store
            .save_document("users", "u3", json!({"age": 45}))
            .await
            .unwrap();
        store.delete_document("users", "u3").await.unwrap();

        let adults = store
            .query_documents("users", &Filter::ge("age", 18))
            .await
            .unwrap();
        assert_eq!(adults.len(), 1);
        assert_eq!(adults[0].key, "u1");

        assert_eq!(store.count_documents("users", None).await.unwrap(), 2);
    }
}
