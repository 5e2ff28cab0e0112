mod memory;
mod persistence;

pub use memory::MemoryPeerStore;
pub use persistence::{FilePersistence, PersistedState, StorePersistence};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::Value;

use crate::clock::HlcTimestamp;
use crate::error::EntglResult;
use crate::model::{Document, OplogEntry, RemotePeer, SnapshotMetadata, VectorClock};
use crate::query::Filter;

/// Default page size for oplog pulls.
pub const DEFAULT_BATCH_SIZE: usize = 100;

pub type ChangesListener = Arc<dyn Fn(&[OplogEntry]) + Send + Sync>;

/// Durable local state surface. The store is the only authority mutating
/// persistent state; the sync engine calls it through the same interface an
/// application does.
#[async_trait]
pub trait PeerStore: Send + Sync {
    /// Ticks the HLC, upserts the document, and appends the matching oplog
    /// entry atomically.
    async fn save_document(
        &self,
        collection: &str,
        key: &str,
        content: Value,
    ) -> EntglResult<Document>;

    /// Writes a tombstone at the current HLC.
    async fn delete_document(&self, collection: &str, key: &str) -> EntglResult<Document>;

    /// Application view: tombstoned keys read as absent.
    async fn get_document(&self, collection: &str, key: &str) -> EntglResult<Option<Document>>;

    /// Replication view: tombstones are returned so resolvers can see them.
    async fn get_document_record(
        &self,
        collection: &str,
        key: &str,
    ) -> EntglResult<Option<Document>>;

    /// Applies a replicated batch atomically: either every document and entry
    /// lands or none do. A stored document newer than or equal to its incoming
    /// counterpart is kept, while the incoming oplog entry is still appended
    /// for hash continuity. Returns the entries effectively applied (already
    /// known entries are dropped, making re-delivery idempotent) and emits
    /// `ChangesApplied` for them.
    async fn apply_batch(
        &self,
        docs: Vec<Document>,
        entries: Vec<OplogEntry>,
    ) -> EntglResult<Vec<OplogEntry>>;

    /// Entries strictly after `cursor` in `(timestamp, hash)` order, up to `limit`.
    async fn get_oplog_after(
        &self,
        cursor: Option<&HlcTimestamp>,
        limit: usize,
    ) -> EntglResult<Vec<OplogEntry>>;

    async fn get_vector_clock(&self) -> EntglResult<VectorClock>;

    /// Moves the replication cursor kept for `peer_id` forward; stale
    /// timestamps are ignored so the cursor never rewinds.
    async fn advance_cursor(&self, peer_id: &str, timestamp: &HlcTimestamp) -> EntglResult<()>;

    async fn get_latest_timestamp(&self) -> EntglResult<HlcTimestamp>;

    /// Merges a remote timestamp into the local HLC through the store, so
    /// clock durability follows replication.
    async fn observe_remote(&self, remote: &HlcTimestamp) -> EntglResult<HlcTimestamp>;

    /// Filtered, non-deleted documents of a collection.
    async fn query_documents(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> EntglResult<Vec<Document>>;

    async fn count_documents(
        &self,
        collection: &str,
        filter: Option<&Filter>,
    ) -> EntglResult<usize>;

    async fn get_collections(&self) -> EntglResult<Vec<String>>;

    async fn ensure_index(&self, collection: &str, path: &str) -> EntglResult<()>;

    async fn save_remote_peer(&self, peer: RemotePeer) -> EntglResult<()>;
    async fn remove_remote_peer(&self, node_id: &str) -> EntglResult<()>;
    async fn get_remote_peers(&self) -> EntglResult<Vec<RemotePeer>>;
    async fn get_remote_peer(&self, node_id: &str) -> EntglResult<Option<RemotePeer>>;

    async fn save_snapshot_metadata(&self, metadata: SnapshotMetadata) -> EntglResult<()>;

    /// Drops oplog entries covered by snapshot checkpoints and tombstones every
    /// checkpoint has passed. Returns the number of entries removed.
    async fn prune_oplog(&self) -> EntglResult<usize>;

    /// Registers a `ChangesApplied` listener. The registration lives until the
    /// returned handle is detached or dropped.
    fn subscribe_changes(&self, listener: ChangesListener) -> ChangesSubscription;
}

/// Fan-out registry for `ChangesApplied` events.
#[derive(Default)]
pub(crate) struct ChangeBroadcast {
    listeners: Mutex<Vec<(u64, ChangesListener)>>,
    counter: AtomicU64,
}

impl ChangeBroadcast {
    pub fn subscribe(self: &Arc<Self>, listener: ChangesListener) -> ChangesSubscription {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().unwrap().push((id, listener));
        ChangesSubscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    pub fn emit(&self, entries: &[OplogEntry]) {
        if entries.is_empty() {
            return;
        }
        let listeners: Vec<ChangesListener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(entries);
        }
    }

    fn remove(&self, id: u64) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|(entry_id, _)| *entry_id != id);
    }
}

/// Handle to a registered `ChangesApplied` listener.
pub struct ChangesSubscription {
    id: u64,
    registry: Weak<ChangeBroadcast>,
}

impl ChangesSubscription {
    pub fn detach(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl Drop for ChangesSubscription {
    fn drop(&mut self) {
        self.detach();
    }
}
