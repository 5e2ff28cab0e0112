use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::clock::HlcTimestamp;
use crate::election::GatewayStatus;
use crate::error::EntglResult;
use crate::model::{Document, OpKind, OplogEntry, RemotePeer};
use crate::protocol::message::OplogEntryMsg;
use crate::queue::OfflineQueue;
use crate::resolver::{ConflictResolver as _, Resolution};
use crate::retry::RetryPolicy;
use crate::store::{ChangesSubscription, PeerStore as _, DEFAULT_BATCH_SIZE};
use crate::sync::session::PeerSession;
use crate::sync::SyncContext;
use crate::util::backoff::ConnectionBackoff;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_OFFLINE_QUEUE_CAPACITY: usize = 1_024;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub sync_interval: Duration,
    pub batch_size: usize,
    pub connect_timeout: Duration,
    pub offline_queue_capacity: usize,
    /// Absorbs transient failures while dialing a peer; exhaustion falls
    /// through to the connection backoff.
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            connect_timeout: super::session::DEFAULT_CONNECT_TIMEOUT,
            offline_queue_capacity: DEFAULT_OFFLINE_QUEUE_CAPACITY,
            retry: RetryPolicy::default(),
        }
    }
}

struct PeerRuntime {
    peer: RemotePeer,
    notify: Notify,
    outbox: OfflineQueue<OplogEntry>,
    stopped: AtomicBool,
}

struct PeerHandle {
    runtime: Arc<PeerRuntime>,
    task: JoinHandle<()>,
}

/// Per-peer cooperative pull loops plus the push-notification path.
///
/// Each registered peer gets its own task: ensure a handshaked session, pull
/// oplog pages after the stored cursor, resolve conflicts, apply atomically,
/// then sleep until the interval elapses or local changes arrive.
pub struct SyncEngine {
    ctx: SyncContext,
    config: SyncConfig,
    peers: Arc<StdMutex<HashMap<String, PeerHandle>>>,
    gateway: Option<watch::Receiver<GatewayStatus>>,
    _changes: ChangesSubscription,
}

impl SyncEngine {
    pub fn new(
        ctx: SyncContext,
        config: SyncConfig,
        gateway: Option<watch::Receiver<GatewayStatus>>,
    ) -> Self {
        let peers: Arc<StdMutex<HashMap<String, PeerHandle>>> =
            Arc::new(StdMutex::new(HashMap::new()));

        // Local writes fan out to every peer outbox and wake the loops.
        let local_node = ctx.handshake.node_id.clone();
        let fanout_peers = Arc::clone(&peers);
        let changes = ctx.store.subscribe_changes(Arc::new(move |entries| {
            let local: Vec<&OplogEntry> = entries
                .iter()
                .filter(|entry| entry.node_id() == local_node)
                .collect();
            if local.is_empty() {
                return;
            }
            let peers = fanout_peers.lock().unwrap();
            for handle in peers.values() {
                for entry in &local {
                    if !handle.runtime.outbox.enqueue((*entry).clone()) {
                        log::warn!(
                            "offline queue for {} is full, dropping push notification",
                            handle.runtime.peer.node_id
                        );
                        break;
                    }
                }
                handle.runtime.notify.notify_one();
            }
        }));

        Self {
            ctx,
            config,
            peers,
            gateway,
            _changes: changes,
        }
    }

    /// Registers a peer and spawns its loop. Disabled peers are ignored.
    pub fn add_peer(&self, peer: RemotePeer) {
        if !peer.is_enabled {
            return;
        }
        let mut peers = self.peers.lock().unwrap();
        if peers.contains_key(&peer.node_id) {
            return;
        }

        let runtime = Arc::new(PeerRuntime {
            peer: peer.clone(),
            notify: Notify::new(),
            outbox: OfflineQueue::new(self.config.offline_queue_capacity),
            stopped: AtomicBool::new(false),
        });
        let task = tokio::spawn(peer_loop(
            self.ctx.clone(),
            self.config.clone(),
            Arc::clone(&runtime),
            self.gateway.clone(),
        ));
        peers.insert(peer.node_id, PeerHandle { runtime, task });
    }

    pub fn remove_peer(&self, node_id: &str) {
        if let Some(handle) = self.peers.lock().unwrap().remove(node_id) {
            handle.runtime.stopped.store(true, Ordering::SeqCst);
            handle.task.abort();
        }
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn shutdown(&self) {
        let mut peers = self.peers.lock().unwrap();
        for (_, handle) in peers.drain() {
            handle.runtime.stopped.store(true, Ordering::SeqCst);
            handle.task.abort();
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn peer_loop(
    ctx: SyncContext,
    config: SyncConfig,
    runtime: Arc<PeerRuntime>,
    mut gateway: Option<watch::Receiver<GatewayStatus>>,
) {
    let mut backoff = ConnectionBackoff::default();
    let peer_id = runtime.peer.node_id.clone();

    while !runtime.stopped.load(Ordering::SeqCst) {
        // Cloud peers are only dialed by the elected gateway.
        if runtime.peer.requires_gateway() {
            if let Some(gateway_rx) = gateway.as_mut() {
                if !gateway_rx.borrow().is_local {
                    if gateway_rx.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
            }
        }

        let connect = config.retry.execute("connect", || {
            PeerSession::connect(
                &runtime.peer.address,
                ctx.handshake.clone(),
                ctx.telemetry.clone(),
                config.connect_timeout,
            )
        });
        let session = match connect.await {
            Ok(session) => session,
            Err(err) => {
                log::debug!("connect to {peer_id} failed: {err}");
                if is_handshake_rejection(&err) {
                    backoff.penalize();
                }
                tokio::time::sleep(backoff.next_delay()).await;
                continue;
            }
        };
        backoff.reset();
        log::info!("session established with {}", session.peer_node_id());

        if let Err(err) = drive_session(&ctx, &config, &runtime, &session).await {
            log::warn!("session with {peer_id} failed: {err}");
            if is_handshake_rejection(&err) {
                backoff.penalize();
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }
}

/// Handshake-class rejections double the reconnect penalty.
fn is_handshake_rejection(err: &crate::error::EntglError) -> bool {
    use crate::error::ErrorCode;
    matches!(
        err.code,
        ErrorCode::AuthFailed
            | ErrorCode::CryptoError
            | ErrorCode::VersionMismatch
            | ErrorCode::SecurityModeMismatch
    )
}

async fn drive_session<S>(
    ctx: &SyncContext,
    config: &SyncConfig,
    runtime: &PeerRuntime,
    session: &PeerSession<S>,
) -> EntglResult<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send,
{
    // A reconnect flushes whatever queued up while the peer was away.
    flush_outbox(runtime, session).await?;

    loop {
        if runtime.stopped.load(Ordering::SeqCst) {
            session.goodbye("shutting down").await;
            return Ok(());
        }

        pull_from_peer(ctx, config, session).await?;

        tokio::select! {
            _ = runtime.notify.notified() => {
                flush_outbox(runtime, session).await?;
            }
            _ = tokio::time::sleep(config.sync_interval) => {}
        }
    }
}

async fn flush_outbox<S>(runtime: &PeerRuntime, session: &PeerSession<S>) -> EntglResult<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send,
{
    let pending = runtime.outbox.drain(usize::MAX);
    if pending.is_empty() {
        return Ok(());
    }
    if let Err(err) = session.push_tail(&pending).await {
        // At-least-once: what could not be sent goes back to the buffer.
        for entry in pending {
            if !runtime.outbox.enqueue(entry) {
                break;
            }
        }
        return Err(err);
    }
    Ok(())
}

/// One full pull cycle: pages of `OplogRequest` until the peer reports no
/// more, each page resolved and applied atomically.
async fn pull_from_peer<S>(
    ctx: &SyncContext,
    config: &SyncConfig,
    session: &PeerSession<S>,
) -> EntglResult<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send,
{
    let peer_id = session.peer_node_id().to_owned();
    loop {
        let cursor = ctx
            .store
            .get_vector_clock()
            .await?
            .get(&peer_id)
            .cloned();
        let (entry_msgs, has_more) = session
            .request_oplog(cursor.as_ref(), config.batch_size)
            .await?;
        if entry_msgs.is_empty() {
            return Ok(());
        }

        let mut watermark = cursor;
        let mut entries = Vec::with_capacity(entry_msgs.len());
        for message in entry_msgs {
            let timestamp = message
                .timestamp
                .clone()
                .map(HlcTimestamp::from);
            match OplogEntry::try_from(message) {
                Ok(entry) => {
                    advance_watermark(&mut watermark, &entry.timestamp);
                    entries.push(entry);
                }
                Err(err) => {
                    // A malformed entry is skipped, but its timestamp still
                    // moves the cursor so the stream does not stall.
                    log::warn!("skipping undecodable entry from {peer_id}: {err}");
                    if let Some(timestamp) = timestamp {
                        advance_watermark(&mut watermark, &timestamp);
                    }
                }
            }
        }

        // Fetch the referenced documents for puts; deletes need none.
        let mut incoming_docs: HashMap<(String, String), Document> = HashMap::new();
        for entry in &entries {
            if entry.op != OpKind::Put {
                continue;
            }
            let slot = (entry.collection.clone(), entry.key.clone());
            if incoming_docs.contains_key(&slot) {
                continue;
            }
            match session
                .request_document(&entry.collection, &entry.key, &entry.timestamp)
                .await?
            {
                Some(document) => {
                    incoming_docs.insert(slot, document);
                }
                None => {
                    // The peer already pruned or re-deleted the key; the
                    // entry payload is authoritative enough.
                }
            }
        }

        apply_remote_entries(ctx, entries, incoming_docs).await?;

        if let Some(watermark) = watermark {
            ctx.store.advance_cursor(&peer_id, &watermark).await?;
        }
        if !has_more {
            return Ok(());
        }
    }
}

fn advance_watermark(watermark: &mut Option<HlcTimestamp>, candidate: &HlcTimestamp) {
    let ahead = watermark
        .as_ref()
        .map(|current| candidate > current)
        .unwrap_or(true);
    if ahead {
        *watermark = Some(candidate.clone());
    }
}

fn document_from_entry(entry: &OplogEntry) -> Document {
    match entry.op {
        OpKind::Put => Document::new(
            &entry.collection,
            &entry.key,
            entry.payload.clone().unwrap_or(serde_json::Value::Null),
            entry.timestamp.clone(),
        ),
        OpKind::Delete => {
            Document::tombstone(&entry.collection, &entry.key, entry.timestamp.clone())
        }
    }
}

/// Shared application path for pulled pages and pushed tails: run the active
/// resolver against the stored record, apply the batch atomically, then
/// republish structural merges as local writes so peers converge on them.
pub(crate) async fn apply_remote_entries(
    ctx: &SyncContext,
    entries: Vec<OplogEntry>,
    mut incoming_docs: HashMap<(String, String), Document>,
) -> EntglResult<Vec<OplogEntry>> {
    let mut docs = Vec::with_capacity(entries.len());
    let mut merged_writes = Vec::new();

    for entry in &entries {
        let slot = (entry.collection.clone(), entry.key.clone());
        let incoming = incoming_docs
            .remove(&slot)
            .unwrap_or_else(|| document_from_entry(entry));

        match ctx
            .store
            .get_document_record(&entry.collection, &entry.key)
            .await?
        {
            Some(stored) => match ctx.resolver.resolve(&stored, &incoming) {
                Resolution::KeepStored => docs.push(stored),
                Resolution::AcceptIncoming => docs.push(incoming),
                Resolution::Merged(content) => {
                    merged_writes.push((entry.collection.clone(), entry.key.clone(), content));
                    docs.push(stored);
                }
            },
            None => docs.push(incoming),
        }
    }

    let applied = ctx.store.apply_batch(docs, entries).await?;
    for entry in &applied {
        ctx.cache.remove(&entry.collection, &entry.key);
    }

    for (collection, key, content) in merged_writes {
        ctx.store.save_document(&collection, &key, content).await?;
        ctx.cache.remove(&collection, &key);
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DocumentCache;
    use crate::protocol::{hash_auth_token, HandshakeConfig};
    use crate::resolver::ResolverKind;
    use crate::store::{MemoryPeerStore, PeerStore};
    use serde_json::json;

    fn test_ctx(node_id: &str, resolver: ResolverKind) -> SyncContext {
        SyncContext {
            store: Arc::new(MemoryPeerStore::new(node_id)),
            resolver: resolver.build(),
            cache: Arc::new(DocumentCache::new(64)),
            telemetry: crate::telemetry::TelemetrySink::disabled(),
            handshake: HandshakeConfig {
                node_id: node_id.to_owned(),
                auth_token_hash: hash_auth_token("token"),
                secure: false,
            },
        }
    }

    #[tokio::test]
    async fn remote_entries_apply_with_lww() {
        let ctx = test_ctx("node-b", ResolverKind::Lww);
        ctx.store
            .save_document("kv", "k", json!({"v": 1}))
            .await
            .unwrap();
        let local_ts = ctx.store.get_latest_timestamp().await.unwrap();

        let newer = OplogEntry::chained(
            crate::model::GENESIS_HASH,
            "kv",
            "k",
            OpKind::Put,
            Some(json!({"v": 2})),
            HlcTimestamp::new(local_ts.physical + 1_000, 0, "node-a"),
        );
        apply_remote_entries(&ctx, vec![newer], HashMap::new())
            .await
            .unwrap();

        let doc = ctx.store.get_document("kv", "k").await.unwrap().unwrap();
        assert_eq!(doc.content, json!({"v": 2}));
    }

    #[tokio::test]
    async fn structural_merges_republish_locally() {
        let ctx = test_ctx("node-b", ResolverKind::Merge);
        ctx.store
            .save_document("kv", "doc", json!({"a": 1}))
            .await
            .unwrap();
        let local_ts = ctx.store.get_latest_timestamp().await.unwrap();

        let incoming = OplogEntry::chained(
            crate::model::GENESIS_HASH,
            "kv",
            "doc",
            OpKind::Put,
            Some(json!({"b": 2})),
            HlcTimestamp::new(local_ts.physical + 1_000, 0, "node-a"),
        );
        apply_remote_entries(&ctx, vec![incoming], HashMap::new())
            .await
            .unwrap();

        // The merged content supersedes both sides and was written locally,
        // so the oplog carries a republished entry.
        let doc = ctx.store.get_document("kv", "doc").await.unwrap().unwrap();
        assert_eq!(doc.content, json!({"a": 1, "b": 2}));
        let entries = ctx.store.get_oplog_after(None, 100).await.unwrap();
        let republished = entries
            .iter()
            .filter(|entry| entry.node_id() == "node-b")
            .count();
        assert_eq!(republished, 2);
    }

    #[tokio::test]
    async fn stale_remote_edit_keeps_local_document() {
        let ctx = test_ctx("node-b", ResolverKind::Lww);
        ctx.store
            .save_document("kv", "k", json!({"v": "fresh"}))
            .await
            .unwrap();
        let local_ts = ctx.store.get_latest_timestamp().await.unwrap();

        let stale = OplogEntry::chained(
            crate::model::GENESIS_HASH,
            "kv",
            "k",
            OpKind::Put,
            Some(json!({"v": "stale"})),
            HlcTimestamp::new(local_ts.physical - 10_000, 0, "node-a"),
        );
        apply_remote_entries(&ctx, vec![stale], HashMap::new())
            .await
            .unwrap();

        let doc = ctx.store.get_document("kv", "k").await.unwrap().unwrap();
        assert_eq!(doc.content, json!({"v": "fresh"}));
    }

    #[tokio::test]
    async fn local_changes_fan_out_to_peer_outboxes() {
        let ctx = test_ctx("node-a", ResolverKind::Lww);
        let engine = SyncEngine::new(ctx.clone(), SyncConfig::default(), None);
        engine.add_peer(RemotePeer::new(
            "node-b",
            "127.0.0.1:1", // never reachable; the outbox still buffers
            crate::model::PeerKind::StaticRemote,
        ));

        ctx.store
            .save_document("kv", "k", json!({"v": 1}))
            .await
            .unwrap();

        let peers = engine.peers.lock().unwrap();
        let runtime = &peers.get("node-b").unwrap().runtime;
        assert_eq!(runtime.outbox.len(), 1);
    }

    #[tokio::test]
    async fn disabled_peers_are_not_registered() {
        let ctx = test_ctx("node-a", ResolverKind::Lww);
        let engine = SyncEngine::new(ctx, SyncConfig::default(), None);
        let mut peer = RemotePeer::new("node-b", "127.0.0.1:1", crate::model::PeerKind::StaticRemote);
        peer.is_enabled = false;
        engine.add_peer(peer);
        assert!(engine.peer_ids().is_empty());
    }
}
