use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::error::{network_error, sync_error, EntglResult};
use crate::model::OplogEntry;
use crate::protocol::frame::PeerChannel;
use crate::protocol::message::{
    decode_body, encode_body, DocumentMsg, DocumentRequest, DocumentResponse, OplogEntryMsg,
    OplogRequest, OplogResponse, OplogTail,
};
use crate::protocol::{Handshake, MessageType};
use crate::store::PeerStore as _;
use crate::sync::engine::apply_remote_entries;
use crate::sync::SyncContext;

/// Accepts inbound peer connections and serves the pull protocol:
/// `OplogRequest`, `DocumentRequest`, pushed `OplogTail`s, heartbeats, and
/// goodbyes.
pub struct SyncServer {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl SyncServer {
    pub async fn bind(bind_addr: &str, ctx: SyncContext) -> EntglResult<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|err| network_error(format!("binding {bind_addr}: {err}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| network_error(format!("resolving local address: {err}")))?;

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let _ = stream.set_nodelay(true);
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            let channel = PeerChannel::new(stream, ctx.telemetry.clone());
                            if let Err(err) = serve_channel(&ctx, &channel).await {
                                log::debug!("session from {remote} ended: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        log::warn!("accept failed: {err}");
                        break;
                    }
                }
            }
        });

        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Serves one connection until the peer says goodbye or the transport drops.
pub(crate) async fn serve_channel<S>(ctx: &SyncContext, channel: &PeerChannel<S>) -> EntglResult<()>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let mut handshake = Handshake::new(ctx.handshake.clone());
    let info = handshake.run_responder(channel).await?;
    log::debug!("serving sync session for {}", info.peer_node_id);

    loop {
        let (message_type, payload) = channel.recv().await?;
        match message_type {
            MessageType::OplogRequest => {
                let request: OplogRequest = decode_body(&payload)?;
                let since = request.since.map(crate::clock::HlcTimestamp::from);
                let limit = if request.limit == 0 {
                    crate::store::DEFAULT_BATCH_SIZE
                } else {
                    request.limit as usize
                };
                let entries = ctx.store.get_oplog_after(since.as_ref(), limit).await?;
                let response = OplogResponse {
                    has_more: entries.len() == limit,
                    entries: entries.iter().map(OplogEntryMsg::from).collect(),
                };
                channel
                    .send(MessageType::OplogResponse, &encode_body(&response))
                    .await?;
            }
            MessageType::DocumentRequest => {
                let request: DocumentRequest = decode_body(&payload)?;
                let record = ctx
                    .store
                    .get_document_record(&request.collection, &request.key)
                    .await?;
                let response = DocumentResponse {
                    document: record.as_ref().map(DocumentMsg::from),
                };
                channel
                    .send(MessageType::DocumentResponse, &encode_body(&response))
                    .await?;
            }
            MessageType::OplogTail => {
                let tail: OplogTail = decode_body(&payload)?;
                let mut entries = Vec::with_capacity(tail.entries.len());
                for message in tail.entries {
                    match OplogEntry::try_from(message) {
                        Ok(entry) => entries.push(entry),
                        Err(err) => log::warn!(
                            "skipping undecodable pushed entry from {}: {err}",
                            info.peer_node_id
                        ),
                    }
                }
                if let Err(err) = apply_remote_entries(ctx, entries, HashMap::new()).await {
                    log::warn!(
                        "pushed tail from {} was rejected: {err}",
                        info.peer_node_id
                    );
                }
            }
            MessageType::Heartbeat => {
                channel.send(MessageType::Heartbeat, &payload).await?;
            }
            MessageType::Goodbye => {
                log::debug!("peer {} said goodbye", info.peer_node_id);
                return Ok(());
            }
            other => {
                return Err(sync_error(format!(
                    "unexpected {other:?} on an established session"
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DocumentCache;
    use crate::protocol::{hash_auth_token, HandshakeConfig};
    use crate::resolver::ResolverKind;
    use crate::store::{MemoryPeerStore, PeerStore};
    use crate::sync::session::PeerSession;
    use crate::telemetry::TelemetrySink;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_ctx(node_id: &str) -> SyncContext {
        SyncContext {
            store: Arc::new(MemoryPeerStore::new(node_id)),
            resolver: ResolverKind::Lww.build(),
            cache: Arc::new(DocumentCache::new(64)),
            telemetry: TelemetrySink::disabled(),
            handshake: HandshakeConfig {
                node_id: node_id.to_owned(),
                auth_token_hash: hash_auth_token("token"),
                secure: false,
            },
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn serves_oplog_and_documents_over_tcp() {
        let server_ctx = test_ctx("server");
        server_ctx
            .store
            .save_document("kv", "k1", json!({"v": 1}))
            .await
            .unwrap();
        server_ctx
            .store
            .save_document("kv", "k2", json!({"v": 2}))
            .await
            .unwrap();
        let server = SyncServer::bind("127.0.0.1:0", server_ctx.clone())
            .await
            .unwrap();

        let client_ctx = test_ctx("client");
        let session = PeerSession::connect(
            &server.local_addr().to_string(),
            client_ctx.handshake.clone(),
            TelemetrySink::disabled(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(session.peer_node_id(), "server");

        let (entries, has_more) = session.request_oplog(None, 100).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!has_more);

        let entry = OplogEntry::try_from(entries[0].clone()).unwrap();
        let document = session
            .request_document(&entry.collection, &entry.key, &entry.timestamp)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(document.key, "k1");

        let missing = session
            .request_document("kv", "absent", &entry.timestamp)
            .await
            .unwrap();
        assert!(missing.is_none());

        session.heartbeat().await.unwrap();
        session.goodbye("test over").await;
        server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pushed_tails_are_applied() {
        let server_ctx = test_ctx("server");
        let server = SyncServer::bind("127.0.0.1:0", server_ctx.clone())
            .await
            .unwrap();

        let client_ctx = test_ctx("client");
        client_ctx
            .store
            .save_document("kv", "pushed", json!({"v": 9}))
            .await
            .unwrap();
        let entries = client_ctx.store.get_oplog_after(None, 10).await.unwrap();

        let session = PeerSession::connect(
            &server.local_addr().to_string(),
            client_ctx.handshake.clone(),
            TelemetrySink::disabled(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        session.push_tail(&entries).await.unwrap();
        // A heartbeat round-trip fences the tail: the server processed it
        // before replying.
        session.heartbeat().await.unwrap();

        let doc = server_ctx
            .store
            .get_document("kv", "pushed")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.content, json!({"v": 9}));
        server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn paging_reports_has_more() {
        let server_ctx = test_ctx("server");
        for i in 0..5 {
            server_ctx
                .store
                .save_document("kv", &format!("k{i}"), json!(i))
                .await
                .unwrap();
        }
        let server = SyncServer::bind("127.0.0.1:0", server_ctx.clone())
            .await
            .unwrap();

        let client_ctx = test_ctx("client");
        let session = PeerSession::connect(
            &server.local_addr().to_string(),
            client_ctx.handshake.clone(),
            TelemetrySink::disabled(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let (page, has_more) = session.request_oplog(None, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(has_more);

        let last = OplogEntry::try_from(page[1].clone()).unwrap();
        let (rest, _) = session
            .request_oplog(Some(&last.timestamp), 100)
            .await
            .unwrap();
        assert_eq!(rest.len(), 3);
        server.shutdown();
    }
}
