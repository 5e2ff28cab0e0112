use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::clock::HlcTimestamp;
use crate::error::{network_error, sync_error, timeout_error, EntglResult};
use crate::model::{Document, OplogEntry};
use crate::protocol::frame::PeerChannel;
use crate::protocol::message::{
    decode_body, encode_body, DocumentRequest, DocumentResponse, Goodbye, Heartbeat, Hlc,
    OplogEntryMsg, OplogRequest, OplogResponse, OplogTail,
};
use crate::protocol::{Handshake, HandshakeConfig, MessageType};
use crate::telemetry::{MetricKind, TelemetrySink};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// An established, handshaked exchange with one peer. The caller drives a
/// strict request/response discipline; `push_tail` is the one fire-and-forget
/// message.
pub struct PeerSession<S> {
    channel: PeerChannel<S>,
    peer_node_id: String,
    telemetry: TelemetrySink,
}

impl PeerSession<TcpStream> {
    /// Dials and handshakes a peer, bounding connection establishment by
    /// `connect_timeout`.
    pub async fn connect(
        address: &str,
        handshake_config: HandshakeConfig,
        telemetry: TelemetrySink,
        connect_timeout: Duration,
    ) -> EntglResult<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| timeout_error(format!("connecting to {address} timed out")))?
            .map_err(|err| network_error(format!("connecting to {address}: {err}")))?;
        stream
            .set_nodelay(true)
            .map_err(|err| network_error(format!("configuring socket: {err}")))?;

        let channel = PeerChannel::new(stream, telemetry.clone());
        let mut handshake = Handshake::new(handshake_config);
        let info = tokio::time::timeout(connect_timeout, handshake.run_initiator(&channel))
            .await
            .map_err(|_| timeout_error(format!("handshake with {address} timed out")))??;

        Ok(Self {
            channel,
            peer_node_id: info.peer_node_id,
            telemetry,
        })
    }
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    /// Wraps an already-handshaked channel; used by in-process transports.
    pub fn from_channel(
        channel: PeerChannel<S>,
        peer_node_id: impl Into<String>,
        telemetry: TelemetrySink,
    ) -> Self {
        Self {
            channel,
            peer_node_id: peer_node_id.into(),
            telemetry,
        }
    }

    pub fn peer_node_id(&self) -> &str {
        &self.peer_node_id
    }

    async fn round_trip(
        &self,
        request_type: MessageType,
        request: &[u8],
        expected: MessageType,
    ) -> EntglResult<Vec<u8>> {
        let started = Instant::now();
        self.channel.send(request_type, request).await?;
        let (message_type, payload) = self.channel.recv().await?;
        self.telemetry
            .record_duration(MetricKind::RoundTripTime, started.elapsed());
        if message_type != expected {
            return Err(sync_error(format!(
                "peer {} answered {request_type:?} with {message_type:?}",
                self.peer_node_id
            )));
        }
        Ok(payload)
    }

    /// Pulls the oplog page after `since`.
    pub async fn request_oplog(
        &self,
        since: Option<&HlcTimestamp>,
        limit: usize,
    ) -> EntglResult<(Vec<OplogEntryMsg>, bool)> {
        let request = OplogRequest {
            since: since.map(Hlc::from),
            limit: limit as u32,
        };
        let payload = self
            .round_trip(
                MessageType::OplogRequest,
                &encode_body(&request),
                MessageType::OplogResponse,
            )
            .await?;
        let response: OplogResponse = decode_body(&payload)?;
        Ok((response.entries, response.has_more))
    }

    /// Fetches the peer's current record for a key referenced by an entry.
    pub async fn request_document(
        &self,
        collection: &str,
        key: &str,
        timestamp: &HlcTimestamp,
    ) -> EntglResult<Option<Document>> {
        let request = DocumentRequest {
            collection: collection.to_owned(),
            key: key.to_owned(),
            timestamp: Some(Hlc::from(timestamp)),
        };
        let payload = self
            .round_trip(
                MessageType::DocumentRequest,
                &encode_body(&request),
                MessageType::DocumentResponse,
            )
            .await?;
        let response: DocumentResponse = decode_body(&payload)?;
        response.document.map(Document::try_from).transpose()
    }

    /// Fire-and-forget notification of freshly applied local entries.
    pub async fn push_tail(&self, entries: &[OplogEntry]) -> EntglResult<()> {
        let tail = OplogTail {
            entries: entries.iter().map(OplogEntryMsg::from).collect(),
        };
        self.channel
            .send(MessageType::OplogTail, &encode_body(&tail))
            .await
    }

    pub async fn heartbeat(&self) -> EntglResult<()> {
        let ping = Heartbeat {
            sent_at_millis: chrono::Utc::now().timestamp_millis(),
        };
        self.round_trip(
            MessageType::Heartbeat,
            &encode_body(&ping),
            MessageType::Heartbeat,
        )
        .await?;
        Ok(())
    }

    /// Best-effort session teardown notice.
    pub async fn goodbye(&self, reason: &str) {
        let goodbye = Goodbye {
            reason: reason.to_owned(),
        };
        let _ = self
            .channel
            .send(MessageType::Goodbye, &encode_body(&goodbye))
            .await;
    }
}
