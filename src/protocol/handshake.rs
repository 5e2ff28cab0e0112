use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{
    auth_failed, security_mode_mismatch, sync_error, version_mismatch, EntglError, EntglResult,
};
use crate::protocol::frame::PeerChannel;
use crate::protocol::message::{
    decode_body, encode_body, Hello, HelloAck, KeyExchange, KeyExchangeAck,
};
use crate::protocol::secure::{auth_hashes_match, EphemeralKey, SessionRole};
use crate::protocol::{MessageType, PROTOCOL_VERSION};

/// Why a session left the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    AuthFailed,
    VersionMismatch,
    SecurityModeMismatch,
    CryptoError,
    ProtocolViolation,
}

/// Per-connection handshake progression:
/// `Fresh → Hello → KeyExchange → Established`, or `Closed` on any rejection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Fresh,
    Hello,
    KeyExchange,
    Established,
    Closed(CloseReason),
}

#[derive(Clone, Debug)]
pub struct HandshakeConfig {
    pub node_id: String,
    pub auth_token_hash: [u8; 32],
    pub secure: bool,
}

/// Outcome of a completed handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub peer_node_id: String,
    pub encrypted: bool,
}

/// Session handshake state machine. Every rejection is a typed close, never a
/// thrown surprise mid-protocol.
pub struct Handshake {
    config: HandshakeConfig,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            state: HandshakeState::Fresh,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    fn close(&mut self, reason: CloseReason, err: EntglError) -> EntglError {
        self.state = HandshakeState::Closed(reason);
        err
    }

    fn hello(&self) -> Hello {
        Hello {
            node_id: self.config.node_id.clone(),
            auth_token_hash: self.config.auth_token_hash.to_vec(),
            protocol_version: PROTOCOL_VERSION as u32,
            supports_encryption: self.config.secure,
        }
    }

    fn check_peer(
        &mut self,
        peer_node_id: &str,
        peer_hash: &[u8],
        peer_version: u32,
        peer_encrypts: bool,
    ) -> EntglResult<()> {
        if !auth_hashes_match(&self.config.auth_token_hash, peer_hash) {
            return Err(self.close(
                CloseReason::AuthFailed,
                auth_failed(format!(
                    "peer {peer_node_id} presented a mismatched auth token"
                )),
            ));
        }
        if peer_version != PROTOCOL_VERSION as u32 {
            return Err(self.close(
                CloseReason::VersionMismatch,
                version_mismatch(format!(
                    "peer {peer_node_id} speaks protocol {peer_version}, local is {PROTOCOL_VERSION}"
                )),
            ));
        }
        if peer_encrypts != self.config.secure {
            return Err(self.close(
                CloseReason::SecurityModeMismatch,
                security_mode_mismatch(format!(
                    "peer {peer_node_id} encryption={peer_encrypts}, local={}",
                    self.config.secure
                )),
            ));
        }
        Ok(())
    }

    async fn exchange_keys_as_initiator<S>(
        &mut self,
        channel: &PeerChannel<S>,
    ) -> EntglResult<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        self.state = HandshakeState::KeyExchange;
        let ephemeral = EphemeralKey::generate();
        let exchange = KeyExchange {
            public_key: ephemeral.public_bytes(),
        };
        channel
            .send(MessageType::KeyExchange, &encode_body(&exchange))
            .await?;

        let (message_type, payload) = channel.recv().await?;
        if message_type != MessageType::KeyExchangeAck {
            return Err(self.close(
                CloseReason::ProtocolViolation,
                sync_error(format!(
                    "expected KeyExchangeAck, received {message_type:?}"
                )),
            ));
        }
        let ack: KeyExchangeAck = decode_body(&payload)?;
        let session = ephemeral
            .derive_session(&ack.public_key, SessionRole::Initiator)
            .map_err(|err| self.close(CloseReason::CryptoError, err))?;
        channel.enable_encryption(session);
        Ok(())
    }

    async fn exchange_keys_as_responder<S>(
        &mut self,
        channel: &PeerChannel<S>,
    ) -> EntglResult<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        self.state = HandshakeState::KeyExchange;
        let (message_type, payload) = channel.recv().await?;
        if message_type != MessageType::KeyExchange {
            return Err(self.close(
                CloseReason::ProtocolViolation,
                sync_error(format!("expected KeyExchange, received {message_type:?}")),
            ));
        }
        let exchange: KeyExchange = decode_body(&payload)?;

        let ephemeral = EphemeralKey::generate();
        let ack = KeyExchangeAck {
            public_key: ephemeral.public_bytes(),
        };
        channel
            .send(MessageType::KeyExchangeAck, &encode_body(&ack))
            .await?;
        let session = ephemeral
            .derive_session(&exchange.public_key, SessionRole::Responder)
            .map_err(|err| self.close(CloseReason::CryptoError, err))?;
        channel.enable_encryption(session);
        Ok(())
    }

    /// Client side: sends `Hello`, validates the ack, then drives the key
    /// exchange when the session is secure.
    pub async fn run_initiator<S>(&mut self, channel: &PeerChannel<S>) -> EntglResult<SessionInfo>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        channel
            .send(MessageType::Hello, &encode_body(&self.hello()))
            .await?;
        self.state = HandshakeState::Hello;

        let (message_type, payload) = channel.recv().await?;
        if message_type != MessageType::HelloAck {
            return Err(self.close(
                CloseReason::ProtocolViolation,
                sync_error(format!("expected HelloAck, received {message_type:?}")),
            ));
        }
        let ack: HelloAck = decode_body(&payload)?;
        self.check_peer(
            &ack.node_id,
            &ack.auth_token_hash,
            ack.protocol_version,
            ack.supports_encryption,
        )?;

        if self.config.secure {
            self.exchange_keys_as_initiator(channel).await?;
        }

        self.state = HandshakeState::Established;
        Ok(SessionInfo {
            peer_node_id: ack.node_id,
            encrypted: self.config.secure,
        })
    }

    /// Server side: validates `Hello` before acknowledging. A rejected peer
    /// gets no frames beyond the hello exchange, the connection just closes.
    pub async fn run_responder<S>(&mut self, channel: &PeerChannel<S>) -> EntglResult<SessionInfo>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let (message_type, payload) = channel.recv().await?;
        if message_type != MessageType::Hello {
            return Err(self.close(
                CloseReason::ProtocolViolation,
                sync_error(format!("expected Hello, received {message_type:?}")),
            ));
        }
        self.state = HandshakeState::Hello;
        let hello: Hello = decode_body(&payload)?;
        self.check_peer(
            &hello.node_id,
            &hello.auth_token_hash,
            hello.protocol_version,
            hello.supports_encryption,
        )?;

        let ack = HelloAck {
            node_id: self.config.node_id.clone(),
            auth_token_hash: self.config.auth_token_hash.to_vec(),
            protocol_version: PROTOCOL_VERSION as u32,
            supports_encryption: self.config.secure,
        };
        channel
            .send(MessageType::HelloAck, &encode_body(&ack))
            .await?;

        if self.config.secure {
            self.exchange_keys_as_responder(channel).await?;
        }

        self.state = HandshakeState::Established;
        Ok(SessionInfo {
            peer_node_id: hello.node_id,
            encrypted: self.config.secure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::secure::hash_auth_token;
    use crate::telemetry::TelemetrySink;
    use std::sync::Arc;

    fn config(node_id: &str, token: &str, secure: bool) -> HandshakeConfig {
        HandshakeConfig {
            node_id: node_id.to_owned(),
            auth_token_hash: hash_auth_token(token),
            secure,
        }
    }

    fn channel_pair() -> (
        Arc<PeerChannel<tokio::io::DuplexStream>>,
        Arc<PeerChannel<tokio::io::DuplexStream>>,
    ) {
        let (left, right) = tokio::io::duplex(256 * 1024);
        (
            Arc::new(PeerChannel::new(left, TelemetrySink::disabled())),
            Arc::new(PeerChannel::new(right, TelemetrySink::disabled())),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn plaintext_handshake_establishes() {
        let (client_channel, server_channel) = channel_pair();
        let server = tokio::spawn(async move {
            let mut handshake = Handshake::new(config("server", "token", false));
            let info = handshake.run_responder(&server_channel).await.unwrap();
            assert_eq!(handshake.state(), HandshakeState::Established);
            info
        });

        let mut handshake = Handshake::new(config("client", "token", false));
        let info = handshake.run_initiator(&client_channel).await.unwrap();
        assert_eq!(info.peer_node_id, "server");
        assert!(!info.encrypted);
        assert!(!client_channel.is_encrypted());

        let server_info = server.await.unwrap();
        assert_eq!(server_info.peer_node_id, "client");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn secure_handshake_installs_session_keys() {
        let (client_channel, server_channel) = channel_pair();
        let server_side = Arc::clone(&server_channel);
        let server = tokio::spawn(async move {
            let mut handshake = Handshake::new(config("server", "token", true));
            handshake.run_responder(&server_side).await.unwrap()
        });

        let mut handshake = Handshake::new(config("client", "token", true));
        let info = handshake.run_initiator(&client_channel).await.unwrap();
        assert!(info.encrypted);
        server.await.unwrap();
        assert!(client_channel.is_encrypted());
        assert!(server_channel.is_encrypted());

        // Session traffic round-trips through the envelopes.
        client_channel
            .send(MessageType::Heartbeat, b"secured")
            .await
            .unwrap();
        let (message_type, payload) = server_channel.recv().await.unwrap();
        assert_eq!(message_type, MessageType::Heartbeat);
        assert_eq!(payload, b"secured");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mismatched_auth_closes_with_auth_failed() {
        let (client_channel, server_channel) = channel_pair();
        let server = tokio::spawn(async move {
            let mut handshake = Handshake::new(config("server", "right-token", false));
            let err = handshake.run_responder(&server_channel).await.unwrap_err();
            assert_eq!(
                handshake.state(),
                HandshakeState::Closed(CloseReason::AuthFailed)
            );
            err
        });

        let mut handshake = Handshake::new(config("client", "wrong", false));
        // The responder drops the connection without acknowledging.
        let client_result = handshake.run_initiator(&client_channel).await;
        let server_err = server.await.unwrap();
        assert_eq!(server_err.code_str(), "AUTH_FAILED");
        assert!(client_result.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mixed_security_modes_close_the_session() {
        let (client_channel, server_channel) = channel_pair();
        let server = tokio::spawn(async move {
            let mut handshake = Handshake::new(config("server", "token", false));
            handshake.run_responder(&server_channel).await.unwrap_err()
        });

        let mut handshake = Handshake::new(config("client", "token", true));
        let _ = handshake.run_initiator(&client_channel).await;
        let err = server.await.unwrap();
        assert_eq!(err.code_str(), "SECURITY_MODE_MISMATCH");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn responder_rejects_non_hello_openers() {
        let (client_channel, server_channel) = channel_pair();
        let server = tokio::spawn(async move {
            let mut handshake = Handshake::new(config("server", "token", false));
            handshake.run_responder(&server_channel).await.unwrap_err()
        });

        client_channel
            .send(MessageType::Heartbeat, b"")
            .await
            .unwrap();
        let err = server.await.unwrap();
        assert_eq!(err.code_str(), "SYNC_ERROR");
    }
}
