pub mod frame;
pub mod handshake;
pub mod message;
pub mod secure;

pub use frame::{PeerChannel, COMPRESSION_THRESHOLD, MAX_FRAME_LEN};
pub use handshake::{CloseReason, Handshake, HandshakeConfig, HandshakeState, SessionInfo};
pub use secure::{hash_auth_token, CipherState, EphemeralKey, SessionCrypto, SessionRole};

/// Protocol revision carried in `Hello`; peers on different revisions refuse
/// to pair.
pub const PROTOCOL_VERSION: u8 = 1;

/// Outer frame message discriminants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Unknown = 0,
    Hello = 1,
    HelloAck = 2,
    KeyExchange = 3,
    KeyExchangeAck = 4,
    OplogRequest = 5,
    OplogResponse = 6,
    DocumentRequest = 7,
    DocumentResponse = 8,
    OplogTail = 9,
    Heartbeat = 10,
    Goodbye = 11,
    SecureEnv = 255,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => MessageType::Hello,
            2 => MessageType::HelloAck,
            3 => MessageType::KeyExchange,
            4 => MessageType::KeyExchangeAck,
            5 => MessageType::OplogRequest,
            6 => MessageType::OplogResponse,
            7 => MessageType::DocumentRequest,
            8 => MessageType::DocumentResponse,
            9 => MessageType::OplogTail,
            10 => MessageType::Heartbeat,
            11 => MessageType::Goodbye,
            255 => MessageType::SecureEnv,
            _ => MessageType::Unknown,
        }
    }
}
