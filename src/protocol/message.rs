//! Wire message bodies. Hand-maintained prost messages so both peers share the
//! schema; unknown fields are ignored on decode, keeping the protocol open to
//! additive evolution.

use prost::Message;

use crate::clock::HlcTimestamp;
use crate::error::{sync_error, EntglError, EntglResult};
use crate::model::{Document, OpKind, OplogEntry};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub auth_token_hash: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub protocol_version: u32,
    #[prost(bool, tag = "4")]
    pub supports_encryption: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HelloAck {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub auth_token_hash: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub protocol_version: u32,
    #[prost(bool, tag = "4")]
    pub supports_encryption: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyExchange {
    /// SEC1-encoded ephemeral P-256 public key.
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyExchangeAck {
    #[prost(bytes = "vec", tag = "1")]
    pub public_key: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hlc {
    #[prost(int64, tag = "1")]
    pub physical: i64,
    #[prost(int32, tag = "2")]
    pub logical: i32,
    #[prost(string, tag = "3")]
    pub node_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum OpCode {
    Unspecified = 0,
    Put = 1,
    Delete = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OplogEntryMsg {
    #[prost(string, tag = "1")]
    pub collection: String,
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(enumeration = "OpCode", tag = "3")]
    pub op: i32,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub payload: Option<Vec<u8>>,
    #[prost(message, optional, tag = "5")]
    pub timestamp: Option<Hlc>,
    #[prost(bytes = "vec", tag = "6")]
    pub prev_hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "7")]
    pub hash: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DocumentMsg {
    #[prost(string, tag = "1")]
    pub collection: String,
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(bytes = "vec", tag = "3")]
    pub content: Vec<u8>,
    #[prost(message, optional, tag = "4")]
    pub updated_at: Option<Hlc>,
    #[prost(bool, tag = "5")]
    pub is_deleted: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OplogRequest {
    #[prost(message, optional, tag = "1")]
    pub since: Option<Hlc>,
    #[prost(uint32, tag = "2")]
    pub limit: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OplogResponse {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<OplogEntryMsg>,
    #[prost(bool, tag = "2")]
    pub has_more: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DocumentRequest {
    #[prost(string, tag = "1")]
    pub collection: String,
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(message, optional, tag = "3")]
    pub timestamp: Option<Hlc>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DocumentResponse {
    #[prost(message, optional, tag = "1")]
    pub document: Option<DocumentMsg>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OplogTail {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<OplogEntryMsg>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Heartbeat {
    #[prost(int64, tag = "1")]
    pub sent_at_millis: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Goodbye {
    #[prost(string, tag = "1")]
    pub reason: String,
}

/// Encrypted wrapper hiding the inner type and compression flags from passive
/// observers. AES-GCM appends its tag to `ciphertext`; `auth_tag` stays on the
/// schema for profiles carrying a detached tag.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SecureEnvelope {
    #[prost(bytes = "vec", tag = "1")]
    pub ciphertext: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub nonce: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub auth_tag: Vec<u8>,
}

pub fn decode_body<M: Message + Default>(payload: &[u8]) -> EntglResult<M> {
    M::decode(payload).map_err(|err| sync_error(format!("malformed message body: {err}")))
}

pub fn encode_body<M: Message>(message: &M) -> Vec<u8> {
    message.encode_to_vec()
}

impl From<&HlcTimestamp> for Hlc {
    fn from(timestamp: &HlcTimestamp) -> Self {
        Hlc {
            physical: timestamp.physical,
            logical: timestamp.logical,
            node_id: timestamp.node_id.clone(),
        }
    }
}

impl From<Hlc> for HlcTimestamp {
    fn from(message: Hlc) -> Self {
        HlcTimestamp::new(message.physical, message.logical, message.node_id)
    }
}

fn hash_from_bytes(bytes: &[u8], field: &str) -> EntglResult<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| sync_error(format!("{field} must be 32 bytes, got {}", bytes.len())))
}

impl From<&OplogEntry> for OplogEntryMsg {
    fn from(entry: &OplogEntry) -> Self {
        OplogEntryMsg {
            collection: entry.collection.clone(),
            key: entry.key.clone(),
            op: match entry.op {
                OpKind::Put => OpCode::Put as i32,
                OpKind::Delete => OpCode::Delete as i32,
            },
            payload: entry
                .payload
                .as_ref()
                .map(|payload| serde_json::to_vec(payload).unwrap_or_default()),
            timestamp: Some(Hlc::from(&entry.timestamp)),
            prev_hash: entry.prev_hash.to_vec(),
            hash: entry.hash.to_vec(),
        }
    }
}

impl TryFrom<OplogEntryMsg> for OplogEntry {
    type Error = EntglError;

    fn try_from(message: OplogEntryMsg) -> EntglResult<Self> {
        let op = match OpCode::try_from(message.op) {
            Ok(OpCode::Put) => OpKind::Put,
            Ok(OpCode::Delete) => OpKind::Delete,
            _ => return Err(sync_error("oplog entry carries an unknown op code")),
        };
        let timestamp = message
            .timestamp
            .ok_or_else(|| sync_error("oplog entry is missing its timestamp"))?;
        let payload = match message.payload {
            Some(bytes) => Some(
                serde_json::from_slice(&bytes)
                    .map_err(|err| sync_error(format!("oplog payload is not JSON: {err}")))?,
            ),
            None => None,
        };
        Ok(OplogEntry {
            collection: message.collection,
            key: message.key,
            op,
            payload,
            timestamp: timestamp.into(),
            prev_hash: hash_from_bytes(&message.prev_hash, "prev_hash")?,
            hash: hash_from_bytes(&message.hash, "hash")?,
        })
    }
}

impl From<&Document> for DocumentMsg {
    fn from(document: &Document) -> Self {
        DocumentMsg {
            collection: document.collection.clone(),
            key: document.key.clone(),
            content: serde_json::to_vec(&document.content).unwrap_or_default(),
            updated_at: Some(Hlc::from(&document.updated_at)),
            is_deleted: document.is_deleted,
        }
    }
}

impl TryFrom<DocumentMsg> for Document {
    type Error = EntglError;

    fn try_from(message: DocumentMsg) -> EntglResult<Self> {
        let updated_at = message
            .updated_at
            .ok_or_else(|| sync_error("document is missing its timestamp"))?;
        let content = serde_json::from_slice(&message.content)
            .map_err(|err| sync_error(format!("document content is not JSON: {err}")))?;
        Ok(Document {
            collection: message.collection,
            key: message.key,
            content,
            updated_at: updated_at.into(),
            is_deleted: message.is_deleted,
        })
    }
}
