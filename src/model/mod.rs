mod document;
mod oplog;
mod peer;
mod vector_clock;

pub use document::Document;
pub use oplog::{verify_chain, verify_chain_from, Hash, OpKind, OplogEntry, GENESIS_HASH};
pub use peer::{PeerKind, RemotePeer, SYSTEM_PEERS_COLLECTION};
pub use vector_clock::VectorClock;

use serde::{Deserialize, Serialize};

use crate::clock::HlcTimestamp;

/// Checkpoint up to which a node's oplog may be pruned. One row per node id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub node_id: String,
    pub timestamp: HlcTimestamp,
    pub hash: Hash,
}

impl SnapshotMetadata {
    pub fn new(node_id: impl Into<String>, timestamp: HlcTimestamp, hash: Hash) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp,
            hash,
        }
    }
}
