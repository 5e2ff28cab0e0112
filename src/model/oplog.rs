use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::clock::HlcTimestamp;
use crate::error::{corruption_error, EntglResult};

pub type Hash = [u8; 32];

/// Sentinel `prev_hash` of the first entry in a node's chain.
pub const GENESIS_HASH: Hash = [0u8; 32];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Put,
    Delete,
}

impl OpKind {
    fn chain_byte(self) -> u8 {
        match self {
            OpKind::Put => 0x01,
            OpKind::Delete => 0x02,
        }
    }
}

/// One append-only mutation record. Entries form a per-node hash chain;
/// cross-node ordering is the HLC total order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub collection: String,
    pub key: String,
    pub op: OpKind,
    pub payload: Option<Value>,
    pub timestamp: HlcTimestamp,
    pub prev_hash: Hash,
    pub hash: Hash,
}

impl OplogEntry {
    /// Builds the entry following `prev_hash` in its node's chain, computing
    /// `hash = SHA-256(prev_hash || collection || key || op || payload || timestamp)`.
    pub fn chained(
        prev_hash: Hash,
        collection: impl Into<String>,
        key: impl Into<String>,
        op: OpKind,
        payload: Option<Value>,
        timestamp: HlcTimestamp,
    ) -> Self {
        let collection = collection.into();
        let key = key.into();
        let hash = compute_hash(&prev_hash, &collection, &key, op, payload.as_ref(), &timestamp);
        Self {
            collection,
            key,
            op,
            payload,
            timestamp,
            prev_hash,
            hash,
        }
    }

    /// Recomputes this entry's hash from its fields.
    pub fn expected_hash(&self) -> Hash {
        compute_hash(
            &self.prev_hash,
            &self.collection,
            &self.key,
            self.op,
            self.payload.as_ref(),
            &self.timestamp,
        )
    }

    pub fn node_id(&self) -> &str {
        &self.timestamp.node_id
    }

    /// Sort key used everywhere entries are ordered.
    pub fn sort_key(&self) -> (&HlcTimestamp, &Hash) {
        (&self.timestamp, &self.hash)
    }
}

fn compute_hash(
    prev_hash: &Hash,
    collection: &str,
    key: &str,
    op: OpKind,
    payload: Option<&Value>,
    timestamp: &HlcTimestamp,
) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(collection.as_bytes());
    hasher.update(key.as_bytes());
    hasher.update([op.chain_byte()]);
    if let Some(payload) = payload {
        // serde_json object keys are sorted, so the byte rendering is stable.
        hasher.update(serde_json::to_vec(payload).unwrap_or_default());
    }
    hasher.update(timestamp.to_chain_bytes());
    hasher.finalize().into()
}

/// Verifies per-node chain linkage and hash integrity over entries in append
/// order. `entries` may interleave nodes; each node's sub-sequence must link.
pub fn verify_chain(entries: &[OplogEntry]) -> EntglResult<()> {
    verify_chain_from(entries, &HashMap::new())
}

/// Chain verification for logs whose prefix was pruned: `initial_heads` maps a
/// node id to the hash of its last pruned entry (the snapshot checkpoint).
pub fn verify_chain_from(
    entries: &[OplogEntry],
    initial_heads: &HashMap<String, Hash>,
) -> EntglResult<()> {
    let mut heads: HashMap<&str, Hash> = initial_heads
        .iter()
        .map(|(node, hash)| (node.as_str(), *hash))
        .collect();
    for (index, entry) in entries.iter().enumerate() {
        if entry.hash != entry.expected_hash() {
            return Err(corruption_error(format!(
                "oplog entry {index} for {}/{} fails hash verification (stored {})",
                entry.collection,
                entry.key,
                hex::encode(&entry.hash[..8])
            )));
        }
        let expected_prev = heads.get(entry.node_id()).copied().unwrap_or(GENESIS_HASH);
        if entry.prev_hash != expected_prev {
            return Err(corruption_error(format!(
                "oplog entry {index} breaks the chain for node {} (prev {}, expected {})",
                entry.node_id(),
                hex::encode(&entry.prev_hash[..8]),
                hex::encode(&expected_prev[..8])
            )));
        }
        heads.insert(entry.node_id(), entry.hash);
    }
    Ok(())
}
