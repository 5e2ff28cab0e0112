use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::HlcTimestamp;

/// Per-peer replication high-watermarks: the greatest timestamp observed from
/// each known node. Entries only ever move forward.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<String, HlcTimestamp>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_id: &str) -> Option<&HlcTimestamp> {
        self.entries.get(node_id)
    }

    /// Advances the entry for `timestamp.node_id`; stale timestamps are ignored.
    /// Returns true when the clock moved.
    pub fn advance(&mut self, timestamp: &HlcTimestamp) -> bool {
        match self.entries.get(&timestamp.node_id) {
            Some(current) if current >= timestamp => false,
            _ => {
                self.entries
                    .insert(timestamp.node_id.clone(), timestamp.clone());
                true
            }
        }
    }

    /// Advances an explicit entry, used for per-peer sync cursors where the
    /// watermark timestamp may have been authored by a third node.
    pub fn advance_entry(&mut self, node_id: &str, timestamp: &HlcTimestamp) -> bool {
        match self.entries.get(node_id) {
            Some(current) if current >= timestamp => false,
            _ => {
                self.entries
                    .insert(node_id.to_owned(), timestamp.clone());
                true
            }
        }
    }

    /// Folds every entry of `other` into this clock.
    pub fn merge(&mut self, other: &VectorClock) {
        for timestamp in other.entries.values() {
            self.advance(timestamp);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HlcTimestamp)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
