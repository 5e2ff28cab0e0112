use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::HlcTimestamp;

/// A versioned JSON document, unique per `(collection, key)`.
///
/// Deletion never removes the row: it stores a tombstone (`content: Null`,
/// `is_deleted: true`) that survives until snapshot pruning so late-arriving
/// stale edits cannot resurrect the key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub collection: String,
    pub key: String,
    pub content: Value,
    pub updated_at: HlcTimestamp,
    pub is_deleted: bool,
}

impl Document {
    pub fn new(
        collection: impl Into<String>,
        key: impl Into<String>,
        content: Value,
        updated_at: HlcTimestamp,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            content,
            updated_at,
            is_deleted: false,
        }
    }

    pub fn tombstone(
        collection: impl Into<String>,
        key: impl Into<String>,
        updated_at: HlcTimestamp,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            content: Value::Null,
            updated_at,
            is_deleted: true,
        }
    }

    /// Cache key for this document.
    pub fn cache_key(&self) -> String {
        cache_key(&self.collection, &self.key)
    }
}

pub(crate) fn cache_key(collection: &str, key: &str) -> String {
    format!("{collection}:{key}")
}
