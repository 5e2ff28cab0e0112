use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved replicated collection holding remote peer configuration.
/// Mutations propagate through normal sync like any other collection.
pub const SYSTEM_PEERS_COLLECTION: &str = "_system_remote_peers";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerKind {
    LanDiscovered,
    StaticRemote,
    CloudRemote,
}

/// Durable configuration for a replication peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemotePeer {
    pub node_id: String,
    pub address: String,
    pub kind: PeerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth2: Option<Value>,
    pub is_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interests: Option<Value>,
}

impl RemotePeer {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>, kind: PeerKind) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            kind,
            oauth2: None,
            is_enabled: true,
            interests: None,
        }
    }

    /// Outbound connections to this peer are only opened by the elected
    /// cloud gateway.
    pub fn requires_gateway(&self) -> bool {
        self.kind == PeerKind::CloudRemote
    }
}
