mod udp;

pub use udp::{DiscoveryBeacon, UdpBeaconDiscovery, UdpDiscoveryConfig, DEFAULT_DISCOVERY_PORT};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::EntglResult;

/// LAN peers go inactive when no beacon arrives for this long.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub node_id: String,
    pub address: SocketAddr,
}

/// How a node learns about LAN peers. Server-mode deployments run the no-op
/// variant and rely on statically configured peers only.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn start(&self) -> EntglResult<()>;
    async fn stop(&self);

    /// Peers seen within the inactivity timeout.
    fn active_peers(&self) -> Vec<DiscoveredPeer>;
}

/// Active-peer bookkeeping shared by discovery implementations.
pub struct PeerTable {
    timeout: Duration,
    peers: Mutex<HashMap<String, (SocketAddr, Instant)>>,
}

impl PeerTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn observe(&self, node_id: impl Into<String>, address: SocketAddr) {
        self.peers
            .lock()
            .unwrap()
            .insert(node_id.into(), (address, Instant::now()));
    }

    pub fn active(&self) -> Vec<DiscoveredPeer> {
        let now = Instant::now();
        let mut peers = self.peers.lock().unwrap();
        peers.retain(|_, (_, seen)| now.duration_since(*seen) < self.timeout);
        let mut active: Vec<DiscoveredPeer> = peers
            .iter()
            .map(|(node_id, (address, _))| DiscoveredPeer {
                node_id: node_id.clone(),
                address: *address,
            })
            .collect();
        active.sort_by(|left, right| left.node_id.cmp(&right.node_id));
        active
    }

    #[cfg(test)]
    fn observe_at(&self, node_id: &str, address: SocketAddr, seen: Instant) {
        self.peers
            .lock()
            .unwrap()
            .insert(node_id.to_owned(), (address, seen));
    }
}

/// No-op discovery for server-mode deployments: nothing is broadcast and only
/// static peers take part in sync.
#[derive(Default)]
pub struct StaticDiscovery;

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn start(&self) -> EntglResult<()> {
        Ok(())
    }

    async fn stop(&self) {}

    fn active_peers(&self) -> Vec<DiscoveredPeer> {
        Vec::new()
    }
}
