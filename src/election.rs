use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::discovery::Discovery;

pub const DEFAULT_ELECTION_INTERVAL: Duration = Duration::from_secs(5);

/// Current cloud-gateway verdict. Only the gateway opens outbound sync
/// connections to cloud peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayStatus {
    pub gateway_id: String,
    pub is_local: bool,
}

/// Deterministic bully variant: the byte-wise smallest node id among the local
/// node and the active LAN peers is the gateway. Ties are impossible because
/// node ids are unique.
pub fn elect_gateway<'a>(
    local_node_id: &'a str,
    peer_ids: impl IntoIterator<Item = &'a str>,
) -> &'a str {
    peer_ids
        .into_iter()
        .chain(std::iter::once(local_node_id))
        .min_by(|left, right| left.as_bytes().cmp(right.as_bytes()))
        .expect("candidate set always contains the local node")
}

/// Periodic election loop publishing `LeadershipChanged` events on a watch
/// channel the sync engine subscribes to.
pub struct Election {
    receiver: watch::Receiver<GatewayStatus>,
    task: JoinHandle<()>,
}

impl Election {
    pub fn spawn(
        local_node_id: impl Into<String>,
        discovery: Arc<dyn Discovery>,
        interval: Duration,
    ) -> Self {
        let local_node_id = local_node_id.into();
        let initial = GatewayStatus {
            gateway_id: local_node_id.clone(),
            is_local: true,
        };
        let (tx, rx) = watch::channel(initial);

        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                let peers = discovery.active_peers();
                let peer_ids: Vec<&str> = peers.iter().map(|peer| peer.node_id.as_str()).collect();
                let gateway_id = elect_gateway(&local_node_id, peer_ids).to_owned();
                let status = GatewayStatus {
                    is_local: gateway_id == local_node_id,
                    gateway_id,
                };
                let changed = *tx.borrow() != status;
                if changed {
                    log::info!(
                        "cloud gateway is now {} (local: {})",
                        status.gateway_id,
                        status.is_local
                    );
                    if tx.send(status).is_err() {
                        break;
                    }
                }
            }
        });

        Self { receiver: rx, task }
    }

    /// Subscribes to leadership changes; the receiver always holds the latest
    /// verdict.
    pub fn subscribe(&self) -> watch::Receiver<GatewayStatus> {
        self.receiver.clone()
    }

    pub fn current(&self) -> GatewayStatus {
        self.receiver.borrow().clone()
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for Election {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{DiscoveredPeer, StaticDiscovery};
    use crate::error::EntglResult;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[test]
    fn smallest_node_id_wins() {
        assert_eq!(elect_gateway("node-b", ["node-c", "node-a"]), "node-a");
        assert_eq!(elect_gateway("node-a", ["node-b", "node-c"]), "node-a");
        assert_eq!(elect_gateway("node-a", std::iter::empty()), "node-a");
    }

    #[test]
    fn comparison_is_byte_wise() {
        // 'Z' (0x5A) sorts before 'a' (0x61) under ordinal comparison.
        assert_eq!(elect_gateway("alpha", ["Zulu"]), "Zulu");
    }

    struct ScriptedDiscovery {
        peers: Mutex<Vec<DiscoveredPeer>>,
    }

    #[async_trait]
    impl Discovery for ScriptedDiscovery {
        async fn start(&self) -> EntglResult<()> {
            Ok(())
        }

        async fn stop(&self) {}

        fn active_peers(&self) -> Vec<DiscoveredPeer> {
            self.peers.lock().unwrap().clone()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn leadership_changes_fire_watch_events() {
        let discovery = Arc::new(ScriptedDiscovery {
            peers: Mutex::new(Vec::new()),
        });
        let election = Election::spawn(
            "node-b",
            Arc::clone(&discovery) as Arc<dyn Discovery>,
            Duration::from_millis(10),
        );
        let mut events = election.subscribe();

        // Alone, the local node is the gateway.
        assert!(election.current().is_local);

        // A smaller node id appears and takes over.
        discovery.peers.lock().unwrap().push(DiscoveredPeer {
            node_id: "node-a".to_owned(),
            address: "127.0.0.1:4100".parse().unwrap(),
        });
        tokio::time::timeout(Duration::from_secs(2), events.changed())
            .await
            .expect("leadership change within the deadline")
            .unwrap();
        let status = events.borrow().clone();
        assert_eq!(status.gateway_id, "node-a");
        assert!(!status.is_local);

        // The peer times out and leadership returns.
        discovery.peers.lock().unwrap().clear();
        tokio::time::timeout(Duration::from_secs(2), events.changed())
            .await
            .expect("leadership regained within the deadline")
            .unwrap();
        assert!(events.borrow().is_local);

        election.shutdown();
    }

    #[tokio::test]
    async fn noop_discovery_keeps_local_leadership() {
        let election = Election::spawn(
            "only-node",
            Arc::new(StaticDiscovery) as Arc<dyn Discovery>,
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(election.current().is_local);
    }
}
