use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::discovery::{DiscoveredPeer, Discovery, PeerTable, DEFAULT_PEER_TIMEOUT};
use crate::error::{network_error, EntglResult};
use crate::protocol::message::{decode_body, encode_body};
use crate::protocol::secure::auth_hashes_match;
use crate::protocol::PROTOCOL_VERSION;

pub const DEFAULT_DISCOVERY_PORT: u16 = 6000;
pub const DEFAULT_BEACON_INTERVAL: Duration = Duration::from_secs(5);

/// Periodic LAN presence announcement.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DiscoveryBeacon {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(uint32, tag = "2")]
    pub tcp_port: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub auth_token_hash: Vec<u8>,
    #[prost(string, tag = "4")]
    pub cluster_tag: String,
    #[prost(uint32, tag = "5")]
    pub protocol_version: u32,
}

#[derive(Clone, Debug)]
pub struct UdpDiscoveryConfig {
    pub node_id: String,
    /// TCP port peers should dial for sync sessions.
    pub tcp_port: u16,
    pub auth_token_hash: [u8; 32],
    pub cluster_tag: String,
    pub discovery_port: u16,
    pub beacon_interval: Duration,
    pub peer_timeout: Duration,
}

impl UdpDiscoveryConfig {
    pub fn new(
        node_id: impl Into<String>,
        tcp_port: u16,
        auth_token_hash: [u8; 32],
        cluster_tag: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            tcp_port,
            auth_token_hash,
            cluster_tag: cluster_tag.into(),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            beacon_interval: DEFAULT_BEACON_INTERVAL,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
        }
    }
}

/// UDP broadcast discovery: announces this node every few seconds and folds
/// incoming beacons into the active-peer table. Beacons from other clusters or
/// with a mismatched auth hash are discarded without a reply.
pub struct UdpBeaconDiscovery {
    config: UdpDiscoveryConfig,
    table: Arc<PeerTable>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpBeaconDiscovery {
    pub fn new(config: UdpDiscoveryConfig) -> Self {
        let table = Arc::new(PeerTable::new(config.peer_timeout));
        Self {
            config,
            table,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn beacon(&self) -> DiscoveryBeacon {
        DiscoveryBeacon {
            node_id: self.config.node_id.clone(),
            tcp_port: self.config.tcp_port as u32,
            auth_token_hash: self.config.auth_token_hash.to_vec(),
            cluster_tag: self.config.cluster_tag.clone(),
            protocol_version: PROTOCOL_VERSION as u32,
        }
    }

    /// Validates a received beacon and records the sender. Pure so the filter
    /// rules are testable without sockets.
    fn accept_beacon(
        config: &UdpDiscoveryConfig,
        table: &PeerTable,
        beacon: DiscoveryBeacon,
        sender: SocketAddr,
    ) -> bool {
        if beacon.node_id == config.node_id {
            return false;
        }
        if beacon.cluster_tag != config.cluster_tag {
            return false;
        }
        if !auth_hashes_match(&config.auth_token_hash, &beacon.auth_token_hash) {
            log::debug!("discarding beacon from {} with bad auth", beacon.node_id);
            return false;
        }
        if beacon.protocol_version != PROTOCOL_VERSION as u32 {
            return false;
        }
        let address = SocketAddr::new(sender.ip(), beacon.tcp_port as u16);
        table.observe(beacon.node_id, address);
        true
    }
}

#[async_trait]
impl Discovery for UdpBeaconDiscovery {
    async fn start(&self) -> EntglResult<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.config.discovery_port))
            .await
            .map_err(|err| {
                network_error(format!(
                    "binding discovery port {}: {err}",
                    self.config.discovery_port
                ))
            })?;
        socket
            .set_broadcast(true)
            .map_err(|err| network_error(format!("enabling broadcast: {err}")))?;
        let socket = Arc::new(socket);

        let beacon_bytes = encode_body(&self.beacon());
        let broadcast_to: SocketAddr =
            SocketAddr::from(([255, 255, 255, 255], self.config.discovery_port));
        let interval = self.config.beacon_interval;
        let sender_socket = Arc::clone(&socket);
        let sender = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                if let Err(err) = sender_socket.send_to(&beacon_bytes, broadcast_to).await {
                    log::debug!("beacon send failed: {err}");
                }
            }
        });

        let config = self.config.clone();
        let table = Arc::clone(&self.table);
        let receiver = tokio::spawn(async move {
            let mut buffer = vec![0u8; 2048];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, sender)) => {
                        match decode_body::<DiscoveryBeacon>(&buffer[..len]) {
                            Ok(beacon) => {
                                UdpBeaconDiscovery::accept_beacon(
                                    &config, &table, beacon, sender,
                                );
                            }
                            Err(err) => log::debug!("undecodable beacon: {err}"),
                        }
                    }
                    Err(err) => {
                        log::warn!("discovery receive failed: {err}");
                        break;
                    }
                }
            }
        });

        self.tasks.lock().unwrap().extend([sender, receiver]);
        Ok(())
    }

    async fn stop(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    fn active_peers(&self) -> Vec<DiscoveredPeer> {
        self.table.active()
    }
}

impl Drop for UdpBeaconDiscovery {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::secure::hash_auth_token;

    fn test_config(node_id: &str) -> UdpDiscoveryConfig {
        UdpDiscoveryConfig::new(node_id, 4100, hash_auth_token("token"), "cluster-1")
    }

    fn sender() -> SocketAddr {
        "192.168.1.20:53530".parse().unwrap()
    }

    fn beacon_from(node_id: &str, token: &str, tag: &str) -> DiscoveryBeacon {
        DiscoveryBeacon {
            node_id: node_id.to_owned(),
            tcp_port: 4200,
            auth_token_hash: hash_auth_token(token).to_vec(),
            cluster_tag: tag.to_owned(),
            protocol_version: PROTOCOL_VERSION as u32,
        }
    }

    #[test]
    fn valid_beacon_registers_the_tcp_endpoint() {
        let config = test_config("node-a");
        let table = PeerTable::new(DEFAULT_PEER_TIMEOUT);
        assert!(UdpBeaconDiscovery::accept_beacon(
            &config,
            &table,
            beacon_from("node-b", "token", "cluster-1"),
            sender(),
        ));

        let active = table.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].node_id, "node-b");
        assert_eq!(active[0].address, "192.168.1.20:4200".parse().unwrap());
    }

    #[test]
    fn own_beacon_is_ignored() {
        let config = test_config("node-a");
        let table = PeerTable::new(DEFAULT_PEER_TIMEOUT);
        assert!(!UdpBeaconDiscovery::accept_beacon(
            &config,
            &table,
            beacon_from("node-a", "token", "cluster-1"),
            sender(),
        ));
        assert!(table.active().is_empty());
    }

    #[test]
    fn mismatched_auth_hash_is_discarded() {
        let config = test_config("node-a");
        let table = PeerTable::new(DEFAULT_PEER_TIMEOUT);
        assert!(!UdpBeaconDiscovery::accept_beacon(
            &config,
            &table,
            beacon_from("node-b", "wrong", "cluster-1"),
            sender(),
        ));
        assert!(table.active().is_empty());
    }

    #[test]
    fn foreign_cluster_tag_is_discarded() {
        let config = test_config("node-a");
        let table = PeerTable::new(DEFAULT_PEER_TIMEOUT);
        assert!(!UdpBeaconDiscovery::accept_beacon(
            &config,
            &table,
            beacon_from("node-b", "token", "cluster-2"),
            sender(),
        ));
        assert!(table.active().is_empty());
    }

    #[test]
    fn beacon_encoding_round_trips() {
        let beacon = beacon_from("node-b", "token", "cluster-1");
        let bytes = encode_body(&beacon);
        let decoded: DiscoveryBeacon = decode_body(&bytes).unwrap();
        assert_eq!(decoded, beacon);
    }
}
