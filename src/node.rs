use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::api::Database;
use crate::cache::DocumentCache;
use crate::discovery::{
    Discovery, StaticDiscovery, UdpBeaconDiscovery, UdpDiscoveryConfig, DEFAULT_DISCOVERY_PORT,
};
use crate::election::{Election, GatewayStatus, DEFAULT_ELECTION_INTERVAL};
use crate::error::{config_error, EntglResult};
use crate::model::{PeerKind, RemotePeer};
use crate::protocol::{hash_auth_token, HandshakeConfig};
use crate::resolver::{ResolverKind, ResolverSlot};
use crate::store::{FilePersistence, MemoryPeerStore, PeerStore};
use crate::sync::{SyncConfig, SyncContext, SyncEngine, SyncServer};
use crate::telemetry::{Telemetry, TelemetryOptions};

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub discovery_port: u16,
    pub beacon_interval_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            beacon_interval_secs: 5,
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Store state file; `None` keeps everything in memory.
    pub data_path: Option<PathBuf>,
    pub telemetry_path: Option<PathBuf>,
    pub cache_budget_mb: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_path: None,
            telemetry_path: None,
            cache_budget_mb: 64,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub interval_secs: u64,
    pub batch_size: usize,
    pub offline_queue_capacity: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            batch_size: crate::store::DEFAULT_BATCH_SIZE,
            offline_queue_capacity: 1_024,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

/// Node configuration tree. Environment variables `ENTGLDB_NODE_NAME`,
/// `ENTGLDB_PORT`, and `ENTGLDB_AUTH_TOKEN` override the corresponding fields.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    pub tcp_port: u16,
    pub auth_token: String,
    pub cluster_tag: String,
    pub secure: bool,
    /// Server-mode deployments skip LAN discovery and use static peers only.
    pub server_mode: bool,
    pub resolver: String,
    pub network: NetworkConfig,
    pub persistence: PersistenceConfig,
    pub sync: SyncSettings,
    pub logging: LoggingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            tcp_port: 0,
            auth_token: String::new(),
            cluster_tag: "entgldb".to_owned(),
            secure: false,
            server_mode: false,
            resolver: "lww".to_owned(),
            network: NetworkConfig::default(),
            persistence: PersistenceConfig::default(),
            sync: SyncSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Applies environment overrides on top of the current values.
    pub fn apply_env(mut self) -> Self {
        if let Ok(name) = std::env::var("ENTGLDB_NODE_NAME") {
            self.node_id = name;
        }
        if let Ok(port) = std::env::var("ENTGLDB_PORT") {
            if let Ok(port) = port.parse() {
                self.tcp_port = port;
            }
        }
        if let Ok(token) = std::env::var("ENTGLDB_AUTH_TOKEN") {
            self.auth_token = token;
        }
        self
    }

    pub fn resolver_kind(&self) -> EntglResult<ResolverKind> {
        self.resolver.parse()
    }

    pub fn validate(&self) -> EntglResult<()> {
        if self.node_id.is_empty() {
            return Err(config_error("node_id must not be empty"));
        }
        if self.auth_token.is_empty() {
            return Err(config_error("auth_token must not be empty"));
        }
        self.resolver_kind()?;
        Ok(())
    }
}

/// A running EntglDb node: store, cache, telemetry, protocol server,
/// discovery, election, and the sync engine, built in dependency order and
/// shut down in reverse.
pub struct Node {
    config: NodeConfig,
    database: Database,
    resolver: Arc<ResolverSlot>,
    store: Arc<dyn PeerStore>,
    telemetry: Telemetry,
    server: SyncServer,
    discovery: Arc<dyn Discovery>,
    election: Election,
    engine: Arc<SyncEngine>,
    reconcile: JoinHandle<()>,
}

impl Node {
    pub async fn start(config: NodeConfig) -> EntglResult<Self> {
        config.validate()?;
        let resolver_kind = config.resolver_kind()?;

        let store: Arc<dyn PeerStore> = match &config.persistence.data_path {
            Some(path) => Arc::new(MemoryPeerStore::with_persistence(
                config.node_id.clone(),
                Arc::new(FilePersistence::new(path.clone())),
            )?),
            None => Arc::new(MemoryPeerStore::new(config.node_id.clone())),
        };
        let cache = Arc::new(DocumentCache::with_budget_mb(
            config.persistence.cache_budget_mb,
        ));
        let telemetry = Telemetry::spawn(TelemetryOptions {
            snapshot_path: config.persistence.telemetry_path.clone(),
            persist_interval: None,
        });

        let resolver = Arc::new(ResolverSlot::new(resolver_kind));
        let handshake = HandshakeConfig {
            node_id: config.node_id.clone(),
            auth_token_hash: hash_auth_token(&config.auth_token),
            secure: config.secure,
        };
        let ctx = SyncContext {
            store: Arc::clone(&store),
            resolver: Arc::clone(&resolver) as Arc<dyn crate::resolver::ConflictResolver>,
            cache: Arc::clone(&cache),
            telemetry: telemetry.sink(),
            handshake,
        };

        let server = SyncServer::bind(&format!("0.0.0.0:{}", config.tcp_port), ctx.clone()).await?;

        let discovery: Arc<dyn Discovery> = if config.server_mode {
            Arc::new(StaticDiscovery)
        } else {
            let mut discovery_config = UdpDiscoveryConfig::new(
                config.node_id.clone(),
                server.local_addr().port(),
                hash_auth_token(&config.auth_token),
                config.cluster_tag.clone(),
            );
            discovery_config.discovery_port = config.network.discovery_port;
            discovery_config.beacon_interval =
                Duration::from_secs(config.network.beacon_interval_secs.max(1));
            Arc::new(UdpBeaconDiscovery::new(discovery_config))
        };
        discovery.start().await?;

        let election = Election::spawn(
            config.node_id.clone(),
            Arc::clone(&discovery),
            DEFAULT_ELECTION_INTERVAL,
        );

        let sync_config = SyncConfig {
            sync_interval: Duration::from_secs(config.sync.interval_secs.max(1)),
            batch_size: config.sync.batch_size,
            connect_timeout: Duration::from_secs(config.network.connect_timeout_secs.max(1)),
            offline_queue_capacity: config.sync.offline_queue_capacity,
            ..SyncConfig::default()
        };
        let engine = Arc::new(SyncEngine::new(
            ctx,
            sync_config,
            Some(election.subscribe()),
        ));

        for peer in store.get_remote_peers().await? {
            engine.add_peer(peer);
        }

        let reconcile = tokio::spawn(reconcile_loop(
            Arc::clone(&store),
            Arc::clone(&discovery),
            Arc::clone(&engine),
        ));

        let database = Database::new(Arc::clone(&store), cache);
        log::info!(
            "node {} listening on {} (secure: {}, resolver: {})",
            config.node_id,
            server.local_addr(),
            config.secure,
            resolver_kind.as_str()
        );

        Ok(Self {
            config,
            database,
            resolver,
            store,
            telemetry,
            server,
            discovery,
            election,
            engine,
            reconcile,
        })
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn gateway(&self) -> GatewayStatus {
        self.election.current()
    }

    pub fn resolver_kind(&self) -> ResolverKind {
        self.resolver.kind()
    }

    pub fn set_resolver(&self, kind: ResolverKind) {
        self.resolver.switch(kind);
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn sync_peers(&self) -> Vec<String> {
        self.engine.peer_ids()
    }

    pub fn lan_peers(&self) -> Vec<crate::discovery::DiscoveredPeer> {
        self.discovery.active_peers()
    }

    /// Persists the peer and registers it with the engine.
    pub async fn add_remote_peer(&self, peer: RemotePeer) -> EntglResult<()> {
        self.store.save_remote_peer(peer.clone()).await?;
        self.engine.add_peer(peer);
        Ok(())
    }

    pub async fn remove_remote_peer(&self, node_id: &str) -> EntglResult<()> {
        self.store.remove_remote_peer(node_id).await?;
        self.engine.remove_peer(node_id);
        Ok(())
    }

    /// Ordered teardown: stop pulling, stop serving, stop announcing, then
    /// drop the aggregators.
    pub async fn shutdown(self) {
        self.reconcile.abort();
        self.engine.shutdown();
        self.server.shutdown();
        self.discovery.stop().await;
        self.election.shutdown();
        self.telemetry.shutdown();
    }
}

/// Keeps the engine's peer set aligned with LAN discovery and replicated peer
/// configuration.
async fn reconcile_loop(
    store: Arc<dyn PeerStore>,
    discovery: Arc<dyn Discovery>,
    engine: Arc<SyncEngine>,
) {
    let mut lan_tracked: HashSet<String> = HashSet::new();
    let mut tick = tokio::time::interval(Duration::from_secs(2));
    loop {
        tick.tick().await;

        let active = discovery.active_peers();
        let active_ids: HashSet<String> =
            active.iter().map(|peer| peer.node_id.clone()).collect();

        for peer in &active {
            if lan_tracked.insert(peer.node_id.clone()) {
                engine.add_peer(RemotePeer::new(
                    peer.node_id.clone(),
                    peer.address.to_string(),
                    PeerKind::LanDiscovered,
                ));
            }
        }
        for vanished in lan_tracked.clone().difference(&active_ids) {
            lan_tracked.remove(vanished);
            engine.remove_peer(vanished);
        }

        // Replicated peer configuration may have changed through sync.
        match store.get_remote_peers().await {
            Ok(peers) => {
                for peer in peers {
                    if peer.is_enabled {
                        engine.add_peer(peer);
                    } else {
                        engine.remove_peer(&peer.node_id);
                    }
                }
            }
            Err(err) => log::warn!("reading remote peers failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config(node_id: &str) -> NodeConfig {
        NodeConfig {
            node_id: node_id.to_owned(),
            auth_token: "cluster-token".to_owned(),
            server_mode: true,
            ..NodeConfig::default()
        }
    }

    #[test]
    fn validation_rejects_missing_identity() {
        let err = NodeConfig::default().validate().unwrap_err();
        assert_eq!(err.code_str(), "CONFIG_ERROR");

        let mut config = NodeConfig::default();
        config.node_id = "node-a".to_owned();
        assert!(config.validate().is_err());

        config.auth_token = "token".to_owned();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_unknown_resolver() {
        let mut config = test_config("node-a");
        config.resolver = "paxos".to_owned();
        assert_eq!(config.validate().unwrap_err().code_str(), "CONFIG_ERROR");
    }

    #[test]
    fn config_tree_deserializes() {
        let config: NodeConfig = serde_json::from_value(json!({
            "node_id": "node-a",
            "tcp_port": 4100,
            "auth_token": "token",
            "resolver": "merge",
            "network": {"discovery_port": 6001},
            "persistence": {"cache_budget_mb": 8},
            "sync": {"interval_secs": 1},
            "logging": {"level": "debug"},
        }))
        .unwrap();
        assert_eq!(config.network.discovery_port, 6001);
        assert_eq!(config.persistence.cache_budget_mb, 8);
        assert_eq!(config.resolver_kind().unwrap(), ResolverKind::Merge);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn node_starts_and_serves_its_database() {
        let node = Node::start(test_config("solo")).await.unwrap();
        assert!(node.local_addr().port() > 0);
        assert!(node.gateway().is_local);

        let users = node.database().collection("users");
        users.put("u1", json!({"name": "Alice"})).await.unwrap();
        assert_eq!(
            users.get("u1").await.unwrap().unwrap(),
            json!({"name": "Alice"})
        );

        node.shutdown().await;
    }
}
