use std::path::PathBuf;

use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

use entgldb::clock::HlcTimestamp;
use entgldb::model::{OpKind, OplogEntry, PeerKind, RemotePeer, GENESIS_HASH};
use entgldb::node::{Node, NodeConfig};
use entgldb::resolver::ResolverKind;
use entgldb::store::PeerStore as _;
use entgldb::telemetry::MetricKind;

/// EntglDb reference node with an interactive prompt.
#[derive(Parser, Debug)]
#[command(name = "entgldb-node", version, about)]
struct Args {
    /// Node identifier; byte-wise order decides the cloud gateway.
    node_id: String,

    /// TCP port for peer sync sessions (0 picks an ephemeral port).
    tcp_port: u16,

    /// Encrypt peer sessions (ECDH + AES-256-GCM).
    #[arg(long)]
    secure: bool,

    /// Start with the recursive structural merge resolver instead of LWW.
    #[arg(long)]
    merge: bool,

    /// Shared cluster token; defaults to ENTGLDB_AUTH_TOKEN or a dev token.
    #[arg(long)]
    auth_token: Option<String>,

    /// Persist store state to this file.
    #[arg(long)]
    data: Option<PathBuf>,

    /// Static peers as node_id@host:port, repeatable.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Skip LAN discovery; only static peers take part.
    #[arg(long)]
    server_mode: bool,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = NodeConfig {
        node_id: args.node_id.clone(),
        tcp_port: args.tcp_port,
        auth_token: args
            .auth_token
            .clone()
            .unwrap_or_else(|| "entgldb-dev-token".to_owned()),
        secure: args.secure,
        server_mode: args.server_mode,
        resolver: if args.merge { "merge" } else { "lww" }.to_owned(),
        persistence: entgldb::node::PersistenceConfig {
            data_path: args.data.clone(),
            ..Default::default()
        },
        ..NodeConfig::default()
    }
    .apply_env();

    let node = match Node::start(config).await {
        Ok(node) => node,
        Err(err) => {
            eprintln!("startup failed: {err}");
            std::process::exit(1);
        }
    };
    println!(
        "entgldb node `{}` on {} — type `h` for health, `q` to quit",
        node.node_id(),
        node.local_addr()
    );

    for spec in &args.peers {
        match parse_peer(spec) {
            Some(peer) => {
                if let Err(err) = node.add_remote_peer(peer).await {
                    eprintln!("adding peer {spec} failed: {err}");
                }
            }
            None => eprintln!("ignoring malformed --peer {spec} (want node_id@host:port)"),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut parts = line.trim().split_whitespace();
        let command = match parts.next() {
            Some(command) => command,
            None => continue,
        };
        match command {
            "l" => list_peers(&node),
            "p" => {
                let (key, value) = (parts.next(), parts.collect::<Vec<_>>().join(" "));
                match key {
                    Some(key) if !value.is_empty() => put(&node, key, &value).await,
                    _ => println!("usage: p <key> <value>"),
                }
            }
            "g" => match parts.next() {
                Some(key) => get(&node, key).await,
                None => println!("usage: g <key>"),
            },
            "d" => match parts.next() {
                Some(key) => delete(&node, key).await,
                None => println!("usage: d <key>"),
            },
            "demo" => conflict_demo(&node).await,
            "todos" => todos(&node).await,
            "resolver" => match parts.next() {
                None => println!("resolver: {}", node.resolver_kind().as_str()),
                Some(kind) => match kind.parse::<ResolverKind>() {
                    Ok(kind) => {
                        node.set_resolver(kind);
                        println!("resolver switched to {}", kind.as_str());
                    }
                    Err(err) => println!("{err}"),
                },
            },
            "h" => health(&node),
            "q" | "quit" | "exit" => break,
            other => println!("unknown command `{other}` (l, p, g, d, demo, todos, resolver, h, q)"),
        }
    }

    node.shutdown().await;
}

fn parse_peer(spec: &str) -> Option<RemotePeer> {
    let (node_id, address) = spec.split_once('@')?;
    if node_id.is_empty() || address.is_empty() {
        return None;
    }
    Some(RemotePeer::new(node_id, address, PeerKind::StaticRemote))
}

fn list_peers(node: &Node) {
    let lan = node.lan_peers();
    if lan.is_empty() {
        println!("no active LAN peers");
    }
    for peer in lan {
        println!("lan   {} @ {}", peer.node_id, peer.address);
    }
    for peer_id in node.sync_peers() {
        println!("sync  {peer_id}");
    }
    let gateway = node.gateway();
    println!(
        "gateway: {}{}",
        gateway.gateway_id,
        if gateway.is_local { " (this node)" } else { "" }
    );
}

async fn put(node: &Node, key: &str, raw: &str) {
    let value: Value = serde_json::from_str(raw).unwrap_or(Value::String(raw.to_owned()));
    match node.database().collection("kv").put(key, value).await {
        Ok(doc) => println!("ok @ {}", doc.updated_at),
        Err(err) => println!("put failed: {err}"),
    }
}

async fn get(node: &Node, key: &str) {
    match node.database().collection("kv").get(key).await {
        Ok(Some(value)) => println!("{value}"),
        Ok(None) => println!("(not found)"),
        Err(err) => println!("get failed: {err}"),
    }
}

async fn delete(node: &Node, key: &str) {
    match node.database().collection("kv").delete(key).await {
        Ok(()) => println!("deleted"),
        Err(err) => println!("delete failed: {err}"),
    }
}

/// Seeds a todo list, then applies a conflicting edit fabricated from a ghost
/// peer so the active resolver's behavior is visible immediately.
async fn conflict_demo(node: &Node) {
    let todos = node.database().collection("todo");
    let local = json!({"todos": [
        {"id": "1", "title": "buy milk", "done": true},
        {"id": "2", "title": "write code", "done": false},
    ]});
    if let Err(err) = todos.put("list", local).await {
        println!("demo setup failed: {err}");
        return;
    }

    let remote_ts = HlcTimestamp::new(
        chrono::Utc::now().timestamp_millis() + 10,
        0,
        "demo-remote",
    );
    let remote_payload = json!({"todos": [
        {"id": "1", "title": "buy milk", "done": false},
        {"id": "2", "title": "write code", "done": false},
        {"id": "3", "title": "ship release", "done": false},
    ]});
    let entry = OplogEntry::chained(
        GENESIS_HASH,
        "todo",
        "list",
        OpKind::Put,
        Some(remote_payload),
        remote_ts,
    );

    if let Err(err) = node
        .database()
        .store()
        .apply_batch(Vec::new(), vec![entry])
        .await
    {
        println!("demo conflict failed: {err}");
        return;
    }

    println!(
        "conflicting edit applied under `{}`:",
        node.resolver_kind().as_str()
    );
    todos_print(node).await;
}

async fn todos(node: &Node) {
    todos_print(node).await;
}

async fn todos_print(node: &Node) {
    match node.database().collection("todo").get("list").await {
        Ok(Some(value)) => {
            for item in value["todos"].as_array().into_iter().flatten() {
                let done = if item["done"].as_bool().unwrap_or(false) {
                    "[x]"
                } else {
                    "[ ]"
                };
                println!("{done} {} {}", item["id"], item["title"]);
            }
        }
        Ok(None) => println!("(no todo list yet — run `demo`)"),
        Err(err) => println!("todos failed: {err}"),
    }
}

fn health(node: &Node) {
    let stats = node.database().cache_stats();
    println!(
        "cache: {}/{} entries, {:.1}% hit rate",
        stats.size,
        stats.capacity,
        stats.hit_rate() * 100.0
    );
    let snapshot = node.telemetry().snapshot();
    for kind in MetricKind::ALL {
        if let Some(average) = snapshot.average(kind, 60) {
            println!("{}: {average:.3} (60s avg)", kind.as_str());
        }
    }
    list_peers(node);
}
