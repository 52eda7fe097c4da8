use std::net::SocketAddrV4;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kadnode::config::default_workers;
use kadnode::routing::K;
use kadnode::{KademliaNode, NodeConfig, NodeId};

#[derive(Parser, Debug)]
#[command(name = "kadnode", version, about = "Kademlia DHT node")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    bind: SocketAddrV4,

    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<SocketAddrV4>,

    /// Run without the interactive prompt
    #[arg(long)]
    headless: bool,

    /// Seed for a deterministic node id; random when absent
    #[arg(long)]
    seed: Option<String>,

    #[arg(long, default_value_t = K)]
    bucket_size: usize,

    #[arg(long, default_value_t = default_workers())]
    workers: usize,

    #[arg(long, default_value = "1000", value_name = "MILLIS")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> kadnode::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let self_id = match &args.seed {
        Some(seed) => NodeId::from_seed(seed.as_bytes()),
        None => NodeId::random_id(),
    };
    let config = NodeConfig {
        bind_addr: args.bind,
        bucket_size: args.bucket_size,
        workers: args.workers,
        request_timeout: Duration::from_millis(args.timeout),
        ..NodeConfig::default()
    };

    let node = KademliaNode::bind(config, self_id).await?;
    info!("Starting node with ID: {} at {}", self_id, node.local_addr());

    if !args.bootstrap.is_empty() {
        let answered = node.bootstrap(&args.bootstrap).await;
        info!(answered, total = args.bootstrap.len(), "bootstrap finished");
    }

    if args.headless {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for shutdown signal");
        }
        info!("Received shutdown signal, exiting");
    } else {
        run_prompt(&node).await?;
    }

    node.shutdown();
    Ok(())
}

async fn run_prompt(node: &KademliaNode) -> kadnode::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            // ping <addr>
            (Some("ping"), Some(addr), None) => match addr.parse() {
                Ok(addr) => match node.ping(addr).await {
                    Ok(id) => println!("pong from {}", id),
                    Err(e) => println!("ping failed: {}", e),
                },
                Err(e) => println!("bad address: {}", e),
            },
            // find-node <addr> <key>
            (Some("find-node"), Some(addr), Some(key)) => match addr.parse() {
                Ok(addr) => match node.find_node(addr, &NodeId::from_seed(key.as_bytes())).await {
                    Ok(nodes) => {
                        for remote in nodes {
                            println!("{} {}", remote.id, remote.address);
                        }
                    }
                    Err(e) => println!("find-node failed: {}", e),
                },
                Err(e) => println!("bad address: {}", e),
            },
            // find-value <addr> <key>
            (Some("find-value"), Some(addr), Some(key)) => match addr.parse() {
                Ok(addr) => match node.find_value(addr, &NodeId::from_seed(key.as_bytes())).await {
                    Ok(found) => match found.value {
                        Some(value) => println!("Value: {}", String::from_utf8_lossy(&value)),
                        None => {
                            for remote in found.nodes {
                                println!("{} {}", remote.id, remote.address);
                            }
                        }
                    },
                    Err(e) => println!("find-value failed: {}", e),
                },
                Err(e) => println!("bad address: {}", e),
            },
            // put <key> <value>
            (Some("put"), Some(key), Some(value)) => {
                match node.store_local(NodeId::from_seed(key.as_bytes()), value.as_bytes().to_vec()) {
                    Ok(()) => println!("stored"),
                    Err(e) => println!("put failed: {}", e),
                }
            }
            (Some("peers"), None, None) => {
                let peers = node.routing_table().peers();
                for peer in &peers {
                    println!("{} {} seen {:?} ago", peer.id, peer.address, peer.last_seen.elapsed());
                }
                println!("{} peers known", peers.len());
            }
            (Some("exit"), None, None) => break,
            (None, _, _) => {}
            _ => println!("commands: ping | find-node | find-value | put | peers | exit"),
        }
    }
    Ok(())
}
