use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use plume_server::{Node, NodeOptions, PeerSpec};

/// Plume messaging node.
#[derive(Debug, Parser)]
#[command(name = "plume-node", about = "distributed messaging node")]
struct Args {
    /// Unique node id (1..1024).
    #[arg(long)]
    node_id: u64,

    /// Cluster (replica transport) listen address.
    #[arg(long, default_value = "127.0.0.1:9100")]
    listen_cluster: SocketAddr,

    /// HTTP API listen address.
    #[arg(long, default_value = "127.0.0.1:9200")]
    listen_api: SocketAddr,

    /// Comma-separated members: `id@host:port@http://host:apiport`.
    /// Must include this node. Empty means single-node.
    #[arg(long, default_value = "")]
    peers: String,

    #[arg(long, default_value = "./plume-data")]
    data_dir: PathBuf,

    /// Slot partitions; fixed at cluster init.
    #[arg(long, default_value_t = 128)]
    slot_count: u32,

    /// Replicas per partition, the leader included.
    #[arg(long, default_value_t = 3)]
    replica_count: usize,

    /// Shared secret for node-to-node handshakes.
    #[arg(long, default_value = "plume")]
    cluster_token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hyper=warn,reqwest=warn".into()),
        )
        .init();

    let args = Args::parse();
    let mut opts = NodeOptions::new(args.node_id, args.data_dir);
    opts.listen_cluster = args.listen_cluster;
    opts.listen_api = args.listen_api;
    opts.slot_count = args.slot_count;
    opts.replica_count = args.replica_count;
    opts.cluster_token = args.cluster_token;
    for spec in args.peers.split(',').filter(|s| !s.trim().is_empty()) {
        opts.peers
            .push(PeerSpec::parse(spec.trim()).context("parse --peers")?);
    }

    let node = Node::start(opts).await?;
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    node.shutdown().await;
    Ok(())
}
