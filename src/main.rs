use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::info;

use graft_node::config::{
    random_node_id, DEFAULT_CLUSTER_NAME, DEFAULT_CLUSTER_SIZE, DEFAULT_LOG_PATH,
    DEFAULT_TRANSPORT_URL,
};
use graft_node::logging::init_logging;
use graft_node::raft::{ConsensusEngine, DEFAULT_CHANNEL_CAPACITY};
use graft_node::{ClusterInfo, Node, NodeConfig};

#[derive(Parser)]
#[command(name = "graft-node")]
#[command(about = "Run a node in a leader-election cluster and report its role changes")]
struct Cli {
    /// Path of the file holding this node's term and vote
    #[arg(long, default_value = DEFAULT_LOG_PATH)]
    path: PathBuf,

    /// Name of the cluster to join
    #[arg(long, default_value = DEFAULT_CLUSTER_NAME)]
    cluster: String,

    /// Expected number of cluster members
    #[arg(long, default_value_t = DEFAULT_CLUSTER_SIZE)]
    size: usize,

    /// Transport endpoint URL
    #[arg(long, default_value = DEFAULT_TRANSPORT_URL)]
    nats: String,

    /// Unique id for this node (random if omitted)
    #[arg(long)]
    id: Option<String>,

    /// Index the local replicated log has reached
    #[arg(long, default_value_t = 0)]
    log_index: u32,

    /// Buffered events per engine stream
    #[arg(long, default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,
}

impl Cli {
    fn into_config(self) -> NodeConfig {
        let node_id = self.id.unwrap_or_else(random_node_id);
        NodeConfig::new(ClusterInfo::new(&self.cluster, self.size), &node_id)
            .with_log_path(self.path)
            .with_transport_url(&self.nats)
            .with_log_index(self.log_index)
            .with_channel_capacity(self.channel_capacity)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_logging();

    let config = Cli::parse().into_config();
    info!(
        "Starting node {} in cluster {} (size {}) via {}",
        config.node_id, config.cluster.name, config.cluster.size, config.transport_url
    );

    let mut node = Node::start(&config)
        .with_context(|| format!("failed to start node {}", config.node_id))?;

    let outcome = tokio::select! {
        outcome = node.runtime.run() => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };

    match outcome {
        Some(outcome) => info!("Event loop finished: {outcome:?}"),
        None => info!("Received shutdown signal"),
    }

    let engine = node.runtime.engine();
    engine.close();
    engine.join().await;

    Ok(())
}
