use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::raft::{ClusterInfo, RaftConfig, DEFAULT_CHANNEL_CAPACITY};

pub const DEFAULT_LOG_PATH: &str = "./graft.log";
pub const DEFAULT_CLUSTER_NAME: &str = "cluster";
pub const DEFAULT_CLUSTER_SIZE: usize = 3;
pub const DEFAULT_TRANSPORT_URL: &str = "nats://127.0.0.1:4222";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub cluster: ClusterInfo,
    pub node_id: String,
    pub log_path: PathBuf,
    pub transport_url: String,
    pub log_index: u32,
    pub channel_capacity: usize,
    pub election_timeout_min: u64, // in milliseconds
    pub election_timeout_max: u64, // in milliseconds
    pub heartbeat_interval: u64,   // in milliseconds
}

pub fn random_node_id() -> String {
    format!("node-{:08x}", rand::random::<u32>())
}

impl NodeConfig {
    pub fn new(cluster: ClusterInfo, node_id: &str) -> Self {
        let defaults = RaftConfig::new(node_id);
        Self {
            cluster,
            node_id: node_id.to_string(),
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            transport_url: DEFAULT_TRANSPORT_URL.to_string(),
            log_index: 0,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            election_timeout_min: defaults.election_timeout_min,
            election_timeout_max: defaults.election_timeout_max,
            heartbeat_interval: defaults.heartbeat_interval,
        }
    }

    pub fn with_log_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.log_path = path.into();
        self
    }

    pub fn with_transport_url(mut self, url: &str) -> Self {
        self.transport_url = url.to_string();
        self
    }

    pub fn with_log_index(mut self, index: u32) -> Self {
        self.log_index = index;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn raft_config(&self) -> RaftConfig {
        RaftConfig::new(&self.node_id)
            .with_election_timeout(self.election_timeout_min, self.election_timeout_max)
            .with_heartbeat_interval(self.heartbeat_interval)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new(
            ClusterInfo::new(DEFAULT_CLUSTER_NAME, DEFAULT_CLUSTER_SIZE),
            &random_node_id(),
        )
    }
}
