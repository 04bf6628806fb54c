use serde::{Deserialize, Serialize};

use super::RaftError;

/// Identifies the logical cluster a node joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub name: String,
    pub size: usize,
}

impl ClusterInfo {
    pub fn new(name: &str, size: usize) -> Self {
        Self {
            name: name.to_string(),
            size,
        }
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        if self.name.is_empty() {
            return Err(RaftError::InvalidClusterInfo(
                "cluster name must not be empty".to_string(),
            ));
        }
        if self.size == 0 {
            return Err(RaftError::InvalidClusterInfo(
                "cluster size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Votes (including our own) needed to win an election.
    pub fn quorum(&self) -> usize {
        self.size / 2 + 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    pub node_id: String,
    pub election_timeout_min: u64, // in milliseconds
    pub election_timeout_max: u64, // in milliseconds
    pub heartbeat_interval: u64,   // in milliseconds
}

impl RaftConfig {
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
        }
    }

    pub fn with_election_timeout(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min = min_ms;
        self.election_timeout_max = max_ms.max(min_ms);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval = interval_ms;
        self
    }
}
