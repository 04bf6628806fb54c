// Election runtime for a single cluster node
pub mod config;
pub mod logging;
pub mod raft;
pub mod runtime;

// Public exports
pub use config::NodeConfig;
pub use raft::{ClusterInfo, LogPosition, LogPositionHandler, NodeState, RaftError, StateChange};
pub use runtime::{Node, NodeRuntime, RunOutcome, Signal};
