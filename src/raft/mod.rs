mod config;
mod error;
mod handler;
mod log;
mod node;
mod position;
mod state;
pub mod transport;

pub use self::config::{ClusterInfo, RaftConfig};
pub use self::error::RaftError;
pub use self::handler::{ChanHandler, HandlerReceivers, DEFAULT_CHANNEL_CAPACITY};
pub use self::log::{PersistentState, StateFile};
pub use self::node::{ConsensusEngine, LocalEngine};
pub use self::position::{LogPosition, LogPositionHandler, VoteDecision, VoteHandler};
pub use self::state::{NodeState, StateChange};
pub use self::transport::{LocalTransport, MessageHandler, Transport};

use serde::{Deserialize, Serialize};

// Message types for election traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote {
        term: u64,
        candidate_id: String,
        last_log_position: LogPosition,
    },
    RequestVoteResponse {
        term: u64,
        vote_granted: bool,
    },
    Heartbeat {
        term: u64,
        leader_id: String,
    },
    HeartbeatResponse {
        term: u64,
    },
}
