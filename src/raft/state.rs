use std::fmt;

use serde::{Deserialize, Serialize};

use super::RaftError;

/// Role a node currently plays in its cluster. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
    Closed,
}

impl NodeState {
    /// Compact code used where the state is stored in an atomic.
    pub fn code(self) -> u8 {
        match self {
            NodeState::Follower => 0,
            NodeState::Candidate => 1,
            NodeState::Leader => 2,
            NodeState::Closed => 3,
        }
    }

    pub fn try_from_code(code: u8) -> Result<Self, RaftError> {
        match code {
            0 => Ok(NodeState::Follower),
            1 => Ok(NodeState::Candidate),
            2 => Ok(NodeState::Leader),
            3 => Ok(NodeState::Closed),
            other => Err(RaftError::UnknownState(other)),
        }
    }

    /// Decodes a state code, aborting on anything outside the known set.
    ///
    /// An unrecognized code means the engine and this node disagree about the
    /// state machine, which cannot be handled safely.
    pub fn from_code(code: u8) -> Self {
        match Self::try_from_code(code) {
            Ok(state) => state,
            Err(err) => panic!("{err}"),
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(self, NodeState::Closed)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Follower => "Follower",
            NodeState::Candidate => "Candidate",
            NodeState::Leader => "Leader",
            NodeState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// A single role transition reported by the consensus engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: NodeState,
    pub to: NodeState,
}

impl StateChange {
    pub fn new(from: NodeState, to: NodeState) -> Self {
        Self { from, to }
    }
}
