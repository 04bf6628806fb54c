use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
// Use external log crate, not our own log module
use ::log::info;

use super::RaftError;

/// How far a node's replicated log has advanced, as 4 big-endian bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogPosition([u8; 4]);

impl LogPosition {
    pub fn from_index(index: u32) -> Self {
        Self(index.to_be_bytes())
    }

    pub fn index(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl From<u32> for LogPosition {
    fn from(index: u32) -> Self {
        Self::from_index(index)
    }
}

impl TryFrom<&[u8]> for LogPosition {
    type Error = RaftError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let raw: [u8; 4] = bytes
            .try_into()
            .map_err(|_| RaftError::InvalidLogPosition(bytes.len()))?;
        Ok(Self(raw))
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// Hooks the consensus engine calls when it needs this node's log progress
/// or must decide on a vote. Implementations are shared across the engine's
/// tasks and may be called from any thread.
pub trait VoteHandler: Send + Sync {
    fn current_log_position(&self) -> LogPosition;

    fn grant_vote(&self, candidate: LogPosition) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteDecision {
    Granted,
    Rejected {
        candidate: LogPosition,
        local: LogPosition,
    },
}

impl VoteDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, VoteDecision::Granted)
    }
}

impl fmt::Display for VoteDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteDecision::Granted => f.write_str("vote granted"),
            VoteDecision::Rejected { candidate, local } => write!(
                f,
                "Candidate's log ({candidate}) is behind node's log ({local}), rejecting vote request"
            ),
        }
    }
}

/// Grants a vote only to candidates whose log is at least as far along as
/// ours. The local index is written by whatever applies log entries and read
/// concurrently by vote handling.
#[derive(Debug, Default)]
pub struct LogPositionHandler {
    log_index: AtomicU32,
}

impl LogPositionHandler {
    pub fn new(log_index: u32) -> Self {
        Self {
            log_index: AtomicU32::new(log_index),
        }
    }

    pub fn log_index(&self) -> u32 {
        self.log_index.load(Ordering::Acquire)
    }

    pub fn set_log_index(&self, index: u32) {
        self.log_index.store(index, Ordering::Release);
    }

    /// Moves the local index forward, never backwards. Returns the index now
    /// in effect.
    pub fn advance_to(&self, index: u32) -> u32 {
        let previous = self.log_index.fetch_max(index, Ordering::AcqRel);
        previous.max(index)
    }

    pub fn decide(&self, candidate: LogPosition) -> VoteDecision {
        let local = self.current_log_position();
        if candidate.index() >= local.index() {
            VoteDecision::Granted
        } else {
            VoteDecision::Rejected { candidate, local }
        }
    }
}

impl VoteHandler for LogPositionHandler {
    fn current_log_position(&self) -> LogPosition {
        LogPosition::from_index(self.log_index())
    }

    fn grant_vote(&self, candidate: LogPosition) -> bool {
        let decision = self.decide(candidate);
        if !decision.is_granted() {
            info!("{decision}");
        }
        decision.is_granted()
    }
}
