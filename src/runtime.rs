use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::config::NodeConfig;
use crate::raft::{
    ChanHandler, ConsensusEngine, HandlerReceivers, LocalEngine, LocalTransport,
    LogPositionHandler, NodeState, RaftError, StateChange,
};

/// Announcement made when the node takes on a new role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    BecameLeader,
    BecameFollower,
    BecameCandidate,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::BecameLeader => f.write_str("***Becoming leader***"),
            Signal::BecameFollower => f.write_str("***Becoming follower***"),
            Signal::BecameCandidate => f.write_str("***Becoming candidate***"),
        }
    }
}

/// Why [`NodeRuntime::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The engine reported `Closed`.
    Closed,
    /// Both event streams were dropped by the engine.
    Disconnected,
}

/// Maps a state to the signal it announces. `Closed` announces nothing.
pub fn signal_for(state: NodeState) -> Option<Signal> {
    match state {
        NodeState::Leader => Some(Signal::BecameLeader),
        NodeState::Follower => Some(Signal::BecameFollower),
        NodeState::Candidate => Some(Signal::BecameCandidate),
        NodeState::Closed => None,
    }
}

/// Owns a consensus engine handle and the two streams it reports on, and
/// turns every state change and error into an output line.
pub struct NodeRuntime<E: ConsensusEngine> {
    engine: E,
    state_changes: mpsc::Receiver<StateChange>,
    errors: mpsc::Receiver<RaftError>,
    output: Box<dyn Write + Send>,
}

impl<E: ConsensusEngine> NodeRuntime<E> {
    pub fn new(engine: E, receivers: HandlerReceivers) -> Self {
        Self {
            engine,
            state_changes: receivers.state_changes,
            errors: receivers.errors,
            output: Box::new(io::stdout()),
        }
    }

    /// Sends signal and error lines to `output` instead of stdout.
    pub fn with_output<W: Write + Send + 'static>(mut self, output: W) -> Self {
        self.output = Box::new(output);
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Reacts to the node entering `state`. Returns the signal emitted, or
    /// `None` for `Closed`.
    pub fn handle_state(&mut self, state: NodeState) -> Option<Signal> {
        let signal = signal_for(state)?;
        info!("{signal}");
        self.write_line(&signal.to_string());
        Some(signal)
    }

    pub fn handle_error(&mut self, err: &RaftError) {
        error!("Error: {err}");
        self.write_line(&format!("Error: {err}"));
    }

    /// Reports the engine's current state, then processes events until the
    /// node closes or the engine drops both streams.
    pub async fn run(&mut self) -> RunOutcome {
        let initial = self.engine.state();
        if initial.is_closed() {
            self.drain_errors();
            return RunOutcome::Closed;
        }
        self.handle_state(initial);

        let mut states_open = true;
        let mut errors_open = true;

        loop {
            tokio::select! {
                change = self.state_changes.recv(), if states_open => match change {
                    Some(change) => {
                        if change.to.is_closed() {
                            self.drain_errors();
                            info!("Node closed, leaving event loop");
                            return RunOutcome::Closed;
                        }
                        self.handle_state(change.to);
                    }
                    None => states_open = false,
                },
                err = self.errors.recv(), if errors_open => match err {
                    Some(err) => self.handle_error(&err),
                    None => errors_open = false,
                },
                else => {
                    warn!("Engine dropped both event streams");
                    return RunOutcome::Disconnected;
                }
            }
        }
    }

    fn drain_errors(&mut self) {
        while let Ok(err) = self.errors.try_recv() {
            self.handle_error(&err);
        }
    }

    fn write_line(&mut self, line: &str) {
        if let Err(e) = writeln!(self.output, "{line}").and_then(|_| self.output.flush()) {
            warn!("Failed to write node output: {e}");
        }
    }
}

/// A started node: its event loop plus the vote policy whose log index the
/// caller advances as entries are applied.
pub struct Node {
    pub runtime: NodeRuntime<LocalEngine>,
    pub votes: Arc<LogPositionHandler>,
}

impl Node {
    /// Connects the transport and constructs the engine described by
    /// `config`. Any failure here is a startup failure.
    pub fn start(config: &NodeConfig) -> Result<Self, RaftError> {
        config.cluster.validate()?;

        let transport = LocalTransport::connect(&config.transport_url)?;
        let votes = Arc::new(LogPositionHandler::new(config.log_index));
        let (handler, receivers) = ChanHandler::channel(config.channel_capacity);

        let engine = LocalEngine::new(
            config.cluster.clone(),
            handler,
            votes.clone(),
            transport,
            &config.log_path,
            config.raft_config(),
        )?;

        Ok(Self {
            runtime: NodeRuntime::new(engine, receivers),
            votes,
        })
    }
}
