use tokio::sync::mpsc;
// Use external log crate, not our own log module
use ::log::debug;

use super::{NodeState, RaftError, StateChange};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Forwards engine notifications into two bounded queues: one for state
/// changes, one for asynchronous errors.
///
/// Sends wait for free capacity. [`LocalEngine`](super::LocalEngine) feeds
/// the handler from a single forwarder task that reads an unbounded internal
/// queue, so a consumer that falls behind stalls only that forwarder.
/// Elections and heartbeats keep running, and undelivered notifications stay
/// buffered in memory, in order, until the consumer drains them.
#[derive(Debug, Clone)]
pub struct ChanHandler {
    state_tx: mpsc::Sender<StateChange>,
    error_tx: mpsc::Sender<RaftError>,
}

/// Receiving halves of the queues fed by a [`ChanHandler`].
#[derive(Debug)]
pub struct HandlerReceivers {
    pub state_changes: mpsc::Receiver<StateChange>,
    pub errors: mpsc::Receiver<RaftError>,
}

impl ChanHandler {
    pub fn new(state_tx: mpsc::Sender<StateChange>, error_tx: mpsc::Sender<RaftError>) -> Self {
        Self { state_tx, error_tx }
    }

    /// Creates a handler and its receivers, each queue holding up to
    /// `capacity` events.
    pub fn channel(capacity: usize) -> (Self, HandlerReceivers) {
        let (state_tx, state_changes) = mpsc::channel(capacity.max(1));
        let (error_tx, errors) = mpsc::channel(capacity.max(1));
        (
            Self::new(state_tx, error_tx),
            HandlerReceivers {
                state_changes,
                errors,
            },
        )
    }

    pub async fn state_change(&self, from: NodeState, to: NodeState) {
        if self.state_tx.send(StateChange::new(from, to)).await.is_err() {
            debug!("State change {from} -> {to} dropped, receiver is gone");
        }
    }

    pub async fn async_error(&self, err: RaftError) {
        if let Err(e) = self.error_tx.send(err).await {
            debug!("Error notification dropped, receiver is gone: {}", e.0);
        }
    }
}
