use rand::Rng;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
// Use external log crate, not our own log module
use ::log::{debug, error, info, warn};

use super::{
    ChanHandler, ClusterInfo, MessageHandler, NodeState, RaftConfig, RaftError, RaftMessage,
    StateChange, StateFile, Transport, VoteHandler,
};

/// What the node runtime needs from a consensus engine: the current role and
/// a way to shut the engine down. Role changes and errors are pushed through
/// the [`ChanHandler`] the engine was built with.
pub trait ConsensusEngine: Send + Sync {
    fn state(&self) -> NodeState;

    fn close(&self);
}

enum Notification {
    StateChange(StateChange),
    Error(RaftError),
}

struct Core {
    role: NodeState,
    state_file: StateFile,
    leader_id: Option<String>,
}

struct Shared {
    id: String,
    info: ClusterInfo,
    config: RaftConfig,
    role_code: AtomicU8,
    core: Mutex<Core>,
    votes: Arc<dyn VoteHandler>,
    transport: Arc<dyn Transport>,
    // Unbounded so role changes can be queued while `core` is held. The
    // forwarder applies the handler's bounded back-pressure; while the
    // consumer lags, undelivered notifications accumulate here.
    notifications: mpsc::UnboundedSender<Notification>,
    heartbeat: Notify,
    shutdown: watch::Sender<bool>,
}

/// In-process election engine: randomized election timeouts, self-vote plus
/// peer votes through a [`Transport`], leader heartbeats. Term and vote are
/// persisted in a [`StateFile`]. There is no log replication; the log
/// position used in elections comes from the [`VoteHandler`].
pub struct LocalEngine {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalEngine {
    /// Builds the engine and starts its background tasks. Must be called from
    /// within a tokio runtime.
    pub fn new<P: AsRef<Path>>(
        info: ClusterInfo,
        handler: ChanHandler,
        votes: Arc<dyn VoteHandler>,
        transport: Arc<dyn Transport>,
        log_path: P,
        config: RaftConfig,
    ) -> Result<Self, RaftError> {
        info.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| RaftError::Runtime(e.to_string()))?;

        let state_file = StateFile::open(log_path)?;
        info!(
            "Node {} joining cluster {} (size {}) at term {}",
            config.node_id,
            info.name,
            info.size,
            state_file.term()
        );

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            id: config.node_id.clone(),
            info,
            config,
            role_code: AtomicU8::new(NodeState::Follower.code()),
            core: Mutex::new(Core {
                role: NodeState::Follower,
                state_file,
                leader_id: None,
            }),
            votes,
            transport,
            notifications: notify_tx,
            heartbeat: Notify::new(),
            shutdown: shutdown_tx,
        });

        let as_handler: Arc<dyn MessageHandler> = shared.clone();
        let weak: Weak<dyn MessageHandler> = Arc::downgrade(&as_handler);
        shared
            .transport
            .register(&shared.info.name, &shared.id, weak)?;

        let forwarder = runtime.spawn(forward_notifications(notify_rx, handler));
        let driver = runtime.spawn(drive(Arc::clone(&shared), shutdown_rx));

        Ok(Self {
            shared,
            tasks: Mutex::new(vec![forwarder, driver]),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn cluster(&self) -> &ClusterInfo {
        &self.shared.info
    }

    pub fn term(&self) -> u64 {
        self.shared.lock_core().state_file.term()
    }

    pub fn voted_for(&self) -> Option<String> {
        self.shared.lock_core().state_file.vote().map(str::to_string)
    }

    pub fn leader_id(&self) -> Option<String> {
        self.shared.lock_core().leader_id.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == NodeState::Leader
    }

    /// Waits for the background tasks to finish after [`close`](ConsensusEngine::close).
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => return,
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Engine task ended abnormally: {e}");
            }
        }
    }
}

impl ConsensusEngine for LocalEngine {
    fn state(&self) -> NodeState {
        self.shared.state()
    }

    fn close(&self) {
        {
            let mut core = self.shared.lock_core();
            if core.role.is_closed() {
                return;
            }
            self.shared.transition(&mut core, NodeState::Closed);
        }
        let _ = self.shared.shutdown.send(true);
        self.shared
            .transport
            .deregister(&self.shared.info.name, &self.shared.id);
        info!("Node {} closed", self.shared.id);
    }
}

impl Drop for LocalEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn lock_core(&self) -> MutexGuard<'_, Core> {
        // A poisoned lock only means another task panicked mid-update; the
        // election state itself is still usable.
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> NodeState {
        NodeState::from_code(self.role_code.load(Ordering::Acquire))
    }

    /// Changes role and queues the matching state change. Callers hold the
    /// core lock, which keeps notifications in transition order.
    fn transition(&self, core: &mut Core, to: NodeState) {
        let from = core.role;
        if from == to || from.is_closed() {
            return;
        }
        core.role = to;
        self.role_code.store(to.code(), Ordering::Release);
        debug!("Node {} {} -> {}", self.id, from, to);
        let _ = self
            .notifications
            .send(Notification::StateChange(StateChange::new(from, to)));
    }

    fn report(&self, err: RaftError) {
        error!("Node {}: {}", self.id, err);
        let _ = self.notifications.send(Notification::Error(err));
    }

    fn persist(&self, core: &mut Core, term: u64, vote: Option<String>) {
        if let Err(e) = core.state_file.store(term, vote) {
            self.report(e);
        }
    }

    fn step_down(&self, core: &mut Core, term: u64) {
        if term > core.state_file.term() {
            self.persist(core, term, None);
        }
        core.leader_id = None;
        self.transition(core, NodeState::Follower);
    }

    fn election_timeout(&self) -> Duration {
        let mut rng = rand::rng();
        let timeout_ms = rng
            .random_range(self.config.election_timeout_min..=self.config.election_timeout_max);
        Duration::from_millis(timeout_ms)
    }

    fn start_election(&self) {
        let (term, request) = {
            let mut core = self.lock_core();
            if matches!(core.role, NodeState::Leader | NodeState::Closed) {
                return;
            }

            let term = core.state_file.term() + 1;
            self.persist(&mut core, term, Some(self.id.clone()));
            core.leader_id = None;
            self.transition(&mut core, NodeState::Candidate);

            let request = RaftMessage::RequestVote {
                term,
                candidate_id: self.id.clone(),
                last_log_position: self.votes.current_log_position(),
            };
            (term, request)
        };

        info!("Node {} starting election for term {}", self.id, term);

        // Peers take their own locks while answering, so ours must be free.
        let replies = self.transport.broadcast(&self.info.name, &self.id, &request);

        let mut core = self.lock_core();
        let mut granted = 1; // our own vote
        for (peer_id, reply) in replies {
            match reply {
                Ok(Some(RaftMessage::RequestVoteResponse {
                    term: peer_term,
                    vote_granted,
                })) => {
                    if peer_term > core.state_file.term() {
                        info!(
                            "Node {} saw newer term {} from {}, stepping down",
                            self.id, peer_term, peer_id
                        );
                        self.step_down(&mut core, peer_term);
                        return;
                    }
                    if vote_granted && peer_term == term {
                        granted += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("Vote request to {peer_id} failed: {e}"),
            }
        }

        let still_candidate =
            core.role == NodeState::Candidate && core.state_file.term() == term;
        if still_candidate && granted >= self.info.quorum() {
            info!(
                "Node {} won election for term {} with {} of {} votes",
                self.id, term, granted, self.info.size
            );
            core.leader_id = Some(self.id.clone());
            self.transition(&mut core, NodeState::Leader);
        } else {
            debug!(
                "Node {} has {} of {} votes needed for term {}",
                self.id,
                granted,
                self.info.quorum(),
                term
            );
        }
    }

    fn send_heartbeats(&self) {
        let term = {
            let core = self.lock_core();
            if core.role != NodeState::Leader {
                return;
            }
            core.state_file.term()
        };

        let heartbeat = RaftMessage::Heartbeat {
            term,
            leader_id: self.id.clone(),
        };
        let replies = self
            .transport
            .broadcast(&self.info.name, &self.id, &heartbeat);

        let newest = replies
            .iter()
            .filter_map(|(_, reply)| match reply {
                Ok(Some(RaftMessage::HeartbeatResponse { term })) => Some(*term),
                _ => None,
            })
            .max();

        if let Some(peer_term) = newest.filter(|t| *t > term) {
            let mut core = self.lock_core();
            if core.role == NodeState::Leader {
                info!(
                    "Leader {} saw newer term {}, stepping down",
                    self.id, peer_term
                );
                self.step_down(&mut core, peer_term);
            }
        }
    }

    fn handle_request_vote(
        &self,
        term: u64,
        candidate_id: String,
        candidate_position: super::LogPosition,
    ) -> RaftMessage {
        let mut core = self.lock_core();
        if core.role.is_closed() || term < core.state_file.term() {
            return RaftMessage::RequestVoteResponse {
                term: core.state_file.term(),
                vote_granted: false,
            };
        }

        if term > core.state_file.term() {
            self.step_down(&mut core, term);
        }

        let free_to_vote = match core.state_file.vote() {
            None => true,
            Some(voted) => voted == candidate_id,
        };

        let vote_granted = free_to_vote && self.votes.grant_vote(candidate_position);
        if vote_granted {
            self.persist(&mut core, term, Some(candidate_id.clone()));
            self.heartbeat.notify_one();
            debug!(
                "Node {} granted vote to {} for term {}",
                self.id, candidate_id, term
            );
        }

        RaftMessage::RequestVoteResponse {
            term: core.state_file.term(),
            vote_granted,
        }
    }

    fn handle_heartbeat(&self, term: u64, leader_id: String) -> RaftMessage {
        let mut core = self.lock_core();
        let current = core.state_file.term();
        if core.role.is_closed() || term < current {
            return RaftMessage::HeartbeatResponse { term: current };
        }

        if term > current || core.role != NodeState::Follower {
            self.step_down(&mut core, term);
        }
        if core.leader_id.as_deref() != Some(leader_id.as_str()) {
            debug!("Node {} following leader {}", self.id, leader_id);
            core.leader_id = Some(leader_id);
        }
        self.heartbeat.notify_one();

        RaftMessage::HeartbeatResponse {
            term: core.state_file.term(),
        }
    }
}

impl MessageHandler for Shared {
    fn handle_message(&self, message: RaftMessage) -> Option<RaftMessage> {
        match message {
            RaftMessage::RequestVote {
                term,
                candidate_id,
                last_log_position,
            } => Some(self.handle_request_vote(term, candidate_id, last_log_position)),
            RaftMessage::Heartbeat { term, leader_id } => {
                Some(self.handle_heartbeat(term, leader_id))
            }
            // Responses are collected by the sender's broadcast call and
            // never arrive here.
            RaftMessage::RequestVoteResponse { .. } | RaftMessage::HeartbeatResponse { .. } => {
                None
            }
        }
    }
}

async fn forward_notifications(
    mut rx: mpsc::UnboundedReceiver<Notification>,
    handler: ChanHandler,
) {
    while let Some(notification) = rx.recv().await {
        match notification {
            Notification::StateChange(change) => {
                handler.state_change(change.from, change.to).await;
                if change.to.is_closed() {
                    break;
                }
            }
            Notification::Error(err) => handler.async_error(err).await,
        }
    }
}

async fn drive(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match shared.state() {
            NodeState::Closed => break,
            NodeState::Leader => {
                let interval = Duration::from_millis(shared.config.heartbeat_interval);
                tokio::select! {
                    _ = sleep(interval) => shared.send_heartbeats(),
                    _ = shutdown.changed() => break,
                }
            }
            NodeState::Follower | NodeState::Candidate => {
                let timeout = shared.election_timeout();
                tokio::select! {
                    _ = sleep(timeout) => {
                        shared.start_election();
                        // Announce leadership right away instead of waiting a
                        // full heartbeat interval.
                        shared.send_heartbeats();
                    }
                    _ = shared.heartbeat.notified() => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
    debug!("Node {} driver stopped", shared.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{HandlerReceivers, LocalTransport, LogPosition, LogPositionHandler};
    use tempfile::tempdir;
    use tokio::time::timeout;

    fn fast_config(id: &str) -> RaftConfig {
        RaftConfig::new(id)
            .with_election_timeout(20, 40)
            .with_heartbeat_interval(10)
    }

    fn start(
        url: &str,
        id: &str,
        size: usize,
        log_index: u32,
        dir: &Path,
    ) -> (LocalEngine, HandlerReceivers) {
        let (handler, rx) = ChanHandler::channel(64);
        let transport = LocalTransport::connect(url).expect("transport");
        let engine = LocalEngine::new(
            ClusterInfo::new("test", size),
            handler,
            Arc::new(LogPositionHandler::new(log_index)),
            transport,
            dir.join(format!("{id}.log")),
            fast_config(id),
        )
        .expect("engine");
        (engine, rx)
    }

    async fn next_change(rx: &mut HandlerReceivers) -> StateChange {
        timeout(Duration::from_secs(5), rx.state_changes.recv())
            .await
            .expect("state change before timeout")
            .expect("channel open")
    }

    #[tokio::test]
    async fn single_node_cluster_elects_itself() {
        let tmp = tempdir().expect("tempdir");
        let (engine, mut rx) = start("mem://engine-single", "n1", 1, 0, tmp.path());

        assert_eq!(engine.state(), NodeState::Follower);
        assert_eq!(
            next_change(&mut rx).await,
            StateChange::new(NodeState::Follower, NodeState::Candidate)
        );
        assert_eq!(
            next_change(&mut rx).await,
            StateChange::new(NodeState::Candidate, NodeState::Leader)
        );
        assert!(engine.is_leader());
        assert_eq!(engine.term(), 1);
        assert_eq!(engine.voted_for().as_deref(), Some("n1"));
        assert_eq!(engine.leader_id().as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn stalled_consumer_does_not_block_elections() {
        let tmp = tempdir().expect("tempdir");
        let (handler, mut rx) = ChanHandler::channel(1);
        let transport = LocalTransport::connect("mem://engine-stalled").expect("transport");
        let engine = LocalEngine::new(
            ClusterInfo::new("test", 1),
            handler,
            Arc::new(LogPositionHandler::new(0)),
            transport,
            tmp.path().join("n1.log"),
            fast_config("n1"),
        )
        .expect("engine");

        // Nobody reads while the node campaigns, so the second change has
        // nowhere to go until the first is consumed.
        timeout(Duration::from_secs(5), async {
            while !engine.is_leader() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("leader elected while the consumer is stalled");

        engine.close();
        assert_eq!(
            next_change(&mut rx).await,
            StateChange::new(NodeState::Follower, NodeState::Candidate)
        );
        assert_eq!(
            next_change(&mut rx).await,
            StateChange::new(NodeState::Candidate, NodeState::Leader)
        );
        assert_eq!(
            next_change(&mut rx).await,
            StateChange::new(NodeState::Leader, NodeState::Closed)
        );
        engine.join().await;
    }

    #[tokio::test]
    async fn lone_member_of_larger_cluster_stays_candidate() {
        let tmp = tempdir().expect("tempdir");
        let (engine, mut rx) = start("mem://engine-lonely", "n1", 3, 0, tmp.path());

        assert_eq!(
            next_change(&mut rx).await,
            StateChange::new(NodeState::Follower, NodeState::Candidate)
        );
        sleep(Duration::from_millis(150)).await;

        assert_eq!(engine.state(), NodeState::Candidate);
        assert!(engine.term() > 1, "each timeout starts a new term");
        assert!(rx.state_changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_emits_closed_once_and_ends_streams() {
        let tmp = tempdir().expect("tempdir");
        let (engine, mut rx) = start("mem://engine-close", "n1", 3, 0, tmp.path());

        engine.close();
        engine.close();
        engine.join().await;

        assert_eq!(engine.state(), NodeState::Closed);
        assert_eq!(
            next_change(&mut rx).await,
            StateChange::new(NodeState::Follower, NodeState::Closed)
        );
        assert!(rx.state_changes.recv().await.is_none());
        assert!(rx.errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn vote_request_respects_log_position_and_term() {
        let tmp = tempdir().expect("tempdir");
        let (engine, _rx) = start("mem://engine-votes", "n1", 3, 10, tmp.path());
        let shared = Arc::clone(&engine.shared);

        let behind = shared.handle_request_vote(5, "n2".to_string(), LogPosition::from_index(9));
        assert_eq!(
            behind,
            RaftMessage::RequestVoteResponse {
                term: 5,
                vote_granted: false
            }
        );
        assert_eq!(engine.voted_for(), None);

        let caught_up =
            shared.handle_request_vote(5, "n3".to_string(), LogPosition::from_index(10));
        assert_eq!(
            caught_up,
            RaftMessage::RequestVoteResponse {
                term: 5,
                vote_granted: true
            }
        );
        assert_eq!(engine.voted_for().as_deref(), Some("n3"));

        // Already voted for n3 this term.
        let second =
            shared.handle_request_vote(5, "n2".to_string(), LogPosition::from_index(99));
        assert_eq!(
            second,
            RaftMessage::RequestVoteResponse {
                term: 5,
                vote_granted: false
            }
        );

        let stale = shared.handle_request_vote(4, "n2".to_string(), LogPosition::from_index(99));
        assert_eq!(
            stale,
            RaftMessage::RequestVoteResponse {
                term: 5,
                vote_granted: false
            }
        );
    }

    #[tokio::test]
    async fn heartbeat_from_newer_leader_demotes_candidate() {
        let tmp = tempdir().expect("tempdir");
        let (engine, mut rx) = start("mem://engine-heartbeat", "n1", 3, 0, tmp.path());

        assert_eq!(
            next_change(&mut rx).await,
            StateChange::new(NodeState::Follower, NodeState::Candidate)
        );

        let reply = engine.shared.handle_heartbeat(100, "n2".to_string());
        assert_eq!(reply, RaftMessage::HeartbeatResponse { term: 100 });
        assert_eq!(engine.state(), NodeState::Follower);
        assert_eq!(engine.leader_id().as_deref(), Some("n2"));
        assert_eq!(
            next_change(&mut rx).await,
            StateChange::new(NodeState::Candidate, NodeState::Follower)
        );
    }

    #[tokio::test]
    async fn persisted_term_survives_restart() {
        let tmp = tempdir().expect("tempdir");
        {
            let (engine, mut rx) = start("mem://engine-restart", "n1", 1, 0, tmp.path());
            loop {
                if next_change(&mut rx).await.to == NodeState::Leader {
                    break;
                }
            }
            engine.close();
            engine.join().await;
        }

        let file = StateFile::open(tmp.path().join("n1.log")).expect("state file");
        assert!(file.term() >= 1);
        assert_eq!(file.vote(), Some("n1"));

        let (engine, _rx) = start("mem://engine-restart", "n1", 1, 0, tmp.path());
        assert!(engine.term() >= 1);
        assert_eq!(engine.state(), NodeState::Follower);
    }

    #[tokio::test]
    async fn invalid_cluster_info_fails_construction() {
        let tmp = tempdir().expect("tempdir");
        let (handler, _rx) = ChanHandler::channel(4);
        let transport = LocalTransport::connect("mem://engine-invalid").expect("transport");
        let result = LocalEngine::new(
            ClusterInfo::new("test", 0),
            handler,
            Arc::new(LogPositionHandler::new(0)),
            transport,
            tmp.path().join("n1.log"),
            fast_config("n1"),
        );
        assert!(matches!(result, Err(RaftError::InvalidClusterInfo(_))));
    }

    #[test]
    fn construction_outside_runtime_fails() {
        let tmp = tempdir().expect("tempdir");
        let (handler, _rx) = ChanHandler::channel(4);
        let transport = LocalTransport::connect("mem://engine-no-runtime").expect("transport");
        let result = LocalEngine::new(
            ClusterInfo::new("test", 1),
            handler,
            Arc::new(LogPositionHandler::new(0)),
            transport,
            tmp.path().join("n1.log"),
            fast_config("n1"),
        );
        assert!(matches!(result, Err(RaftError::Runtime(_))));
    }
}
