use std::io::{self, Write};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use graft_node::raft::{ChanHandler, ConsensusEngine};
use graft_node::{NodeRuntime, NodeState, RaftError, RunOutcome};
use tokio::time::timeout;

/// Engine stand-in whose current state is set by the test.
struct ScriptedEngine {
    code: AtomicU8,
}

impl ScriptedEngine {
    fn new(state: NodeState) -> Self {
        Self {
            code: AtomicU8::new(state.code()),
        }
    }
}

impl ConsensusEngine for ScriptedEngine {
    fn state(&self) -> NodeState {
        NodeState::from_code(self.code.load(Ordering::Acquire))
    }

    fn close(&self) {
        self.code.store(NodeState::Closed.code(), Ordering::Release);
    }
}

#[derive(Clone, Default)]
struct Output(Arc<Mutex<Vec<u8>>>);

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("output lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Output {
    fn lines(&self) -> Vec<String> {
        let buf = self.0.lock().expect("output lock");
        String::from_utf8_lossy(&buf)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

const LEADER: &str = "***Becoming leader***";
const FOLLOWER: &str = "***Becoming follower***";
const CANDIDATE: &str = "***Becoming candidate***";

#[tokio::test]
async fn first_signal_reflects_current_state_before_any_event() {
    let (handler, rx) = ChanHandler::channel(8);
    let out = Output::default();
    let mut runtime =
        NodeRuntime::new(ScriptedEngine::new(NodeState::Follower), rx).with_output(out.clone());

    handler
        .state_change(NodeState::Follower, NodeState::Closed)
        .await;

    let outcome = timeout(Duration::from_secs(5), runtime.run())
        .await
        .expect("run finishes");
    assert_eq!(outcome, RunOutcome::Closed);
    assert_eq!(out.lines(), vec![FOLLOWER]);
}

#[tokio::test]
async fn every_transition_emits_exactly_one_signal() {
    let (handler, rx) = ChanHandler::channel(16);
    let out = Output::default();
    let mut runtime =
        NodeRuntime::new(ScriptedEngine::new(NodeState::Follower), rx).with_output(out.clone());

    let transitions = [
        (NodeState::Follower, NodeState::Candidate),
        (NodeState::Candidate, NodeState::Leader),
        (NodeState::Leader, NodeState::Follower),
        (NodeState::Follower, NodeState::Candidate),
        (NodeState::Candidate, NodeState::Candidate),
        (NodeState::Candidate, NodeState::Follower),
        (NodeState::Follower, NodeState::Closed),
    ];
    for (from, to) in transitions {
        handler.state_change(from, to).await;
    }

    let outcome = timeout(Duration::from_secs(5), runtime.run())
        .await
        .expect("run finishes");
    assert_eq!(outcome, RunOutcome::Closed);
    assert_eq!(
        out.lines(),
        vec![FOLLOWER, CANDIDATE, LEADER, FOLLOWER, CANDIDATE, CANDIDATE, FOLLOWER]
    );
}

#[tokio::test]
async fn interleaved_errors_never_reorder_state_changes() {
    let (handler, rx) = ChanHandler::channel(64);
    let out = Output::default();
    let mut runtime =
        NodeRuntime::new(ScriptedEngine::new(NodeState::Follower), rx).with_output(out.clone());

    let producer = tokio::spawn(async move {
        let cycle = [NodeState::Candidate, NodeState::Leader, NodeState::Follower];
        let mut from = NodeState::Follower;
        for i in 0..30 {
            let to = cycle[i % cycle.len()];
            handler.state_change(from, to).await;
            handler
                .async_error(RaftError::NetworkError(format!("blip {i}")))
                .await;
            from = to;
            tokio::task::yield_now().await;
        }
        handler.state_change(from, NodeState::Closed).await;
    });

    let outcome = timeout(Duration::from_secs(5), runtime.run())
        .await
        .expect("run finishes");
    producer.await.expect("producer");
    assert_eq!(outcome, RunOutcome::Closed);

    let lines = out.lines();
    let signals: Vec<&str> = lines
        .iter()
        .map(String::as_str)
        .filter(|l| l.starts_with("***"))
        .collect();
    let mut expected = vec![FOLLOWER];
    for i in 0..30 {
        expected.push([CANDIDATE, LEADER, FOLLOWER][i % 3]);
    }
    assert_eq!(signals, expected);

    let errors: Vec<&str> = lines
        .iter()
        .map(String::as_str)
        .filter(|l| l.starts_with("Error: "))
        .collect();
    assert_eq!(errors.len(), 30);
    for (i, line) in errors.iter().enumerate() {
        assert_eq!(*line, format!("Error: Network error: blip {i}"));
    }
}

#[tokio::test]
async fn errors_are_reported_and_loop_keeps_running() {
    let (handler, rx) = ChanHandler::channel(8);
    let out = Output::default();
    let mut runtime =
        NodeRuntime::new(ScriptedEngine::new(NodeState::Candidate), rx).with_output(out.clone());

    let producer = tokio::spawn(async move {
        handler
            .async_error(RaftError::SerializationError("bad frame".to_string()))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        handler
            .state_change(NodeState::Candidate, NodeState::Leader)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        handler.state_change(NodeState::Leader, NodeState::Closed).await;
    });

    let outcome = timeout(Duration::from_secs(5), runtime.run())
        .await
        .expect("run finishes");
    producer.await.expect("producer");

    assert_eq!(outcome, RunOutcome::Closed);
    assert_eq!(
        out.lines(),
        vec![
            CANDIDATE.to_string(),
            "Error: Serialization error: bad frame".to_string(),
            LEADER.to_string(),
        ]
    );
}

#[tokio::test]
#[should_panic(expected = "Unknown state: 9")]
async fn unknown_engine_state_aborts() {
    let (_handler, rx) = ChanHandler::channel(4);
    let engine = ScriptedEngine {
        code: AtomicU8::new(9),
    };
    let mut runtime = NodeRuntime::new(engine, rx).with_output(Output::default());
    runtime.run().await;
}
