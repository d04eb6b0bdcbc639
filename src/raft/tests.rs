use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::node::RaftNode;
use super::rpc::{AppendEntriesArgs, RequestVoteArgs};
use super::state::{Command, LogEntry, RaftState, Role};
use crate::broker::engine::Broker;
use crate::broker::message::{Format, Message};
use crate::cluster::peer::PeerSet;
use crate::config::Settings;
use crate::persistence::sled_store::MessageStore;
use crate::persistence::writer::spawn_write_serializer;
use crate::utils::error::BrokerError;
use crate::utils::Stats;

struct Harness {
    raft: Arc<RaftNode>,
    broker: Arc<Broker>,
    store: Arc<MessageStore>,
    shutdown: CancellationToken,
    _dir: TempDir,
}

/// Builds a node without binding any sockets. Tests that need the
/// background tasks call `spawn_tasks` themselves.
fn harness(client_port: u16) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut settings = Settings::default();
    settings.node.client_port = client_port;
    settings.node.data_dir = dir.path().to_string_lossy().into_owned();

    let store = Arc::new(MessageStore::open(&settings.db_path()).unwrap());
    let shutdown = CancellationToken::new();
    let writer = spawn_write_serializer(store.clone(), 64, 8, shutdown.clone());
    let stats = Arc::new(Stats::default());
    let broker = Arc::new(Broker::new(
        settings.node_id_string(),
        16,
        stats.clone(),
    ));
    let peers = Arc::new(PeerSet::new(settings.node_id_string()));
    let raft = RaftNode::new(
        &settings,
        &store,
        writer,
        broker.clone(),
        peers,
        shutdown.clone(),
        stats,
    )
    .unwrap();

    Harness {
        raft,
        broker,
        store,
        shutdown,
        _dir: dir,
    }
}

fn entry(term: u64, index: u64) -> LogEntry {
    LogEntry {
        term,
        index,
        command: Command::Noop,
        client_tag: None,
    }
}

fn vote_args(term: u64, candidate: &str, last_index: u64, last_term: u64) -> RequestVoteArgs {
    RequestVoteArgs {
        term,
        candidate_id: candidate.to_string(),
        last_log_index: last_index,
        last_log_term: last_term,
    }
}

fn append_args(
    term: u64,
    leader: &str,
    prev_index: u64,
    prev_term: u64,
    entries: Vec<LogEntry>,
    commit: u64,
) -> AppendEntriesArgs {
    AppendEntriesArgs {
        term,
        leader_id: leader.to_string(),
        prev_log_index: prev_index,
        prev_log_term: prev_term,
        entries,
        leader_commit: commit,
    }
}

#[test]
fn test_state_log_freshness_rule() {
    let mut state = RaftState::restore(1, None, vec![entry(1, 1), entry(2, 2)], 0);
    assert!(state.candidate_log_is_current(2, 2));
    assert!(state.candidate_log_is_current(3, 1));
    assert!(!state.candidate_log_is_current(2, 1));
    assert!(!state.candidate_log_is_current(1, 9));

    assert_eq!(state.entry_term_at(0), Some(0));
    assert_eq!(state.entry_term_at(2), Some(2));
    assert_eq!(state.entry_term_at(3), None);
    state.log.clear();
    assert_eq!(state.last_log_index(), 0);
}

#[tokio::test]
async fn test_grants_vote_and_persists_it() {
    let h = harness(5100);
    let reply = h
        .raft
        .handle_request_vote(vote_args(1, "127.0.0.1:5101", 0, 0))
        .await;
    assert!(reply.vote_granted);
    assert_eq!(reply.term, 1);

    // The vote is on disk before the reply goes out.
    assert_eq!(
        h.store.load_raft_meta().unwrap(),
        (1, Some("127.0.0.1:5101".to_string()))
    );
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_rejects_stale_term_vote() {
    let h = harness(5102);
    h.raft
        .handle_request_vote(vote_args(3, "127.0.0.1:5103", 0, 0))
        .await;

    let reply = h
        .raft
        .handle_request_vote(vote_args(2, "127.0.0.1:5104", 0, 0))
        .await;
    assert!(!reply.vote_granted);
    assert_eq!(reply.term, 3);
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_one_vote_per_term() {
    let h = harness(5105);
    let first = h
        .raft
        .handle_request_vote(vote_args(1, "127.0.0.1:5106", 0, 0))
        .await;
    assert!(first.vote_granted);

    let second = h
        .raft
        .handle_request_vote(vote_args(1, "127.0.0.1:5107", 0, 0))
        .await;
    assert!(!second.vote_granted);

    // The same candidate asking again is fine.
    let again = h
        .raft
        .handle_request_vote(vote_args(1, "127.0.0.1:5106", 0, 0))
        .await;
    assert!(again.vote_granted);
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_rejects_candidate_with_stale_log() {
    let h = harness(5108);
    // Seed two entries via replication from a term-1 leader.
    let reply = h
        .raft
        .handle_append_entries(append_args(
            1,
            "127.0.0.1:5109",
            0,
            0,
            vec![entry(1, 1), entry(1, 2)],
            0,
        ))
        .await;
    assert!(reply.success);

    // A candidate whose log ends earlier must not win our vote.
    let reply = h
        .raft
        .handle_request_vote(vote_args(2, "127.0.0.1:5110", 1, 1))
        .await;
    assert!(!reply.vote_granted);

    // One with a matching log must.
    let reply = h
        .raft
        .handle_request_vote(vote_args(2, "127.0.0.1:5111", 2, 1))
        .await;
    assert!(reply.vote_granted);
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_append_entries_replicates_and_advances_commit() {
    let h = harness(5112);
    let reply = h
        .raft
        .handle_append_entries(append_args(
            1,
            "127.0.0.1:5113",
            0,
            0,
            vec![entry(1, 1), entry(1, 2)],
            2,
        ))
        .await;
    assert!(reply.success);

    let status = h.raft.status().await;
    assert_eq!(status.state, Role::Follower);
    assert_eq!(status.log_length, 2);
    assert_eq!(status.commit_index, 2);
    assert_eq!(status.leader_id.as_deref(), Some("127.0.0.1:5113"));

    // Entries are persisted.
    assert_eq!(h.store.load_raft_log().unwrap().len(), 2);
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_append_entries_truncates_conflicts() {
    let h = harness(5114);
    h.raft
        .handle_append_entries(append_args(
            1,
            "127.0.0.1:5115",
            0,
            0,
            vec![entry(1, 1), entry(1, 2)],
            0,
        ))
        .await;

    // A newer leader overwrites index 2.
    let reply = h
        .raft
        .handle_append_entries(append_args(2, "127.0.0.1:5116", 1, 1, vec![entry(2, 2)], 0))
        .await;
    assert!(reply.success);

    let persisted = h.store.load_raft_log().unwrap();
    assert_eq!(persisted.len(), 2);
    assert_eq!(persisted[1].term, 2);
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_append_entries_conflict_hint_on_gap() {
    let h = harness(5117);
    h.raft
        .handle_append_entries(append_args(
            1,
            "127.0.0.1:5118",
            0,
            0,
            vec![entry(1, 1), entry(1, 2)],
            0,
        ))
        .await;

    let reply = h
        .raft
        .handle_append_entries(append_args(1, "127.0.0.1:5118", 5, 1, vec![entry(1, 6)], 0))
        .await;
    assert!(!reply.success);
    assert_eq!(reply.conflict_index, 3);
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_stale_append_entries_rejected() {
    let h = harness(5119);
    h.raft
        .handle_append_entries(append_args(3, "127.0.0.1:5120", 0, 0, vec![], 0))
        .await;

    let reply = h
        .raft
        .handle_append_entries(append_args(1, "127.0.0.1:5121", 0, 0, vec![], 0))
        .await;
    assert!(!reply.success);
    assert_eq!(reply.term, 3);
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_propose_on_follower_returns_leader_hint() {
    let h = harness(5122);
    h.raft
        .handle_append_entries(append_args(1, "127.0.0.1:5123", 0, 0, vec![], 0))
        .await;

    let result = h.raft.propose(Command::Noop, None).await;
    match result {
        Err(BrokerError::NotLeader { leader }) => {
            assert_eq!(leader.as_deref(), Some("127.0.0.1:5123"));
        }
        other => panic!("expected NotLeader, got {other:?}"),
    }
    h.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_node_elects_commits_and_fans_out() {
    let h = harness(5124);
    h.raft.spawn_tasks();

    // No peers: the node should elect itself shortly after the startup grace.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !h.raft.is_leader().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "node never became leader"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let queue = h.broker.attach_subscriber("sub-1");
    h.broker.subscribe_local("news", "sub-1");

    let message = Message::decode(Format::Json, r#"{"Value":"hello","Topic":"news"}"#);
    let index = h
        .raft
        .propose(
            Command::Publish {
                message,
                timestamp: 42,
            },
            None,
        )
        .await
        .unwrap();
    assert!(index >= 2, "publish should land after the opening no-op");

    // Commit implies durable apply follows; wait for the fan-out frame.
    let frame = tokio::time::timeout(Duration::from_secs(2), queue.pop())
        .await
        .expect("no frame within deadline")
        .expect("queue closed");
    assert!(frame.starts_with("FORMAT:JSON|"));
    assert!(frame.contains("hello"));

    // And the message is in the durable store with sequence 1.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let stored = h.store.read_range(1, 10).unwrap();
        if !stored.is_empty() {
            assert_eq!(stored[0].seq_no, 1);
            assert_eq!(stored[0].topic, "news");
            assert_eq!(stored[0].timestamp, 42);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "message never stored");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let status = h.raft.status().await;
    assert_eq!(status.state, Role::Leader);
    assert!(status.current_term >= 1);
    assert!(status.log_length >= 2);
    h.shutdown.cancel();
}
