use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::engine::Broker;
use crate::cluster::peer::{rpc_addr_of, Peer, PeerSet};
use crate::config::Settings;
use crate::persistence::sled_store::{MessageRecord, MessageStore};
use crate::persistence::writer::{WriteCommand, WriteOutcome, WriterHandle};
use crate::raft::rpc::{
    self, AppendEntriesArgs, AppendEntriesReply, PongReply, RequestVoteArgs, RequestVoteReply,
    RpcRequest, RpcResponse,
};
use crate::raft::state::{Command, LogEntry, RaftState, Role};
use crate::transport::frame;
use crate::utils::error::BrokerError;
use crate::utils::Stats;

/// How long a proposal waits for its entry to commit before giving up.
const COMMIT_WAIT: Duration = Duration::from_secs(5);
/// Cap on the per-peer replication backoff.
const PEER_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Snapshot of a node's Raft state for the admin `/raft` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RaftStatus {
    pub node_id: String,
    pub state: Role,
    pub current_term: u64,
    pub log_length: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub cluster_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<String>,
}

struct PeerBackoff {
    failures: u32,
    next_attempt: Instant,
}

/// The Raft core for one node.
///
/// Owns the role/term/log state behind a single lock and drives three
/// background tasks: the election timer, the heartbeat/replication driver,
/// and the apply loop. Durable state (term, vote, log entries, the applied
/// watermark) is only ever written through the write serializer, and always
/// before the RPC reply that depends on it leaves the node.
pub struct RaftNode {
    node_id: String,
    client_port: u16,
    admin_port: u16,
    heartbeat_interval: Duration,
    election_timeout_min: Duration,
    election_timeout_max: Duration,
    rpc_timeout: Duration,
    state: RwLock<RaftState>,
    writer: WriterHandle,
    broker: Arc<Broker>,
    peers: Arc<PeerSet>,
    heartbeat_notify: Notify,
    commit_notify: Notify,
    backoff: StdMutex<HashMap<String, PeerBackoff>>,
    shutdown: CancellationToken,
    stats: Arc<Stats>,
}

impl RaftNode {
    /// Builds a node, restoring persisted term, vote, log, and applied
    /// watermark from the store.
    pub fn new(
        settings: &Settings,
        store: &MessageStore,
        writer: WriterHandle,
        broker: Arc<Broker>,
        peers: Arc<PeerSet>,
        shutdown: CancellationToken,
        stats: Arc<Stats>,
    ) -> Result<Arc<Self>, BrokerError> {
        let (current_term, voted_for) = store.load_raft_meta()?;
        let log = store.load_raft_log()?;
        let last_applied = store.load_last_applied()?;
        let state = RaftState::restore(current_term, voted_for, log, last_applied);

        Ok(Arc::new(Self {
            node_id: settings.node_id_string(),
            client_port: settings.node.client_port,
            admin_port: settings.node.admin_port,
            heartbeat_interval: Duration::from_millis(settings.raft.heartbeat_interval_ms),
            election_timeout_min: Duration::from_millis(settings.raft.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(settings.raft.election_timeout_max_ms),
            rpc_timeout: Duration::from_millis(settings.raft.rpc_timeout_ms),
            state: RwLock::new(state),
            writer,
            broker,
            peers,
            heartbeat_notify: Notify::new(),
            commit_notify: Notify::new(),
            backoff: StdMutex::new(HashMap::new()),
            shutdown,
            stats,
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Spawns the election timer, the heartbeat/replication driver, and the
    /// apply loop.
    pub fn spawn_tasks(self: &Arc<Self>) {
        let node = self.clone();
        tokio::spawn(async move { node.run_election_timer().await });

        let node = self.clone();
        tokio::spawn(async move { node.run_heartbeat().await });

        let node = self.clone();
        tokio::spawn(async move { node.run_apply().await });
    }

    // --- Status -------------------------------------------------------------

    pub async fn status(&self) -> RaftStatus {
        let st = self.state.read().await;
        RaftStatus {
            node_id: self.node_id.clone(),
            state: st.role,
            current_term: st.current_term,
            log_length: st.log.len() as u64,
            commit_index: st.commit_index,
            last_applied: st.last_applied,
            cluster_size: self.peers.cluster_size(),
            leader_id: st.leader_id.clone(),
        }
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == Role::Leader
    }

    /// The current leader's `host:client_port`, for redirect hints.
    pub async fn leader_hint(&self) -> Option<String> {
        self.state.read().await.leader_id.clone()
    }

    pub fn pong(&self) -> PongReply {
        PongReply {
            node_id: self.node_id.clone(),
            client_port: self.client_port,
            admin_port: self.admin_port,
        }
    }

    // --- Election timer -----------------------------------------------------

    fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max.max(min)))
    }

    async fn run_election_timer(self: Arc<Self>) {
        // Give the first discovery sweep a chance to populate the peer set,
        // otherwise a cold cluster elects a batch of single-node leaders.
        tokio::time::sleep(self.election_timeout_max).await;

        loop {
            let timeout = self.random_election_timeout();
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    let expired = {
                        let st = self.state.read().await;
                        st.role != Role::Leader && st.last_heartbeat.elapsed() >= timeout
                    };
                    if expired && !self.writer.is_faulted() {
                        self.start_election().await;
                    }
                }
                _ = self.heartbeat_notify.notified() => {
                    // Heartbeat or granted vote resets the timer.
                    continue;
                }
                _ = self.shutdown.cancelled() => return,
            }
        }
    }

    /// Runs one election round. The peer set is snapshotted once at the
    /// start and used unchanged for the whole round, so the quorum threshold
    /// cannot shift while votes are in flight.
    async fn start_election(self: &Arc<Self>) {
        let snapshot = self.peers.alive_peers();
        let majority = (snapshot.len() + 1) / 2 + 1;

        let (term, last_log_index, last_log_term) = {
            let mut st = self.state.write().await;
            st.current_term += 1;
            st.role = Role::Candidate;
            st.voted_for = Some(self.node_id.clone());
            st.leader_id = None;
            st.last_heartbeat = Instant::now();
            (st.current_term, st.last_log_index(), st.last_log_term())
        };

        if let Err(err) = self
            .writer
            .submit(WriteCommand::SaveRaftMeta {
                term,
                voted_for: Some(self.node_id.clone()),
            })
            .await
        {
            warn!(error = %err, "could not persist candidacy, abandoning election");
            let mut st = self.state.write().await;
            st.role = Role::Follower;
            return;
        }

        info!(term, cluster_size = snapshot.len() + 1, "starting election");

        let (vote_tx, mut vote_rx) = mpsc::channel::<RequestVoteReply>(snapshot.len().max(1));
        for peer in &snapshot {
            let args = RequestVoteArgs {
                term,
                candidate_id: self.node_id.clone(),
                last_log_index,
                last_log_term,
            };
            let addr = peer.rpc_addr();
            let timeout = self.rpc_timeout;
            let tx = vote_tx.clone();
            tokio::spawn(async move {
                if let Ok(RpcResponse::RequestVote(reply)) =
                    rpc::call(&addr, &RpcRequest::RequestVote(args), timeout).await
                {
                    let _ = tx.send(reply).await;
                }
            });
        }
        drop(vote_tx);

        let mut votes: usize = 1; // self
        while let Some(reply) = vote_rx.recv().await {
            if reply.term > term {
                let mut st = self.state.write().await;
                if reply.term > st.current_term {
                    st.current_term = reply.term;
                    st.role = Role::Follower;
                    st.voted_for = None;
                    let new_term = st.current_term;
                    drop(st);
                    let _ = self
                        .writer
                        .submit(WriteCommand::SaveRaftMeta {
                            term: new_term,
                            voted_for: None,
                        })
                        .await;
                }
                return;
            }
            if reply.vote_granted {
                votes += 1;
                if votes >= majority {
                    break;
                }
            }
        }

        if votes >= majority {
            self.become_leader(term, &snapshot).await;
        } else {
            debug!(term, votes, majority, "election lost");
            let mut st = self.state.write().await;
            if st.current_term == term && st.role == Role::Candidate {
                st.role = Role::Follower;
            }
        }
    }

    async fn become_leader(self: &Arc<Self>, term: u64, snapshot: &[Peer]) {
        let noop = {
            let mut st = self.state.write().await;
            if st.current_term != term || st.role != Role::Candidate {
                return;
            }
            st.role = Role::Leader;
            st.leader_id = Some(self.node_id.clone());
            let next = st.last_log_index() + 1;
            st.next_index.clear();
            st.match_index.clear();
            for peer in snapshot {
                st.next_index.insert(peer.node_id.clone(), next);
                st.match_index.insert(peer.node_id.clone(), 0);
            }
            // Opening no-op in the new term; committing it commits every
            // carried-over entry beneath it.
            let entry = LogEntry {
                term,
                index: next,
                command: Command::Noop,
                client_tag: None,
            };
            st.log.push(entry.clone());
            entry
        };

        info!(term, "won election, now leader");

        if let Err(err) = self
            .writer
            .submit(WriteCommand::AppendRaftEntries(vec![noop]))
            .await
        {
            warn!(error = %err, "could not persist opening no-op, stepping down");
            self.step_down(None).await;
            return;
        }

        // Assert leadership immediately instead of waiting a heartbeat tick.
        self.replicate_round().await;
        self.update_commit_index().await;
    }

    async fn step_down(&self, new_leader: Option<String>) {
        let mut st = self.state.write().await;
        if st.role != Role::Follower {
            info!(term = st.current_term, "stepping down to follower");
        }
        st.role = Role::Follower;
        st.leader_id = new_leader;
    }

    // --- Heartbeat / replication -------------------------------------------

    async fn run_heartbeat(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.heartbeat_interval) => {}
                _ = self.shutdown.cancelled() => return,
            }

            if self.writer.is_faulted() {
                if self.is_leader().await {
                    warn!("durable store faulted, relinquishing leadership");
                    self.step_down(None).await;
                }
                continue;
            }

            if !self.is_leader().await {
                continue;
            }

            let (reached, cluster_size) = self.replicate_round().await;
            let majority = cluster_size / 2 + 1;
            if reached + 1 < majority {
                warn!(reached, cluster_size, "cannot contact a majority, stepping down");
                self.step_down(None).await;
                continue;
            }
            self.update_commit_index().await;
        }
    }

    /// One replication round: AppendEntries (possibly empty) to every alive
    /// peer in parallel. Returns how many peers answered and the cluster
    /// size used for the round.
    async fn replicate_round(self: &Arc<Self>) -> (usize, usize) {
        let peers = self.peers.alive_peers();
        let cluster_size = peers.len() + 1;

        let mut handles = Vec::with_capacity(peers.len());
        for peer in peers {
            if self.in_backoff(&peer.node_id) {
                continue;
            }
            let node = self.clone();
            handles.push(tokio::spawn(async move {
                node.send_append_entries(&peer).await
            }));
        }

        let mut reached = 0usize;
        for handle in handles {
            if let Ok(true) = handle.await {
                reached += 1;
            }
        }
        (reached, cluster_size)
    }

    /// Sends one AppendEntries to one peer and folds the reply back into
    /// leader state. Returns whether the peer was reachable.
    async fn send_append_entries(self: &Arc<Self>, peer: &Peer) -> bool {
        let args = {
            let st = self.state.read().await;
            if st.role != Role::Leader {
                return false;
            }
            let next_index = st
                .next_index
                .get(&peer.node_id)
                .copied()
                .unwrap_or(st.last_log_index() + 1);
            let prev_log_index = next_index.saturating_sub(1);
            let prev_log_term = st.entry_term_at(prev_log_index).unwrap_or(0);
            let entries: Vec<LogEntry> = st
                .log
                .iter()
                .filter(|e| e.index >= next_index)
                .cloned()
                .collect();
            AppendEntriesArgs {
                term: st.current_term,
                leader_id: self.node_id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: st.commit_index,
            }
        };

        let reply = match rpc::call(
            &peer.rpc_addr(),
            &RpcRequest::AppendEntries(args.clone()),
            self.rpc_timeout,
        )
        .await
        {
            Ok(RpcResponse::AppendEntries(reply)) => reply,
            Ok(_) => return true,
            Err(err) => {
                debug!(peer = %peer.node_id, error = %err, "replication rpc failed");
                self.bump_backoff(&peer.node_id);
                return false;
            }
        };

        self.clear_backoff(&peer.node_id);

        let stale_term = {
            let mut st = self.state.write().await;
            if reply.term > st.current_term {
                st.current_term = reply.term;
                st.role = Role::Follower;
                st.voted_for = None;
                st.leader_id = None;
                Some(st.current_term)
            } else {
                if st.role == Role::Leader && reply.term == st.current_term {
                    if reply.success {
                        let (next, matched) = match args.entries.last() {
                            Some(last) => (last.index + 1, last.index),
                            None => (args.prev_log_index + 1, args.prev_log_index),
                        };
                        st.next_index.insert(peer.node_id.clone(), next);
                        let entry = st.match_index.entry(peer.node_id.clone()).or_insert(0);
                        *entry = (*entry).max(matched);
                    } else if reply.conflict_index > 0 {
                        st.next_index
                            .insert(peer.node_id.clone(), reply.conflict_index.max(1));
                    }
                }
                None
            }
        };

        if let Some(term) = stale_term {
            let _ = self
                .writer
                .submit(WriteCommand::SaveRaftMeta {
                    term,
                    voted_for: None,
                })
                .await;
        }
        true
    }

    /// Advances the commit index to the highest index replicated on a
    /// majority whose entry is from the current term. Entries from earlier
    /// terms commit transitively, never directly.
    async fn update_commit_index(&self) {
        let advanced = {
            let mut st = self.state.write().await;
            if st.role != Role::Leader {
                return;
            }
            let majority = self.peers.cluster_size() / 2 + 1;
            let mut advanced = false;
            let mut n = st.last_log_index();
            while n > st.commit_index {
                let replicas = 1 + st.match_index.values().filter(|m| **m >= n).count();
                if replicas >= majority && st.entry_term_at(n) == Some(st.current_term) {
                    st.commit_index = n;
                    advanced = true;
                    break;
                }
                n -= 1;
            }
            advanced
        };
        if advanced {
            self.commit_notify.notify_waiters();
        }
    }

    fn in_backoff(&self, node_id: &str) -> bool {
        let backoff = self.backoff.lock().unwrap();
        backoff
            .get(node_id)
            .map(|b| Instant::now() < b.next_attempt)
            .unwrap_or(false)
    }

    fn bump_backoff(&self, node_id: &str) {
        let mut backoff = self.backoff.lock().unwrap();
        let entry = backoff.entry(node_id.to_string()).or_insert(PeerBackoff {
            failures: 0,
            next_attempt: Instant::now(),
        });
        entry.failures = entry.failures.saturating_add(1);
        let delay = self
            .heartbeat_interval
            .saturating_mul(2u32.saturating_pow(entry.failures.min(8)))
            .min(PEER_BACKOFF_CAP);
        entry.next_attempt = Instant::now() + delay;
    }

    fn clear_backoff(&self, node_id: &str) {
        self.backoff.lock().unwrap().remove(node_id);
    }

    // --- RPC handlers -------------------------------------------------------

    pub async fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut st = self.state.write().await;

        if args.term < st.current_term {
            return RequestVoteReply {
                term: st.current_term,
                vote_granted: false,
            };
        }

        let mut meta_dirty = false;
        if args.term > st.current_term {
            st.current_term = args.term;
            st.role = Role::Follower;
            st.voted_for = None;
            st.leader_id = None;
            meta_dirty = true;
        }

        let can_vote =
            st.voted_for.is_none() || st.voted_for.as_deref() == Some(args.candidate_id.as_str());
        let log_ok = st.candidate_log_is_current(args.last_log_term, args.last_log_index);
        let granted = can_vote && log_ok;

        if granted {
            st.voted_for = Some(args.candidate_id.clone());
            st.last_heartbeat = Instant::now();
            meta_dirty = true;
        }

        let term = st.current_term;
        if meta_dirty {
            let voted_for = st.voted_for.clone();
            // The vote must be durable before the reply leaves this node.
            if let Err(err) = self
                .writer
                .submit(WriteCommand::SaveRaftMeta { term, voted_for })
                .await
            {
                warn!(error = %err, "could not persist vote, withholding it");
                return RequestVoteReply {
                    term,
                    vote_granted: false,
                };
            }
        }
        drop(st);

        if granted {
            self.heartbeat_notify.notify_one();
        }
        RequestVoteReply {
            term,
            vote_granted: granted,
        }
    }

    pub async fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let mut st = self.state.write().await;

        if args.term < st.current_term {
            return AppendEntriesReply {
                term: st.current_term,
                success: false,
                conflict_index: 0,
            };
        }

        if args.term > st.current_term {
            st.current_term = args.term;
            st.voted_for = None;
            let term = st.current_term;
            if let Err(err) = self
                .writer
                .submit(WriteCommand::SaveRaftMeta {
                    term,
                    voted_for: None,
                })
                .await
            {
                warn!(error = %err, "could not persist term update");
                return AppendEntriesReply {
                    term,
                    success: false,
                    conflict_index: 0,
                };
            }
        }

        st.role = Role::Follower;
        st.leader_id = Some(args.leader_id.clone());
        st.last_heartbeat = Instant::now();
        self.heartbeat_notify.notify_one();
        self.peers.touch(&args.leader_id);

        // Consistency check against the entry preceding the new batch.
        if args.prev_log_index > 0 {
            match st.entry_term_at(args.prev_log_index) {
                None => {
                    let conflict_index = st.last_log_index() + 1;
                    return AppendEntriesReply {
                        term: st.current_term,
                        success: false,
                        conflict_index,
                    };
                }
                Some(local_term) if local_term != args.prev_log_term => {
                    st.log.truncate((args.prev_log_index - 1) as usize);
                    let _ = self
                        .writer
                        .submit(WriteCommand::TruncateRaftLog {
                            from_index: args.prev_log_index,
                        })
                        .await;
                    return AppendEntriesReply {
                        term: st.current_term,
                        success: false,
                        conflict_index: args.prev_log_index,
                    };
                }
                _ => {}
            }
        }

        // Append anything new, truncating on term conflicts.
        let pre_append_len = st.log.len();
        let mut appended: Vec<LogEntry> = Vec::new();
        let mut truncated_from: Option<u64> = None;
        for entry in &args.entries {
            let pos = (entry.index - 1) as usize;
            if pos < st.log.len() {
                if st.log[pos].term != entry.term {
                    st.log.truncate(pos);
                    truncated_from.get_or_insert(entry.index);
                    st.log.push(entry.clone());
                    appended.push(entry.clone());
                }
                // Same index and term: log matching says it is identical.
            } else {
                st.log.push(entry.clone());
                appended.push(entry.clone());
            }
        }

        if let Some(from_index) = truncated_from {
            if let Err(err) = self
                .writer
                .submit(WriteCommand::TruncateRaftLog { from_index })
                .await
            {
                warn!(error = %err, "could not truncate conflicting log suffix");
                let new_len = pre_append_len.min(st.log.len());
                st.log.truncate(new_len);
                return AppendEntriesReply {
                    term: st.current_term,
                    success: false,
                    conflict_index: args.prev_log_index + 1,
                };
            }
        }
        if !appended.is_empty() {
            if let Err(err) = self
                .writer
                .submit(WriteCommand::AppendRaftEntries(appended))
                .await
            {
                warn!(error = %err, "could not persist replicated entries");
                // Memory must not run ahead of disk; drop the unpersisted tail.
                let new_len = pre_append_len.min(st.log.len());
                st.log.truncate(new_len);
                return AppendEntriesReply {
                    term: st.current_term,
                    success: false,
                    conflict_index: args.prev_log_index + 1,
                };
            }
        }

        let mut committed = false;
        if args.leader_commit > st.commit_index {
            st.commit_index = args.leader_commit.min(st.last_log_index());
            committed = true;
        }
        let term = st.current_term;
        drop(st);

        if committed {
            self.commit_notify.notify_waiters();
        }

        AppendEntriesReply {
            term,
            success: true,
            conflict_index: 0,
        }
    }

    // --- Proposals ----------------------------------------------------------

    /// Appends a command to the replicated log and waits for it to commit.
    /// Returns the entry's index. Fails with `NotLeader` on followers.
    pub async fn propose(
        &self,
        command: Command,
        client_tag: Option<String>,
    ) -> Result<u64, BrokerError> {
        if self.writer.is_faulted() {
            return Err(BrokerError::StorageUnavailable(
                "durable store is unavailable".to_string(),
            ));
        }
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Protocol("node is shutting down".to_string()));
        }

        let entry = {
            let mut st = self.state.write().await;
            if st.role != Role::Leader {
                return Err(BrokerError::NotLeader {
                    leader: st.leader_id.clone(),
                });
            }
            let entry = LogEntry {
                term: st.current_term,
                index: st.last_log_index() + 1,
                command,
                client_tag,
            };
            st.log.push(entry.clone());
            entry
        };

        self.writer
            .submit(WriteCommand::AppendRaftEntries(vec![entry.clone()]))
            .await?;

        // A single-node cluster commits on the spot; larger clusters commit
        // on the next replication round.
        self.update_commit_index().await;
        self.wait_for_commit(entry.index, entry.term).await?;
        Ok(entry.index)
    }

    /// Proposes locally when leader, otherwise forwards the command to the
    /// leader over peer RPC. Used for subscription events, which originate
    /// on whichever node the subscriber connected to.
    pub async fn propose_or_forward(&self, command: Command) -> Result<u64, BrokerError> {
        match self.propose(command.clone(), None).await {
            Err(BrokerError::NotLeader {
                leader: Some(leader),
            }) => {
                let addr = rpc_addr_of(&leader).ok_or_else(|| {
                    BrokerError::Protocol(format!("unusable leader address: {leader}"))
                })?;
                let deadline = COMMIT_WAIT + Duration::from_secs(1);
                match rpc::call(
                    &addr,
                    &RpcRequest::Propose {
                        command,
                        client_tag: None,
                    },
                    deadline,
                )
                .await?
                {
                    RpcResponse::Propose(reply) if reply.ok => Ok(reply.index),
                    RpcResponse::Propose(reply) => Err(BrokerError::Protocol(
                        reply.error.unwrap_or_else(|| "forwarded propose failed".to_string()),
                    )),
                    _ => Err(BrokerError::Protocol(
                        "unexpected response to forwarded propose".to_string(),
                    )),
                }
            }
            other => other,
        }
    }

    async fn wait_for_commit(&self, index: u64, term: u64) -> Result<(), BrokerError> {
        let deadline = Instant::now() + COMMIT_WAIT;
        loop {
            let notified = self.commit_notify.notified();
            {
                let st = self.state.read().await;
                match st.entry_term_at(index) {
                    Some(t) if t == term => {
                        if st.commit_index >= index {
                            return Ok(());
                        }
                    }
                    // The entry was overwritten by a newer leader.
                    _ => {
                        return Err(BrokerError::NotLeader {
                            leader: st.leader_id.clone(),
                        })
                    }
                }
                if st.role != Role::Leader {
                    return Err(BrokerError::NotLeader {
                        leader: st.leader_id.clone(),
                    });
                }
            }
            if Instant::now() >= deadline {
                return Err(BrokerError::QuorumLost);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                _ = self.shutdown.cancelled() => return Err(BrokerError::QuorumLost),
            }
        }
    }

    // --- Apply loop ---------------------------------------------------------

    async fn run_apply(self: Arc<Self>) {
        loop {
            if let Err(err) = self.apply_committed().await {
                warn!(error = %err, "apply loop stalled, will retry");
            }
            tokio::select! {
                _ = self.commit_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                _ = self.shutdown.cancelled() => return,
            }
        }
    }

    /// Applies every committed-but-unapplied entry in index order. The
    /// applied watermark only advances after the entry's effects are durable.
    async fn apply_committed(self: &Arc<Self>) -> Result<(), BrokerError> {
        loop {
            let entry = {
                let st = self.state.read().await;
                if st.last_applied >= st.commit_index {
                    return Ok(());
                }
                match st.log.get(st.last_applied as usize) {
                    Some(entry) => entry.clone(),
                    None => return Ok(()),
                }
            };

            self.apply_entry(&entry).await?;
            self.writer
                .submit(WriteCommand::SetLastApplied(entry.index))
                .await?;

            let mut st = self.state.write().await;
            st.last_applied = entry.index;
        }
    }

    async fn apply_entry(self: &Arc<Self>, entry: &LogEntry) -> Result<(), BrokerError> {
        match &entry.command {
            Command::Noop => Ok(()),
            Command::Publish { message, timestamp } => {
                let record = MessageRecord::from_message(message.clone(), *timestamp, entry.index);
                let outcome = self.writer.submit(WriteCommand::AppendMessage(record)).await?;
                if let WriteOutcome::Seq(seq) = outcome {
                    debug!(index = entry.index, seq, topic = %message.topic, "applied publish");
                }
                Stats::incr(&self.stats.messages_published);

                let wire = frame::encode_frame(message.format, &message.body);
                let detached = self.broker.fan_out(&message.topic, &wire);
                for (subscriber_id, topics) in detached {
                    self.replicate_detach(subscriber_id, topics);
                }
                Ok(())
            }
            Command::Subscribe { record } => {
                self.writer
                    .submit(WriteCommand::SaveSubscription(record.clone()))
                    .await?;
                self.broker.apply_subscribe(record.clone());
                Ok(())
            }
            Command::Unsubscribe {
                subscriber_id,
                topic,
                ..
            } => {
                self.writer
                    .submit(WriteCommand::RemoveSubscription {
                        subscriber_id: subscriber_id.clone(),
                        topic: topic.clone(),
                    })
                    .await?;
                self.broker.apply_unsubscribe(subscriber_id, topic);
                Ok(())
            }
        }
    }

    /// Fires UNSUBSCRIBE entries for a subscriber detached during fan-out.
    /// Runs detached from the apply loop: proposing waits for a commit, and
    /// the apply loop must not wait on itself.
    fn replicate_detach(self: &Arc<Self>, subscriber_id: String, topics: Vec<String>) {
        for topic in topics {
            let node = self.clone();
            let subscriber_id = subscriber_id.clone();
            let node_id = self.node_id.clone();
            tokio::spawn(async move {
                let command = Command::Unsubscribe {
                    subscriber_id: subscriber_id.clone(),
                    node_id,
                    topic: topic.clone(),
                };
                if let Err(err) = node.propose_or_forward(command).await {
                    debug!(subscriber = %subscriber_id, %topic, error = %err,
                        "could not replicate detach");
                }
            });
        }
    }
}
