use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::broker::engine::SubscriptionRecord;
use crate::broker::message::Message;

/// The three Raft roles. Every node starts as a follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Follower => "FOLLOWER",
            Role::Candidate => "CANDIDATE",
            Role::Leader => "LEADER",
        };
        f.write_str(s)
    }
}

/// Discriminant of a log entry's command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryKind {
    Publish,
    Subscribe,
    Unsubscribe,
    Noop,
}

/// The replicated operation carried by a log entry.
///
/// `Publish` carries the commit-time timestamp so that applying the entry is
/// deterministic: every node stamps the stored record with the same value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Publish { message: Message, timestamp: i64 },
    Subscribe { record: SubscriptionRecord },
    Unsubscribe { subscriber_id: String, node_id: String, topic: String },
    Noop,
}

impl Command {
    pub fn kind(&self) -> EntryKind {
        match self {
            Command::Publish { .. } => EntryKind::Publish,
            Command::Subscribe { .. } => EntryKind::Subscribe,
            Command::Unsubscribe { .. } => EntryKind::Unsubscribe,
            Command::Noop => EntryKind::Noop,
        }
    }
}

/// One replicated log entry. Indexes are 1-based and strictly monotone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Command,
    /// Connection tag of the proposing client, for tracing only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_tag: Option<String>,
}

/// In-memory Raft state for one node.
///
/// `current_term`, `voted_for`, and `log` have durable counterparts that are
/// written through the serializer before any RPC reply that depends on them.
/// The leader-only maps are rebuilt on every election win.
pub struct RaftState {
    pub role: Role,
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub leader_id: Option<String>,
    pub log: Vec<LogEntry>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub next_index: HashMap<String, u64>,
    pub match_index: HashMap<String, u64>,
    pub last_heartbeat: Instant,
}

impl RaftState {
    /// Rebuilds state from the persisted term, vote, log, and applied
    /// watermark. The commit index restarts at the applied watermark; the
    /// leader's heartbeats move it forward again.
    pub fn restore(
        current_term: u64,
        voted_for: Option<String>,
        log: Vec<LogEntry>,
        last_applied: u64,
    ) -> Self {
        Self {
            role: Role::Follower,
            current_term,
            voted_for,
            leader_id: None,
            log,
            commit_index: last_applied,
            last_applied,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_heartbeat: Instant::now(),
        }
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at a 1-based index, if present.
    pub fn entry_term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.log.get((index - 1) as usize).map(|e| e.term)
    }

    /// The candidate-log-freshness rule: a candidate's log is at least as
    /// up-to-date when its last term is higher, or equal with an index at
    /// least as large.
    pub fn candidate_log_is_current(&self, last_log_term: u64, last_log_index: u64) -> bool {
        last_log_term > self.last_log_term()
            || (last_log_term == self.last_log_term() && last_log_index >= self.last_log_index())
    }
}
