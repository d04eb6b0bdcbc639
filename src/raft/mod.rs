//! The `raft` module implements consensus for the replicated broker log.
//!
//! Every write the cluster accepts (message publish, subscription change)
//! becomes a log entry proposed by the leader, replicated to a majority, and
//! applied in index order on every node. The implementation follows the
//! classic decomposition:
//!
//! - `state`: roles, log entries, commands, and the in-memory Raft state.
//! - `node`: the `RaftNode` driving elections, heartbeats, replication,
//!   commit tracking, and the apply loop.
//! - `rpc`: RequestVote / AppendEntries / Propose / Ping over line-delimited
//!   JSON on the peer TCP port.

pub mod node;
pub mod rpc;
pub mod state;

pub use node::{RaftNode, RaftStatus};
pub use state::{Command, EntryKind, LogEntry, Role};

#[cfg(test)]
mod tests;
