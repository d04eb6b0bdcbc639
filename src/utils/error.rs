//! The error taxonomy shared across the broker.
//!
//! Every fallible operation in the crate returns [`BrokerError`]. The
//! variants map one-to-one onto how a failure is handled: transport errors
//! are retried or close a single connection, `NotLeader` carries the redirect
//! hint, storage faults halt writes until the store recovers, and `Corrupt`
//! refuses startup entirely.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Socket-level failure on a peer RPC or client connection. Never fatal
    /// to the node; peers are retried with backoff, clients are dropped.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A write reached a non-leader node. `leader` is the current leader's
    /// `host:client_port` when known, so the caller can rebind.
    #[error("not the leader (current leader: {leader:?})")]
    NotLeader { leader: Option<String> },

    /// The durable store rejected an operation. The write serializer keeps
    /// retrying; the Raft core steps down while the fault persists.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A stored record failed its checksum. Requires operator intervention;
    /// the node refuses to start over a corrupt store.
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// The bounded write queue is at capacity. Only surfaced to callers that
    /// opt out of blocking; the Raft apply loop always blocks instead.
    #[error("write queue at capacity")]
    Backpressure,

    /// A malformed client frame. The frame is dropped and the connection
    /// stays open, unless the failure was the initial role tag.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The leader could not reach a majority on a heartbeat cycle, or a
    /// proposal timed out waiting for a quorum to acknowledge it.
    #[error("quorum lost")]
    QuorumLost,

    /// Configuration could not be loaded or parsed at startup.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl From<sled::Error> for BrokerError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Corruption { .. } => BrokerError::Corrupt(err.to_string()),
            other => BrokerError::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Protocol(err.to_string())
    }
}
