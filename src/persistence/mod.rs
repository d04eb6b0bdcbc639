//! The `persistence` module provides the durable, node-local storage layer.
//!
//! Two pieces live here:
//!
//! - `sled_store`: the embedded database holding committed messages, the
//!   persisted Raft state (term, vote, log entries), replicated subscription
//!   records, and the applied watermark. One database file per node.
//! - `writer`: the single-writer serializer. Every mutation of the store
//!   flows through its bounded queue and is applied by one consumer task, so
//!   the store never sees concurrent writers and replication order is
//!   preserved on disk.

pub mod sled_store;
pub mod writer;

pub use sled_store::{MessageRecord, MessageStore, StoreSnapshot, StoredMessage};
pub use writer::{spawn_write_serializer, WriteCommand, WriteOutcome, WriterHandle};
