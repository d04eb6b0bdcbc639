use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sled::Db;

use crate::broker::engine::SubscriptionRecord;
use crate::broker::message::{Format, Message};
use crate::raft::state::LogEntry;
use crate::utils::error::BrokerError;

const TREE_MESSAGES: &str = "messages";
const TREE_RAFT_META: &str = "raft_meta";
const TREE_RAFT_LOG: &str = "raft_log";
const TREE_SUBSCRIPTIONS: &str = "subscriptions";

const KEY_META: &[u8] = b"meta";
const KEY_LAST_APPLIED: &[u8] = b"last_applied";

/// A message as it sits in the durable store: the decoded fields plus the
/// store-assigned sequence number and a checksum over the routing-relevant
/// bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub seq_no: u64,
    /// Index of the replicated log entry this record came from. Makes
    /// re-applying the same entry after a crash a no-op.
    pub log_index: u64,
    pub publisher_id: u64,
    pub event_name: String,
    pub value: String,
    pub topic: String,
    pub format: Format,
    pub body: String,
    pub timestamp: i64,
    pub checksum: u32,
}

/// The input to an append: a decoded message stamped with the commit-time
/// timestamp carried in the log entry. The sequence number is assigned by
/// the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub log_index: u64,
    pub publisher_id: u64,
    pub event_name: String,
    pub value: String,
    pub topic: String,
    pub format: Format,
    pub body: String,
    pub timestamp: i64,
}

impl MessageRecord {
    pub fn from_message(message: Message, timestamp: i64, log_index: u64) -> Self {
        Self {
            log_index,
            publisher_id: message.id,
            event_name: message.event_name,
            value: message.value,
            topic: message.topic,
            format: message.format,
            body: message.body,
            timestamp,
        }
    }
}

/// Cheap aggregate of the store for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StoreSnapshot {
    pub message_count: u64,
    pub topics: Vec<String>,
    pub last_applied: u64,
}

/// Persisted Raft metadata, kept as one record so term and vote update
/// atomically.
#[derive(Debug, Serialize, Deserialize)]
struct RaftMeta {
    current_term: u64,
    voted_for: Option<String>,
}

/// The node-local durable store.
///
/// All writes arrive through the write serializer; reads may run
/// concurrently (sled trees are multi-reader). Opening a store whose records
/// fail their checksums is refused with `Corrupt`.
pub struct MessageStore {
    db: Db,
    messages: sled::Tree,
    raft_meta: sled::Tree,
    raft_log: sled::Tree,
    subscriptions: sled::Tree,
    next_seq: AtomicU64,
}

impl MessageStore {
    pub fn open(path: &str) -> Result<Self, BrokerError> {
        let db = sled::open(path)?;
        let messages = db.open_tree(TREE_MESSAGES)?;
        let raft_meta = db.open_tree(TREE_RAFT_META)?;
        let raft_log = db.open_tree(TREE_RAFT_LOG)?;
        let subscriptions = db.open_tree(TREE_SUBSCRIPTIONS)?;

        let next_seq = match messages.last()? {
            Some((key, _)) => decode_u64(&key)? + 1,
            None => 1,
        };

        let store = Self {
            db,
            messages,
            raft_meta,
            raft_log,
            subscriptions,
            next_seq: AtomicU64::new(next_seq),
        };
        store.verify_integrity()?;
        Ok(store)
    }

    /// Re-reads the newest stored message and verifies its checksum, so a
    /// torn or corrupted tail is caught at startup instead of at first read.
    fn verify_integrity(&self) -> Result<(), BrokerError> {
        if let Some((_, value)) = self.messages.last()? {
            let record: StoredMessage = serde_json::from_slice(&value)
                .map_err(|e| BrokerError::Corrupt(format!("undecodable message record: {e}")))?;
            verify_checksum(&record)?;
        }
        Ok(())
    }

    // --- Messages -----------------------------------------------------------

    /// Appends one message record, assigning the next sequence number.
    ///
    /// Idempotent over the replicated log: applying the same entry twice
    /// (crash between the append and the watermark write, then replay)
    /// returns the already-stored sequence instead of duplicating. The
    /// counter only advances after a successful insert, so a failed append
    /// retried by the serializer reuses the same sequence and the numbering
    /// stays gapless on every node.
    pub fn append_message(&self, record: &MessageRecord) -> Result<u64, BrokerError> {
        if let Some((_, value)) = self.messages.last()? {
            if let Ok(last) = serde_json::from_slice::<StoredMessage>(&value) {
                if last.log_index >= record.log_index {
                    return Ok(last.seq_no);
                }
            }
        }
        let seq_no = self.next_seq.load(Ordering::SeqCst);
        let stored = StoredMessage {
            seq_no,
            log_index: record.log_index,
            publisher_id: record.publisher_id,
            event_name: record.event_name.clone(),
            value: record.value.clone(),
            topic: record.topic.clone(),
            format: record.format,
            body: record.body.clone(),
            timestamp: record.timestamp,
            checksum: checksum_of(&record.topic, record.format, &record.body),
        };
        self.messages
            .insert(seq_no.to_be_bytes(), serde_json::to_vec(&stored)?)?;
        self.next_seq.store(seq_no + 1, Ordering::SeqCst);
        Ok(seq_no)
    }

    /// Reads stored messages with `from <= seq_no <= to`, in order.
    pub fn read_range(&self, from: u64, to: u64) -> Result<Vec<StoredMessage>, BrokerError> {
        let mut records = Vec::new();
        for item in self.messages.range(from.to_be_bytes()..=to.to_be_bytes()) {
            let (_, value) = item?;
            let record: StoredMessage = serde_json::from_slice(&value)
                .map_err(|e| BrokerError::Corrupt(format!("undecodable message record: {e}")))?;
            verify_checksum(&record)?;
            records.push(record);
        }
        Ok(records)
    }

    /// Reads the most recent stored messages for one topic (or all topics
    /// for the wildcard), oldest first, bounded by `limit`.
    pub fn read_topic(&self, topic: &str, limit: usize) -> Result<Vec<StoredMessage>, BrokerError> {
        let mut records: Vec<StoredMessage> = Vec::new();
        for item in self.messages.iter().rev() {
            let (_, value) = item?;
            let record: StoredMessage = serde_json::from_slice(&value)
                .map_err(|e| BrokerError::Corrupt(format!("undecodable message record: {e}")))?;
            if record.topic == topic || topic == crate::broker::topic::WILDCARD_TOPIC {
                verify_checksum(&record)?;
                records.push(record);
                if records.len() >= limit {
                    break;
                }
            }
        }
        records.reverse();
        Ok(records)
    }

    /// The most recent messages across all topics, oldest first.
    pub fn recent_messages(&self, limit: usize) -> Result<Vec<StoredMessage>, BrokerError> {
        let mut records: Vec<StoredMessage> = Vec::new();
        for item in self.messages.iter().rev().take(limit) {
            let (_, value) = item?;
            let record: StoredMessage = serde_json::from_slice(&value)
                .map_err(|e| BrokerError::Corrupt(format!("undecodable message record: {e}")))?;
            verify_checksum(&record)?;
            records.push(record);
        }
        records.reverse();
        Ok(records)
    }

    pub fn message_count(&self) -> u64 {
        self.messages.len() as u64
    }

    pub fn snapshot_state(&self) -> Result<StoreSnapshot, BrokerError> {
        let mut topics: Vec<String> = Vec::new();
        for item in self.messages.iter() {
            let (_, value) = item?;
            if let Ok(record) = serde_json::from_slice::<StoredMessage>(&value) {
                if !topics.contains(&record.topic) {
                    topics.push(record.topic);
                }
            }
        }
        topics.sort();
        Ok(StoreSnapshot {
            message_count: self.message_count(),
            topics,
            last_applied: self.load_last_applied()?,
        })
    }

    // --- Raft persistent state ---------------------------------------------

    pub fn save_raft_meta(&self, term: u64, voted_for: Option<&str>) -> Result<(), BrokerError> {
        let meta = RaftMeta {
            current_term: term,
            voted_for: voted_for.map(|s| s.to_string()),
        };
        self.raft_meta.insert(KEY_META, serde_json::to_vec(&meta)?)?;
        Ok(())
    }

    pub fn load_raft_meta(&self) -> Result<(u64, Option<String>), BrokerError> {
        match self.raft_meta.get(KEY_META)? {
            Some(value) => {
                let meta: RaftMeta = serde_json::from_slice(&value)
                    .map_err(|e| BrokerError::Corrupt(format!("undecodable raft meta: {e}")))?;
                Ok((meta.current_term, meta.voted_for))
            }
            None => Ok((0, None)),
        }
    }

    pub fn append_raft_entries(&self, entries: &[LogEntry]) -> Result<(), BrokerError> {
        for entry in entries {
            self.raft_log
                .insert(entry.index.to_be_bytes(), serde_json::to_vec(entry)?)?;
        }
        Ok(())
    }

    /// Removes persisted log entries with `index >= from_index`.
    pub fn truncate_raft_log_from(&self, from_index: u64) -> Result<(), BrokerError> {
        let keys: Vec<_> = self
            .raft_log
            .range(from_index.to_be_bytes()..)
            .keys()
            .collect::<Result<_, _>>()?;
        for key in keys {
            self.raft_log.remove(key)?;
        }
        Ok(())
    }

    pub fn load_raft_log(&self) -> Result<Vec<LogEntry>, BrokerError> {
        let mut entries = Vec::new();
        for item in self.raft_log.iter() {
            let (_, value) = item?;
            let entry: LogEntry = serde_json::from_slice(&value)
                .map_err(|e| BrokerError::Corrupt(format!("undecodable log entry: {e}")))?;
            entries.push(entry);
        }
        entries.sort_by_key(|e| e.index);
        Ok(entries)
    }

    pub fn save_last_applied(&self, index: u64) -> Result<(), BrokerError> {
        self.raft_meta
            .insert(KEY_LAST_APPLIED, index.to_be_bytes().as_slice())?;
        Ok(())
    }

    pub fn load_last_applied(&self) -> Result<u64, BrokerError> {
        match self.raft_meta.get(KEY_LAST_APPLIED)? {
            Some(value) => decode_u64(&value),
            None => Ok(0),
        }
    }

    // --- Subscriptions ------------------------------------------------------

    pub fn save_subscription(&self, record: &SubscriptionRecord) -> Result<(), BrokerError> {
        let key = subscription_key(&record.subscriber_id, &record.topic);
        self.subscriptions
            .insert(key.as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    pub fn remove_subscription(&self, subscriber_id: &str, topic: &str) -> Result<(), BrokerError> {
        let key = subscription_key(subscriber_id, topic);
        self.subscriptions.remove(key.as_bytes())?;
        Ok(())
    }

    pub fn load_subscriptions(&self) -> Result<Vec<SubscriptionRecord>, BrokerError> {
        let mut records = Vec::new();
        for item in self.subscriptions.iter() {
            let (_, value) = item?;
            let record: SubscriptionRecord = serde_json::from_slice(&value)
                .map_err(|e| BrokerError::Corrupt(format!("undecodable subscription: {e}")))?;
            records.push(record);
        }
        Ok(records)
    }

    // --- Durability ---------------------------------------------------------

    /// Flushes the write-ahead buffer; once this returns, preceding inserts
    /// survive a crash.
    pub async fn flush(&self) -> Result<(), BrokerError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

fn subscription_key(subscriber_id: &str, topic: &str) -> String {
    format!("{subscriber_id}/{topic}")
}

fn decode_u64(bytes: &[u8]) -> Result<u64, BrokerError> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| BrokerError::Corrupt("malformed u64 key".to_string()))?;
    Ok(u64::from_be_bytes(array))
}

/// CRC32 over the routing-relevant bytes of a record.
pub fn checksum_of(topic: &str, format: Format, body: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(topic.as_bytes());
    hasher.update(format.as_str().as_bytes());
    hasher.update(body.as_bytes());
    hasher.finalize()
}

fn verify_checksum(record: &StoredMessage) -> Result<(), BrokerError> {
    let expected = checksum_of(&record.topic, record.format, &record.body);
    if record.checksum != expected {
        return Err(BrokerError::Corrupt(format!(
            "checksum mismatch for seq {}: stored {:08x}, computed {:08x}",
            record.seq_no, record.checksum, expected
        )));
    }
    Ok(())
}
