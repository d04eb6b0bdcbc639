use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::broker::topic::{SubscriberId, Topic, WILDCARD_TOPIC};
use crate::utils::Stats;

/// Consecutive overflow drops tolerated before a subscriber is detached.
const MAX_OVERFLOW_STRIKES: u32 = 3;

/// A replicated subscription registration.
///
/// This is the cluster-wide record carried through the Raft log, distinct
/// from the in-memory connection handle: every node applies it, but only the
/// node hosting the TCP connection delivers frames for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub subscriber_id: String,
    pub node_id: String,
    pub topic: String,
    pub registered_at: i64,
}

/// Outcome of pushing a frame onto a subscriber's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full; the oldest frame was discarded to make room.
    DroppedOldest,
    Closed,
}

/// Bounded FIFO of encoded frames awaiting delivery on one connection.
///
/// The reader side (the connection's writer task) blocks on `pop`; producers
/// never block. When the queue is full the oldest frame is dropped so a slow
/// subscriber lags rather than stalling fan-out.
pub struct OutboundQueue {
    inner: Mutex<VecDeque<String>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        })
    }

    pub fn push(&self, frame: String) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }
        let outcome = {
            let mut queue = self.inner.lock().unwrap();
            let outcome = if queue.len() >= self.capacity {
                queue.pop_front();
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            queue.push_back(frame);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Waits for the next frame. Returns `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut queue = self.inner.lock().unwrap();
                if let Some(frame) = queue.pop_front() {
                    return Some(frame);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct SubscriberConn {
    queue: Arc<OutboundQueue>,
    overflow_strikes: AtomicU32,
    connected_at: i64,
}

/// Summary row for the admin `/subscribers` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberSummary {
    pub subscriber_id: String,
    pub node_id: String,
    pub topics: Vec<String>,
    pub local: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_frames: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<i64>,
}

/// The per-node broker engine.
///
/// Tracks three maps: the local topic → subscriber fan-out index, the local
/// connection handles with their outbound queues, and the replicated
/// registration set applied from the Raft log. The first two exist only on
/// the node hosting the connection; the last is identical on every node.
pub struct Broker {
    node_id: String,
    topics: Mutex<HashMap<String, Topic>>,
    connections: Mutex<HashMap<SubscriberId, SubscriberConn>>,
    registrations: Mutex<HashMap<String, SubscriptionRecord>>,
    queue_capacity: usize,
    stats: Arc<Stats>,
}

impl Broker {
    pub fn new(node_id: String, queue_capacity: usize, stats: Arc<Stats>) -> Self {
        Self {
            node_id,
            topics: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            registrations: Mutex::new(HashMap::new()),
            queue_capacity,
            stats,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Registers a new local subscriber connection and returns its outbound
    /// queue for the connection's writer task.
    pub fn attach_subscriber(&self, id: &str) -> Arc<OutboundQueue> {
        let queue = OutboundQueue::new(self.queue_capacity);
        let conn = SubscriberConn {
            queue: queue.clone(),
            overflow_strikes: AtomicU32::new(0),
            connected_at: chrono::Utc::now().timestamp_millis(),
        };
        self.connections.lock().unwrap().insert(id.to_string(), conn);
        queue
    }

    /// Removes a local subscriber, closing its queue. Returns the topics it
    /// was subscribed to so the caller can replicate the removal.
    pub fn detach_subscriber(&self, id: &str) -> Vec<String> {
        if let Some(conn) = self.connections.lock().unwrap().remove(id) {
            conn.queue.close();
        }
        let id = id.to_string();
        let mut topics = self.topics.lock().unwrap();
        let mut removed = Vec::new();
        for topic in topics.values_mut() {
            if topic.subscribers.remove(&id) {
                removed.push(topic.name.clone());
            }
        }
        removed
    }

    /// Adds a local subscription. Creates the topic on first use.
    pub fn subscribe_local(&self, topic: &str, id: &str) {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic))
            .subscribe(id.to_string());
    }

    pub fn unsubscribe_local(&self, topic: &str, id: &str) {
        if let Some(t) = self.topics.lock().unwrap().get_mut(topic) {
            t.unsubscribe(&id.to_string());
        }
    }

    /// Topics the given local subscriber is currently subscribed to.
    pub fn local_topics(&self, id: &str) -> Vec<String> {
        let id = id.to_string();
        self.topics
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.subscribers.contains(&id))
            .map(|t| t.name.clone())
            .collect()
    }

    /// Pushes a frame directly to one local subscriber (PONG replies and
    /// history replay). Returns false when the subscriber is gone.
    pub fn push_to(&self, id: &str, frame: String) -> bool {
        let connections = self.connections.lock().unwrap();
        match connections.get(id) {
            Some(conn) => !matches!(conn.queue.push(frame), PushOutcome::Closed),
            None => false,
        }
    }

    /// Delivers an encoded frame to every local subscriber whose topic set
    /// contains `topic` (or the wildcard).
    ///
    /// Returns the subscribers detached during delivery (closed queues or
    /// repeated overflow), paired with the topics they held, so the caller
    /// can propagate their removal through the replicated log.
    pub fn fan_out(&self, topic: &str, frame: &str) -> Vec<(SubscriberId, Vec<String>)> {
        let matching: Vec<SubscriberId> = {
            let topics = self.topics.lock().unwrap();
            let mut ids: Vec<SubscriberId> = Vec::new();
            for name in [topic, WILDCARD_TOPIC] {
                if let Some(t) = topics.get(name) {
                    for id in &t.subscribers {
                        if !ids.contains(id) {
                            ids.push(id.clone());
                        }
                    }
                }
            }
            ids
        };

        let mut to_detach: Vec<SubscriberId> = Vec::new();
        {
            let connections = self.connections.lock().unwrap();
            for id in &matching {
                let Some(conn) = connections.get(id) else {
                    continue;
                };
                match conn.queue.push(frame.to_string()) {
                    PushOutcome::Queued => {
                        conn.overflow_strikes.store(0, Ordering::Relaxed);
                        Stats::incr(&self.stats.frames_delivered);
                    }
                    PushOutcome::DroppedOldest => {
                        Stats::incr(&self.stats.frames_dropped);
                        let strikes = conn.overflow_strikes.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(subscriber = %id, strikes, "outbound queue full, dropped oldest frame");
                        if strikes >= MAX_OVERFLOW_STRIKES {
                            to_detach.push(id.clone());
                        }
                    }
                    PushOutcome::Closed => to_detach.push(id.clone()),
                }
            }
        }

        to_detach
            .into_iter()
            .map(|id| {
                debug!(subscriber = %id, "detaching unresponsive subscriber");
                let topics = self.detach_subscriber(&id);
                (id, topics)
            })
            .collect()
    }

    /// Applies a replicated SUBSCRIBE registration. Idempotent: re-applying
    /// the same `(subscriber, topic)` pair overwrites in place.
    pub fn apply_subscribe(&self, record: SubscriptionRecord) {
        let key = registration_key(&record.subscriber_id, &record.topic);
        self.registrations.lock().unwrap().insert(key, record);
    }

    /// Applies a replicated UNSUBSCRIBE.
    pub fn apply_unsubscribe(&self, subscriber_id: &str, topic: &str) {
        let key = registration_key(subscriber_id, topic);
        self.registrations.lock().unwrap().remove(&key);
    }

    pub fn local_subscriber_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Active subscribers: local connections first, then registrations
    /// replicated from other nodes.
    pub fn subscriber_summary(&self) -> Vec<SubscriberSummary> {
        let mut rows: Vec<SubscriberSummary> = Vec::new();

        let local_ids: Vec<(SubscriberId, usize, i64)> = {
            let connections = self.connections.lock().unwrap();
            connections
                .iter()
                .map(|(id, conn)| (id.clone(), conn.queue.len(), conn.connected_at))
                .collect()
        };
        for (id, queued, connected_at) in local_ids {
            rows.push(SubscriberSummary {
                topics: self.local_topics(&id),
                subscriber_id: id,
                node_id: self.node_id.clone(),
                local: true,
                queued_frames: Some(queued),
                connected_at: Some(connected_at),
            });
        }

        let remote: HashMap<String, Vec<String>> = {
            let registrations = self.registrations.lock().unwrap();
            let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
            for record in registrations.values() {
                if record.node_id != self.node_id {
                    grouped
                        .entry(format!("{}@{}", record.subscriber_id, record.node_id))
                        .or_default()
                        .push(record.topic.clone());
                }
            }
            grouped
        };
        for (key, topics) in remote {
            let (subscriber_id, node_id) = key.split_once('@').unwrap_or((key.as_str(), ""));
            rows.push(SubscriberSummary {
                subscriber_id: subscriber_id.to_string(),
                node_id: node_id.to_string(),
                topics,
                local: false,
                queued_frames: None,
                connected_at: None,
            });
        }

        rows.sort_by(|a, b| a.subscriber_id.cmp(&b.subscriber_id));
        rows
    }
}

fn registration_key(subscriber_id: &str, topic: &str) -> String {
    format!("{subscriber_id}/{topic}")
}
