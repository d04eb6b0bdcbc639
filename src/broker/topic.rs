use std::collections::HashSet;

/// Unique identifier for a subscriber connection.
pub type SubscriberId = String;

/// Subscribing to this topic delivers every message regardless of its topic.
pub const WILDCARD_TOPIC: &str = "all";

/// Represents a Pub/Sub topic, which maintains a list of subscribers.
///
/// A `Topic` is a named channel that clients can subscribe to in order to
/// receive messages. It keeps track of all subscribers interested in the
/// topic, ensuring that published messages are delivered to the correct
/// clients.
#[derive(Debug, Default)]
pub struct Topic {
    /// The unique name of the topic (e.g., "sports", "news").
    pub name: String,

    /// A set of unique `SubscriberId`s for all clients subscribed to this
    /// topic. Using a `HashSet` prevents duplicate subscriptions and provides
    /// efficient addition and removal of subscribers.
    pub subscribers: HashSet<SubscriberId>,
}

impl Topic {
    /// Creates a new `Topic` with the given name and no subscribers.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashSet::new(),
        }
    }

    /// Subscribes a client (by ID) to the topic. Idempotent.
    pub fn subscribe(&mut self, id: SubscriberId) {
        self.subscribers.insert(id);
    }

    /// Unsubscribes a client from the topic.
    pub fn unsubscribe(&mut self, id: &SubscriberId) {
        self.subscribers.remove(id);
    }
}
