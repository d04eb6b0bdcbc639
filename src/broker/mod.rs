//! The `broker` module is the core of the Pub/Sub system.
//!
//! It contains the following main components:
//!
//! - `Broker`: the per-node engine that tracks local subscriber connections,
//!   replicated subscription registrations, and fans committed messages out
//!   to matching subscribers.
//! - `Topic`: a named channel with its set of subscribers.
//! - `Message`: a published message, decoded from one of the supported wire
//!   formats with its routing topic extracted.
//!
//! The broker only ever sees committed traffic: the Raft apply loop is its
//! single caller for state changes, which is what keeps every node's view
//! deterministic.

pub mod engine;
pub mod message;
pub mod topic;

pub use engine::{Broker, SubscriptionRecord};
pub use message::{Format, Message};
