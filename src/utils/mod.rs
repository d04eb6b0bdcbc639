//! Shared utilities: the error taxonomy, logging setup, and runtime counters.

pub mod error;
pub mod logging;

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate runtime counters surfaced by the admin `/stats` endpoint.
///
/// All counters are monotone and updated with relaxed ordering; they are
/// diagnostics, not control state.
#[derive(Debug, Default)]
pub struct Stats {
    pub messages_published: AtomicU64,
    pub frames_delivered: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub publisher_connections: AtomicU64,
    pub subscriber_connections: AtomicU64,
    pub protocol_errors: AtomicU64,
}

impl Stats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
