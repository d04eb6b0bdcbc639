//! The `transport` module implements the client-facing TCP protocol.
//!
//! A connection opens with an exactly-7-byte role tag (`PUBLISH` or
//! `SUBSCRI`); everything after it is LF-terminated text. Publishers send
//! `FORMAT:<fmt>|<body>` frames which are decoded, leader-checked, and
//! proposed through Raft. Subscribers send `SUBSCRIBE:<topic>` /
//! `UNSUBSCRIBE:<topic>` / `PING` commands and receive the same
//! `FORMAT:…|…` frames back as messages are applied.

pub mod frame;
pub mod tcp;

#[cfg(test)]
mod tests;
