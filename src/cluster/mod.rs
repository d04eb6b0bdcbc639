//! The `cluster` module maintains the set of known peers without any static
//! configuration.
//!
//! Discovery is pluggable through the [`PeerDiscovery`] trait: the default
//! implementation scans a port range on configured hosts with a lightweight
//! Ping RPC, while tests inject a static set. A periodic membership task
//! merges newly reachable peers and marks peers `Lost` once they fail both
//! the peer RPC probe and the admin port probe for longer than the grace
//! window, at which point they stop counting toward quorum.

pub mod discovery;
pub mod peer;

pub use discovery::{PeerDiscovery, PortScanDiscovery, StaticDiscovery};
pub use peer::{Peer, PeerSet, PeerState};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::raft::rpc::{self, RpcRequest, RpcResponse};

/// Periodically rescans for peers and sweeps the known set for liveness.
///
/// The first scan runs immediately so a freshly started node sees its
/// neighbors before its first election timeout has a chance to produce a
/// single-node cluster.
pub async fn run_membership(
    peers: Arc<PeerSet>,
    discovery: Arc<dyn PeerDiscovery>,
    scan_interval: Duration,
    grace: Duration,
    probe_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let found = discovery.list_peers().await;
        let found_ids: HashSet<String> = found.iter().map(|p| p.node_id.clone()).collect();
        for peer in found {
            if peers.get(&peer.node_id).is_none() {
                info!(peer = %peer.node_id, "discovered peer");
            }
            peers.upsert_alive(peer);
        }

        // Peers the scan did not return get a direct probe before they are
        // written off.
        for peer in peers.all_peers() {
            if found_ids.contains(&peer.node_id) {
                continue;
            }
            if probe_peer(&peer, probe_timeout).await {
                peers.touch(&peer.node_id);
            } else if peer.state == PeerState::Alive && peer.last_seen.elapsed() > grace {
                warn!(peer = %peer.node_id, "peer unreachable past grace window, marking LOST");
                peers.mark_lost(&peer.node_id);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(scan_interval) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

/// Liveness probe: peer RPC ping first, then a bare TCP connect to the admin
/// port. Either one succeeding keeps the peer alive.
pub async fn probe_peer(peer: &Peer, timeout: Duration) -> bool {
    match rpc::call(&peer.rpc_addr(), &RpcRequest::Ping, timeout).await {
        Ok(RpcResponse::Pong(_)) => return true,
        Ok(_) | Err(_) => {}
    }
    if let Some(admin) = peer.admin_addr() {
        let connect = TcpStream::connect(&admin);
        if let Ok(Ok(_)) = tokio::time::timeout(timeout, connect).await {
            debug!(peer = %peer.node_id, "rpc probe failed but admin port is up");
            return true;
        }
    }
    false
}
