use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;
use tokio::time::Instant;

/// Liveness state of a known peer. `Lost` peers stay in the map (they may
/// come back) but are excluded from quorum arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PeerState {
    Alive,
    Lost,
}

/// A known cluster peer. The identity is the `host:client_port` string; the
/// peer RPC port is derived as `client_port + 1000`, and the admin port is
/// learned from the peer's Pong reply.
#[derive(Debug, Clone)]
pub struct Peer {
    pub node_id: String,
    pub host: String,
    pub client_port: u16,
    pub admin_port: Option<u16>,
    pub last_seen: Instant,
    pub state: PeerState,
}

impl Peer {
    pub fn new(host: &str, client_port: u16) -> Self {
        Self {
            node_id: format!("{host}:{client_port}"),
            host: host.to_string(),
            client_port,
            admin_port: None,
            last_seen: Instant::now(),
            state: PeerState::Alive,
        }
    }

    pub fn client_addr(&self) -> String {
        format!("{}:{}", self.host, self.client_port)
    }

    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.host, self.client_port + 1000)
    }

    pub fn admin_addr(&self) -> Option<String> {
        self.admin_port.map(|p| format!("{}:{}", self.host, p))
    }
}

/// Derives the peer RPC address from a `host:client_port` node id.
pub fn rpc_addr_of(node_id: &str) -> Option<String> {
    let (host, port) = node_id.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some(format!("{host}:{}", port.checked_add(1000)?))
}

/// Parses a `host:client_port` node id into a fresh `Peer`.
pub fn peer_from_node_id(node_id: &str) -> Option<Peer> {
    let (host, port) = node_id.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some(Peer::new(host, port))
}

/// The shared set of known peers, excluding this node itself.
///
/// Quorum size is always computed as the alive peers plus one for self, at
/// the moment of the decision; election code snapshots `alive_peers()` once
/// per election so the count cannot oscillate mid-vote.
pub struct PeerSet {
    self_id: String,
    inner: RwLock<HashMap<String, Peer>>,
}

impl PeerSet {
    pub fn new(self_id: String) -> Self {
        Self {
            self_id,
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Inserts or refreshes a peer as alive. An already-known peer keeps its
    /// admin port when the new record lacks one.
    pub fn upsert_alive(&self, mut peer: Peer) {
        if peer.node_id == self.self_id {
            return;
        }
        peer.last_seen = Instant::now();
        peer.state = PeerState::Alive;
        let mut inner = self.inner.write().unwrap();
        if let Some(existing) = inner.get(&peer.node_id) {
            if peer.admin_port.is_none() {
                peer.admin_port = existing.admin_port;
            }
        }
        inner.insert(peer.node_id.clone(), peer);
    }

    /// Refreshes liveness for a peer. Unknown node ids are parsed and
    /// inserted, so hearing from a leader we have not scanned yet still
    /// registers it.
    pub fn touch(&self, node_id: &str) {
        if node_id == self.self_id {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        match inner.get_mut(node_id) {
            Some(peer) => {
                peer.last_seen = Instant::now();
                peer.state = PeerState::Alive;
            }
            None => {
                if let Some(peer) = peer_from_node_id(node_id) {
                    inner.insert(peer.node_id.clone(), peer);
                }
            }
        }
    }

    pub fn mark_lost(&self, node_id: &str) {
        if let Some(peer) = self.inner.write().unwrap().get_mut(node_id) {
            peer.state = PeerState::Lost;
        }
    }

    pub fn get(&self, node_id: &str) -> Option<Peer> {
        self.inner.read().unwrap().get(node_id).cloned()
    }

    pub fn alive_peers(&self) -> Vec<Peer> {
        self.inner
            .read()
            .unwrap()
            .values()
            .filter(|p| p.state == PeerState::Alive)
            .cloned()
            .collect()
    }

    pub fn all_peers(&self) -> Vec<Peer> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    /// Cluster size for quorum purposes: alive peers plus self.
    pub fn cluster_size(&self) -> usize {
        self.alive_peers().len() + 1
    }
}
