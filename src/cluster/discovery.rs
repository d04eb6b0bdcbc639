use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::trace;

use crate::cluster::peer::Peer;
use crate::config::Settings;
use crate::raft::rpc::{self, RpcRequest, RpcResponse};

/// Source of candidate peers.
///
/// The membership task treats the returned set as "reachable right now":
/// peers it contains are upserted as alive, peers it omits are probed
/// directly before being aged toward `Lost`.
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    async fn list_peers(&self) -> Vec<Peer>;
}

/// Fixed peer set, for tests and for deployments that know their topology.
/// Reachability is still verified by the membership task's probes.
pub struct StaticDiscovery {
    peers: Vec<Peer>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<Peer>) -> Self {
        Self { peers }
    }

    /// Convenience constructor from `host:client_port` node ids.
    pub fn from_node_ids(node_ids: &[String]) -> Self {
        let peers = node_ids
            .iter()
            .filter_map(|id| crate::cluster::peer::peer_from_node_id(id))
            .collect();
        Self { peers }
    }
}

#[async_trait]
impl PeerDiscovery for StaticDiscovery {
    async fn list_peers(&self) -> Vec<Peer> {
        self.peers.clone()
    }
}

/// Scans a port range on the configured hosts with the Ping RPC.
///
/// Client ports `base..base + max_nodes` map to peer RPC ports offset by
/// 1000; every port that answers the ping within the probe timeout becomes a
/// peer. All probes in a sweep run concurrently, so one sweep costs roughly
/// one probe timeout regardless of range size.
pub struct PortScanDiscovery {
    hosts: Vec<String>,
    base_client_port: u16,
    max_nodes: u16,
    self_id: String,
    probe_timeout: Duration,
}

impl PortScanDiscovery {
    pub fn new(
        hosts: Vec<String>,
        base_client_port: u16,
        max_nodes: u16,
        self_id: String,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            hosts,
            base_client_port,
            max_nodes,
            self_id,
            probe_timeout,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.cluster.scan_hosts.clone(),
            settings.cluster.base_client_port,
            settings.cluster.max_cluster_size,
            settings.node_id_string(),
            Duration::from_millis(settings.raft.rpc_timeout_ms * 2),
        )
    }
}

#[async_trait]
impl PeerDiscovery for PortScanDiscovery {
    async fn list_peers(&self) -> Vec<Peer> {
        let mut probes = JoinSet::new();
        for host in &self.hosts {
            for offset in 0..self.max_nodes {
                let Some(client_port) = self.base_client_port.checked_add(offset) else {
                    break;
                };
                let node_id = format!("{host}:{client_port}");
                if node_id == self.self_id {
                    continue;
                }
                let host = host.clone();
                let timeout = self.probe_timeout;
                probes.spawn(async move {
                    let rpc_addr = format!("{host}:{}", client_port + 1000);
                    match rpc::call(&rpc_addr, &RpcRequest::Ping, timeout).await {
                        Ok(RpcResponse::Pong(pong)) => {
                            let mut peer = Peer::new(&host, client_port);
                            peer.admin_port = Some(pong.admin_port);
                            Some(peer)
                        }
                        _ => {
                            trace!(addr = %rpc_addr, "no peer at scanned port");
                            None
                        }
                    }
                });
            }
        }

        let mut peers = Vec::new();
        while let Some(result) = probes.join_next().await {
            if let Ok(Some(peer)) = result {
                peers.push(peer);
            }
        }
        peers
    }
}
