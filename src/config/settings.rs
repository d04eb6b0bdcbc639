use serde::Deserialize;

/// Top-level configuration settings for a broker node.
///
/// This struct aggregates all configuration parameters required to run one
/// node: its identity and listening ports, cluster discovery bounds, Raft
/// timing, and broker operational limits.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Identity and listening addresses of this node.
    pub node: NodeSettings,
    /// Peer discovery parameters.
    pub cluster: ClusterSettings,
    /// Raft election and replication timing.
    pub raft: RaftSettings,
    /// Operational limits for the broker engine and write queue.
    pub broker: BrokerSettings,
}

/// Identity and network settings for a single node.
#[derive(Debug, Deserialize, Clone)]
pub struct NodeSettings {
    /// Numeric node id, used to name the per-node database and PID files.
    pub id: u32,
    /// The host address the node binds its listeners to.
    pub host: String,
    /// Client TCP port for publishers and subscribers. The peer RPC port is
    /// always `client_port + 1000`.
    pub client_port: u16,
    /// Admin HTTP port.
    pub admin_port: u16,
    /// Directory for the per-node database and PID files.
    pub data_dir: String,
}

/// Settings controlling peer discovery and liveness.
#[derive(Debug, Deserialize, Clone)]
pub struct ClusterSettings {
    /// Hosts scanned for peers.
    pub scan_hosts: Vec<String>,
    /// First client port in the scanned range.
    pub base_client_port: u16,
    /// Number of client ports scanned, which bounds the cluster size.
    pub max_cluster_size: u16,
    /// Interval between discovery rescans, in milliseconds.
    pub scan_interval_ms: u64,
}

/// Raft timing parameters. The heartbeat interval must stay strictly below
/// the minimum election timeout.
#[derive(Debug, Deserialize, Clone)]
pub struct RaftSettings {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Per-call timeout for peer RPCs (votes, replication, pings).
    pub rpc_timeout_ms: u64,
}

/// Operational limits for the broker engine.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    /// Capacity of each subscriber's outbound frame queue.
    pub outbound_queue_capacity: usize,
    /// Seconds of subscriber silence (no PING, no frame) before disconnect.
    pub subscriber_idle_timeout_secs: u64,
    /// Capacity of the bounded durable-write queue.
    pub write_queue_capacity: usize,
    /// Maximum requests drained into one transactional write batch.
    pub write_batch_size: usize,
}

/// Partial configuration settings loaded from files.
///
/// Allows partial specification of settings. Missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub node: Option<PartialNodeSettings>,
    pub cluster: Option<PartialClusterSettings>,
    pub raft: Option<PartialRaftSettings>,
    pub broker: Option<PartialBrokerSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialNodeSettings {
    pub id: Option<u32>,
    pub host: Option<String>,
    pub client_port: Option<u16>,
    pub admin_port: Option<u16>,
    pub data_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialClusterSettings {
    pub scan_hosts: Option<Vec<String>>,
    pub base_client_port: Option<u16>,
    pub max_cluster_size: Option<u16>,
    pub scan_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialRaftSettings {
    pub election_timeout_min_ms: Option<u64>,
    pub election_timeout_max_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub rpc_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub outbound_queue_capacity: Option<usize>,
    pub subscriber_idle_timeout_secs: Option<u64>,
    pub write_queue_capacity: Option<usize>,
    pub write_batch_size: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node: NodeSettings {
                id: 0,
                host: "127.0.0.1".to_string(),
                client_port: 5000,
                admin_port: 8080,
                data_dir: ".".to_string(),
            },
            cluster: ClusterSettings {
                scan_hosts: vec!["127.0.0.1".to_string()],
                base_client_port: 5000,
                max_cluster_size: 20,
                scan_interval_ms: 5000,
            },
            raft: RaftSettings {
                election_timeout_min_ms: 150,
                election_timeout_max_ms: 300,
                heartbeat_interval_ms: 50,
                rpc_timeout_ms: 100,
            },
            broker: BrokerSettings {
                outbound_queue_capacity: 256,
                subscriber_idle_timeout_secs: 90,
                write_queue_capacity: 256,
                write_batch_size: 64,
            },
        }
    }
}

impl Settings {
    /// The string identity of this node, `host:client_port`. Used as the
    /// Raft node id and the leader hint handed to redirected clients.
    pub fn node_id_string(&self) -> String {
        format!("{}:{}", self.node.host, self.node.client_port)
    }

    /// Peer RPC port for this node.
    pub fn rpc_port(&self) -> u16 {
        self.node.client_port + 1000
    }

    /// Path of this node's database.
    pub fn db_path(&self) -> String {
        format!("{}/messages_node_{}.db", self.node.data_dir, self.node.id)
    }

    /// Path of this node's PID file.
    pub fn pid_path(&self) -> String {
        format!("{}/repsub_node_{}.pid", self.node.data_dir, self.node.id)
    }
}
