//! Per-node context and lifecycle supervision.
//!
//! [`NodeContext`] threads every component through one explicit value
//! instead of process-global state, so a test harness can run a whole
//! cluster of nodes inside one process. The supervisor half of this module
//! owns startup ordering (store first, serializer second, Raft and listeners
//! last) and the graceful shutdown path.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::broker::engine::Broker;
use crate::cluster::discovery::PeerDiscovery;
use crate::cluster::peer::PeerSet;
use crate::config::Settings;
use crate::persistence::sled_store::MessageStore;
use crate::persistence::writer::{spawn_write_serializer, WriterHandle};
use crate::raft::node::RaftNode;
use crate::raft::rpc;
use crate::transport::tcp;
use crate::utils::error::BrokerError;
use crate::utils::Stats;

/// Upper bound on waiting for in-flight client connections during shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Everything one broker node owns, wired together.
pub struct NodeContext {
    pub settings: Settings,
    pub store: Arc<MessageStore>,
    pub writer: WriterHandle,
    pub broker: Arc<Broker>,
    pub raft: Arc<RaftNode>,
    pub peers: Arc<PeerSet>,
    pub stats: Arc<Stats>,
    pub clients: TaskTracker,
    pub shutdown: CancellationToken,
    started_at: Instant,
}

impl NodeContext {
    /// Boots a node: opens the store (refusing a corrupt one), starts the
    /// write serializer, restores Raft state, binds all three listeners, and
    /// spawns every background task.
    ///
    /// Listener bind failures and storage failures are returned to the
    /// caller; both are fatal at startup.
    pub async fn start(
        settings: Settings,
        discovery: Arc<dyn PeerDiscovery>,
    ) -> Result<Arc<Self>, BrokerError> {
        let shutdown = CancellationToken::new();
        let node_id = settings.node_id_string();

        std::fs::create_dir_all(&settings.node.data_dir)?;
        let store = Arc::new(MessageStore::open(&settings.db_path())?);
        let writer = spawn_write_serializer(
            store.clone(),
            settings.broker.write_queue_capacity,
            settings.broker.write_batch_size,
            shutdown.clone(),
        );

        let stats = Arc::new(Stats::default());
        let broker = Arc::new(Broker::new(
            node_id.clone(),
            settings.broker.outbound_queue_capacity,
            stats.clone(),
        ));
        // Registrations applied before the last shutdown are part of the
        // replicated state; reload them so the cluster view survives restart.
        for record in store.load_subscriptions()? {
            broker.apply_subscribe(record);
        }

        let peers = Arc::new(PeerSet::new(node_id.clone()));
        let raft = RaftNode::new(
            &settings,
            &store,
            writer.clone(),
            broker.clone(),
            peers.clone(),
            shutdown.clone(),
            stats.clone(),
        )?;

        let host = settings.node.host.clone();
        let client_listener = TcpListener::bind((host.clone(), settings.node.client_port)).await?;
        let rpc_listener = TcpListener::bind((host.clone(), settings.rpc_port())).await?;
        let admin_listener = TcpListener::bind((host.clone(), settings.node.admin_port)).await?;

        write_pid_file(&settings);

        let ctx = Arc::new(Self {
            settings,
            store,
            writer,
            broker,
            raft: raft.clone(),
            peers: peers.clone(),
            stats,
            clients: TaskTracker::new(),
            shutdown: shutdown.clone(),
            started_at: Instant::now(),
        });

        // Membership first so the first election sees its neighbors.
        let scan_interval = Duration::from_millis(ctx.settings.cluster.scan_interval_ms);
        let grace = Duration::from_millis(ctx.settings.raft.election_timeout_max_ms * 3);
        let probe_timeout = Duration::from_millis(ctx.settings.raft.rpc_timeout_ms * 2);
        tokio::spawn(crate::cluster::run_membership(
            peers,
            discovery,
            scan_interval,
            grace,
            probe_timeout,
            shutdown.clone(),
        ));

        raft.spawn_tasks();
        tokio::spawn(rpc::serve(rpc_listener, raft, shutdown.clone()));

        let tcp_ctx = ctx.clone();
        tokio::spawn(async move { tcp::serve(client_listener, tcp_ctx).await });

        let http_ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = crate::http::serve(admin_listener, http_ctx).await {
                error!(error = %err, "admin http server exited");
            }
        });

        info!(
            node = %node_id,
            client_port = ctx.settings.node.client_port,
            rpc_port = ctx.settings.rpc_port(),
            admin_port = ctx.settings.node.admin_port,
            "node started"
        );
        Ok(ctx)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Graceful shutdown: stop accepting, stop proposing, drain in-flight
    /// client connections up to the deadline, flush the write queue, clean
    /// up the PID file.
    pub async fn stop(&self) {
        info!(node = %self.raft.node_id(), "shutting down");
        self.shutdown.cancel();

        self.clients.close();
        if tokio::time::timeout(DRAIN_DEADLINE, self.clients.wait())
            .await
            .is_err()
        {
            warn!("client connections still open past drain deadline");
        }

        // The serializer drains its queue on cancellation; one final flush
        // catches anything it applied last.
        if let Err(err) = self.store.flush().await {
            warn!(error = %err, "final store flush failed");
        }

        let _ = std::fs::remove_file(self.settings.pid_path());
        info!(node = %self.raft.node_id(), "shutdown complete");
    }
}

fn write_pid_file(settings: &Settings) {
    let path = settings.pid_path();
    if let Err(err) = std::fs::write(&path, std::process::id().to_string()) {
        warn!(%path, error = %err, "could not write pid file");
    }
}
