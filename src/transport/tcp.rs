use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::engine::OutboundQueue;
use crate::broker::message::Message;
use crate::broker::topic::WILDCARD_TOPIC;
use crate::node::NodeContext;
use crate::raft::state::Command;
use crate::transport::frame;
use crate::utils::error::BrokerError;
use crate::utils::Stats;

/// How long a fresh connection gets to present its role tag.
const ROLE_TAG_TIMEOUT: Duration = Duration::from_secs(10);
/// Stored messages replayed to a new subscription.
const HISTORY_REPLAY_LIMIT: usize = 100;

/// Accept loop for the client TCP port.
pub async fn serve(listener: TcpListener, ctx: Arc<NodeContext>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let conn_ctx = ctx.clone();
                        // One task per connection so a slow client never
                        // blocks the accept loop.
                        ctx.clients.spawn(async move {
                            if let Err(err) = handle_connection(stream, conn_ctx).await {
                                debug!(peer = %peer, error = %err, "client connection closed");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "failed to accept client connection"),
                }
            }
            _ = ctx.shutdown.cancelled() => return,
        }
    }
}

async fn handle_connection(mut stream: TcpStream, ctx: Arc<NodeContext>) -> Result<(), BrokerError> {
    let mut tag = [0u8; frame::ROLE_TAG_LEN];
    let read_tag = tokio::time::timeout(ROLE_TAG_TIMEOUT, stream.read_exact(&mut tag)).await;
    match read_tag {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => {
            return Err(BrokerError::Protocol(
                "no role tag within handshake window".to_string(),
            ))
        }
    }

    match &tag {
        frame::ROLE_PUBLISHER => handle_publisher(stream, ctx).await,
        frame::ROLE_SUBSCRIBER => handle_subscriber(stream, ctx).await,
        other => {
            Stats::incr(&ctx.stats.protocol_errors);
            Err(BrokerError::Protocol(format!(
                "unknown role tag: {:?}",
                String::from_utf8_lossy(other)
            )))
        }
    }
}

// --- Publishers -------------------------------------------------------------

async fn handle_publisher(stream: TcpStream, ctx: Arc<NodeContext>) -> Result<(), BrokerError> {
    let peer = stream.peer_addr().ok();
    let conn_tag = format!("pub-{}", Uuid::new_v4());
    Stats::incr(&ctx.stats.publisher_connections);
    info!(?peer, tag = %conn_tag, "publisher connected");

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes = tokio::select! {
            read = reader.read_line(&mut line) => read?,
            _ = ctx.shutdown.cancelled() => break,
        };
        if bytes == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            continue;
        }

        let (format, body) = frame::parse_frame(trimmed);
        let message = Message::decode(format, &body);
        let command = Command::Publish {
            message,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        match ctx.raft.propose(command, Some(conn_tag.clone())).await {
            Ok(_) => {}
            Err(BrokerError::NotLeader { leader }) => {
                // Redirect: the publisher rebinds to the leader itself.
                write_half
                    .write_all(frame::not_leader_frame(leader.as_deref()).as_bytes())
                    .await?;
                write_half.flush().await?;
            }
            Err(err) => {
                Stats::incr(&ctx.stats.protocol_errors);
                warn!(tag = %conn_tag, error = %err, "publish rejected");
            }
        }
    }

    info!(?peer, tag = %conn_tag, "publisher disconnected");
    Ok(())
}

// --- Subscribers ------------------------------------------------------------

async fn handle_subscriber(stream: TcpStream, ctx: Arc<NodeContext>) -> Result<(), BrokerError> {
    let peer = stream.peer_addr().ok();
    let subscriber_id = format!("sub-{}", Uuid::new_v4());
    Stats::incr(&ctx.stats.subscriber_connections);
    info!(?peer, subscriber = %subscriber_id, "subscriber connected");

    let (read_half, write_half) = stream.into_split();
    let queue = ctx.broker.attach_subscriber(&subscriber_id);
    let conn_token = ctx.shutdown.child_token();

    let writer_token = conn_token.clone();
    let writer_queue = queue.clone();
    tokio::spawn(run_outbound(write_half, writer_queue, writer_token));

    let idle_timeout = Duration::from_secs(ctx.settings.broker.subscriber_idle_timeout_secs);
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::select! {
            read = tokio::time::timeout(idle_timeout, reader.read_line(&mut line)) => read,
            _ = conn_token.cancelled() => break,
        };
        let bytes = match read {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => {
                debug!(subscriber = %subscriber_id, error = %err, "subscriber read failed");
                break;
            }
            Err(_) => {
                info!(subscriber = %subscriber_id, "no PING within idle window, disconnecting");
                break;
            }
        };
        if bytes == 0 {
            break;
        }

        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        if command == "PING" {
            queue.push(frame::PONG_FRAME.to_string());
        } else if let Some(topic) = command.strip_prefix("SUBSCRIBE:") {
            subscribe(&ctx, &subscriber_id, topic.trim());
        } else if let Some(topic) = command.strip_prefix("UNSUBSCRIBE:") {
            unsubscribe(&ctx, &subscriber_id, topic.trim());
        } else {
            Stats::incr(&ctx.stats.protocol_errors);
            debug!(subscriber = %subscriber_id, frame = %command, "dropping malformed frame");
        }
    }

    // Remove the local registration and replicate the removal so the rest of
    // the cluster forgets this subscriber too.
    let topics = ctx.broker.detach_subscriber(&subscriber_id);
    for topic in topics {
        spawn_unsubscribe(&ctx, &subscriber_id, &topic);
    }
    conn_token.cancel();
    info!(?peer, subscriber = %subscriber_id, "subscriber disconnected");
    Ok(())
}

fn subscribe(ctx: &Arc<NodeContext>, subscriber_id: &str, topic: &str) {
    if topic.is_empty() {
        return;
    }
    ctx.broker.subscribe_local(topic, subscriber_id);
    info!(subscriber = %subscriber_id, %topic, "subscribed");

    replay_history(ctx, subscriber_id, topic);

    // Replicate the registration for cluster-wide visibility. The local
    // registration above is what delivery actually uses, so a slow or failed
    // replication degrades visibility, not delivery.
    let record = crate::broker::engine::SubscriptionRecord {
        subscriber_id: subscriber_id.to_string(),
        node_id: ctx.broker.node_id().to_string(),
        topic: topic.to_string(),
        registered_at: chrono::Utc::now().timestamp_millis(),
    };
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let command = Command::Subscribe {
            record: record.clone(),
        };
        if let Err(err) = ctx.raft.propose_or_forward(command).await {
            warn!(subscriber = %record.subscriber_id, topic = %record.topic, error = %err,
                "could not replicate subscription");
        }
    });
}

fn unsubscribe(ctx: &Arc<NodeContext>, subscriber_id: &str, topic: &str) {
    if topic.is_empty() {
        return;
    }
    ctx.broker.unsubscribe_local(topic, subscriber_id);
    info!(subscriber = %subscriber_id, %topic, "unsubscribed");
    spawn_unsubscribe(ctx, subscriber_id, topic);
}

fn spawn_unsubscribe(ctx: &Arc<NodeContext>, subscriber_id: &str, topic: &str) {
    let command = Command::Unsubscribe {
        subscriber_id: subscriber_id.to_string(),
        node_id: ctx.broker.node_id().to_string(),
        topic: topic.to_string(),
    };
    let ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(err) = ctx.raft.propose_or_forward(command).await {
            debug!(error = %err, "could not replicate unsubscription");
        }
    });
}

/// Queues the topic's stored history for a fresh subscription, oldest first,
/// ahead of live traffic.
fn replay_history(ctx: &Arc<NodeContext>, subscriber_id: &str, topic: &str) {
    let records = if topic == WILDCARD_TOPIC {
        ctx.store.recent_messages(HISTORY_REPLAY_LIMIT)
    } else {
        ctx.store.read_topic(topic, HISTORY_REPLAY_LIMIT)
    };
    match records {
        Ok(records) => {
            for record in records {
                let wire = frame::encode_frame(record.format, &record.body);
                if !ctx.broker.push_to(subscriber_id, wire) {
                    break;
                }
            }
        }
        Err(err) => warn!(%topic, error = %err, "history replay failed"),
    }
}

/// Writer task for one subscriber connection: pops frames off the outbound
/// queue and writes them to the socket. A write failure cancels the
/// connection; the reader side then detaches and replicates the removal.
async fn run_outbound(
    mut write_half: OwnedWriteHalf,
    queue: Arc<OutboundQueue>,
    token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = queue.pop() => frame,
            _ = token.cancelled() => break,
        };
        let Some(frame) = frame else { break };
        if write_half.write_all(frame.as_bytes()).await.is_err()
            || write_half.flush().await.is_err()
        {
            token.cancel();
            break;
        }
    }
}
