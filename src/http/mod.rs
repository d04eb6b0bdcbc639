//! The `http` module exposes the admin JSON API.
//!
//! Handlers are thin translators over the node context: they decode the
//! request, call into the core, and encode the result. `POST /publish` on a
//! follower answers with a 307 redirect to the leader's admin URL when the
//! leader's admin port is known, and a JSON error carrying the leader hint
//! otherwise.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::broker::message::{Format, Message};
use crate::node::NodeContext;
use crate::raft::state::Command;
use crate::transport::frame;
use crate::utils::error::BrokerError;
use crate::utils::Stats;

const DEFAULT_MESSAGE_LIMIT: usize = 100;
const MAX_MESSAGE_LIMIT: usize = 1000;

pub fn router(ctx: Arc<NodeContext>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/raft", get(raft_status))
        .route("/messages", get(messages))
        .route("/subscribers", get(subscribers))
        .route("/stats", get(stats))
        .route("/publish", post(publish))
        .with_state(ctx)
}

/// Serves the admin API until shutdown.
pub async fn serve(
    listener: tokio::net::TcpListener,
    ctx: Arc<NodeContext>,
) -> Result<(), BrokerError> {
    let shutdown = ctx.shutdown.clone();
    let app = router(ctx);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn status(State(ctx): State<Arc<NodeContext>>) -> Json<serde_json::Value> {
    Json(json!({
        "node_id": ctx.raft.node_id(),
        "live": true,
        "uptime_secs": ctx.uptime_secs(),
        "message_count": ctx.store.message_count(),
        "local_subscribers": ctx.broker.local_subscriber_count(),
    }))
}

async fn raft_status(State(ctx): State<Arc<NodeContext>>) -> Response {
    Json(ctx.raft.status().await).into_response()
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    limit: Option<usize>,
}

async fn messages(
    State(ctx): State<Arc<NodeContext>>,
    Query(query): Query<MessagesQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_MESSAGE_LIMIT)
        .min(MAX_MESSAGE_LIMIT);
    match ctx.store.recent_messages(limit) {
        Ok(records) => Json(json!({ "messages": records })).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn subscribers(State(ctx): State<Arc<NodeContext>>) -> Response {
    Json(json!({ "subscribers": ctx.broker.subscriber_summary() })).into_response()
}

async fn stats(State(ctx): State<Arc<NodeContext>>) -> Response {
    let snapshot = match ctx.store.snapshot_state() {
        Ok(snapshot) => snapshot,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    };
    Json(json!({
        "messages_published": Stats::get(&ctx.stats.messages_published),
        "frames_delivered": Stats::get(&ctx.stats.frames_delivered),
        "frames_dropped": Stats::get(&ctx.stats.frames_dropped),
        "publisher_connections": Stats::get(&ctx.stats.publisher_connections),
        "subscriber_connections": Stats::get(&ctx.stats.subscriber_connections),
        "protocol_errors": Stats::get(&ctx.stats.protocol_errors),
        "messages_stored": snapshot.message_count,
        "topics": snapshot.topics,
        "last_applied": snapshot.last_applied,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct PublishBody {
    topic: Option<String>,
    format: Option<String>,
    body: String,
}

/// HTTP publish: behaves exactly like a TCP publish after normalization.
///
/// The `body` field may be either a raw payload (with `format` declaring its
/// type) or a pre-formatted `FORMAT:…|…` frame; both are accepted.
async fn publish(State(ctx): State<Arc<NodeContext>>, Json(body): Json<PublishBody>) -> Response {
    let trimmed = body.body.trim_end_matches(['\n', '\r']);
    let (format, payload) = if trimmed.starts_with("FORMAT:") {
        frame::parse_frame(trimmed)
    } else {
        let declared = body
            .format
            .as_deref()
            .and_then(Format::parse)
            .unwrap_or(Format::Raw);
        (declared, trimmed.to_string())
    };

    let mut message = Message::decode(format, &payload);
    // An explicit topic field wins when the payload itself did not carry one.
    if let Some(topic) = body.topic.as_deref() {
        if !topic.is_empty() && message.topic == crate::broker::message::DEFAULT_TOPIC {
            message.topic = topic.to_string();
        }
    }

    let command = Command::Publish {
        message,
        timestamp: chrono::Utc::now().timestamp_millis(),
    };

    match ctx.raft.propose(command, None).await {
        Ok(index) => Json(json!({ "ok": true, "index": index })).into_response(),
        Err(BrokerError::NotLeader { leader }) => not_leader_response(&ctx, leader),
        Err(err) => {
            warn!(error = %err, "http publish failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string())
        }
    }
}

/// 307 with `Location` when the leader's admin URL is resolvable, otherwise
/// a JSON error with whatever hint we have.
fn not_leader_response(ctx: &Arc<NodeContext>, leader: Option<String>) -> Response {
    if let Some(leader_id) = leader.as_deref() {
        if let Some(admin) = ctx.peers.get(leader_id).and_then(|p| p.admin_addr()) {
            return (
                StatusCode::TEMPORARY_REDIRECT,
                [(header::LOCATION, format!("http://{admin}/publish"))],
            )
                .into_response();
        }
    }
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "not the leader", "leader": leader })),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
