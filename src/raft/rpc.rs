use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::raft::node::RaftNode;
use crate::raft::state::{Command, LogEntry};
use crate::utils::error::BrokerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// On failure, the index the leader should resend from.
    pub conflict_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeReply {
    pub ok: bool,
    pub index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongReply {
    pub node_id: String,
    pub client_port: u16,
    pub admin_port: u16,
}

/// Peer-to-peer request. One request/response pair per connection, encoded
/// as a single LF-terminated JSON line each way.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcRequest {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
    /// A follower forwarding a replicated operation to the leader.
    Propose {
        command: Command,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_tag: Option<String>,
    },
    /// Liveness probe used by discovery.
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcResponse {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
    Propose(ProposeReply),
    Pong(PongReply),
}

/// Sends one request to a peer and waits for the reply, bounded by
/// `deadline`. Each call opens a fresh connection; peer RPCs are small and
/// infrequent enough that connection reuse is not worth the bookkeeping.
pub async fn call(
    addr: &str,
    request: &RpcRequest,
    deadline: Duration,
) -> Result<RpcResponse, BrokerError> {
    let fut = async {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, mut write_half) = stream.into_split();

        let mut encoded = serde_json::to_vec(request)?;
        encoded.push(b'\n');
        write_half.write_all(&encoded).await?;
        write_half.flush().await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Err(BrokerError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed before replying",
            )));
        }
        let response: RpcResponse = serde_json::from_str(line.trim_end())?;
        Ok(response)
    };

    tokio::time::timeout(deadline, fut).await.map_err(|_| {
        BrokerError::Transport(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("rpc to {addr} timed out"),
        ))
    })?
}

/// Accept loop for the peer RPC port. Every connection carries exactly one
/// request.
pub async fn serve(listener: TcpListener, raft: Arc<RaftNode>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let raft = raft.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_peer(stream, raft).await {
                                debug!(peer = %peer_addr, error = %err, "peer rpc connection failed");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "failed to accept peer connection"),
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

async fn handle_peer(stream: TcpStream, raft: Arc<RaftNode>) -> Result<(), BrokerError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(());
    }

    let request: RpcRequest = serde_json::from_str(line.trim_end())?;
    let response = match request {
        RpcRequest::RequestVote(args) => {
            RpcResponse::RequestVote(raft.handle_request_vote(args).await)
        }
        RpcRequest::AppendEntries(args) => {
            RpcResponse::AppendEntries(raft.handle_append_entries(args).await)
        }
        RpcRequest::Propose {
            command,
            client_tag,
        } => RpcResponse::Propose(match raft.propose(command, client_tag).await {
            Ok(index) => ProposeReply {
                ok: true,
                index,
                error: None,
            },
            Err(err) => ProposeReply {
                ok: false,
                index: 0,
                error: Some(err.to_string()),
            },
        }),
        RpcRequest::Ping => RpcResponse::Pong(raft.pong()),
    };

    let mut encoded = serde_json::to_vec(&response)?;
    encoded.push(b'\n');
    write_half.write_all(&encoded).await?;
    write_half.flush().await?;
    Ok(())
}
