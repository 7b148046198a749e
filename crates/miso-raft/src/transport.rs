//! Transport boundary for inter-node RPC.
//!
//! The engine depends on point-to-point request/response delivery only: send
//! an RPC to a member, get the response or a timeout. Every outbound call is
//! stamped with a correlation id from the configured [`CorrelationStrategy`]
//! and the response must echo it, so overlapping calls to one peer resolve
//! independently. Wire encoding belongs to the implementation; the RPC types
//! are serde-serializable for transports that need it.
//!
//! [`InMemoryTransport`] delivers over tokio channels for tests and
//! single-process clusters, with per-link blocking to simulate partitions.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::correlate::{CorrelationStrategy, RequestId};
use crate::error::{RaftError, Result};
use crate::types::*;

/// An inbound RPC plus the path its response takes back.
#[derive(Debug)]
pub struct Envelope {
    pub request_id: RequestId,
    pub from: NodeId,
    pub request: RpcRequest,
    reply: oneshot::Sender<Reply>,
}

impl Envelope {
    /// Answer this RPC. Consumes the envelope; a response is sent exactly
    /// once, echoing the request's correlation id.
    pub fn respond(self, response: RpcResponse) {
        let (_, _, sink) = self.into_parts();
        sink.send(response);
    }

    /// Split into sender, request, and the response path, for dispatchers
    /// that need to consume the request before answering.
    pub fn into_parts(self) -> (NodeId, RpcRequest, ResponseSink) {
        (
            self.from,
            self.request,
            ResponseSink {
                request_id: self.request_id,
                reply: self.reply,
            },
        )
    }
}

/// The write half of one RPC exchange.
#[derive(Debug)]
pub struct ResponseSink {
    request_id: RequestId,
    reply: oneshot::Sender<Reply>,
}

impl ResponseSink {
    pub fn send(self, response: RpcResponse) {
        let _ = self.reply.send(Reply {
            request_id: self.request_id,
            response,
        });
    }
}

#[derive(Debug)]
struct Reply {
    request_id: RequestId,
    response: RpcResponse,
}

pub type RpcSender = mpsc::Sender<Envelope>;
pub type RpcReceiver = mpsc::Receiver<Envelope>;

/// Point-to-point RPC delivery to cluster members.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn vote(&self, target: &NodeId, request: VoteRequest) -> Result<VoteResponse>;

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;
}

/// Channel-backed transport for in-process clusters.
pub struct InMemoryTransport {
    local_id: NodeId,
    correlate: Arc<dyn CorrelationStrategy>,
    rpc_timeout: Duration,
    peers: Arc<RwLock<HashMap<NodeId, RpcSender>>>,
    /// Peers this node currently cannot reach (simulated partition).
    blocked: Arc<RwLock<HashSet<NodeId>>>,
}

impl InMemoryTransport {
    pub fn new(
        local_id: NodeId,
        peers: HashMap<NodeId, RpcSender>,
        correlate: Arc<dyn CorrelationStrategy>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            local_id,
            correlate,
            rpc_timeout,
            peers: Arc::new(RwLock::new(peers)),
            blocked: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn add_peer(&self, peer_id: NodeId, sender: RpcSender) {
        self.peers.write().insert(peer_id, sender);
    }

    pub fn remove_peer(&self, peer_id: &NodeId) {
        self.peers.write().remove(peer_id);
    }

    /// Drop the outbound link to `peer` until [`unblock_link`](Self::unblock_link).
    pub fn block_link(&self, peer: &NodeId) {
        self.blocked.write().insert(peer.clone());
    }

    pub fn unblock_link(&self, peer: &NodeId) {
        self.blocked.write().remove(peer);
    }

    /// Sever every outbound link (full isolation of this node's sends).
    pub fn block_all(&self) {
        let peers: Vec<NodeId> = self.peers.read().keys().cloned().collect();
        self.blocked.write().extend(peers);
    }

    pub fn unblock_all(&self) {
        self.blocked.write().clear();
    }

    fn link_to(&self, target: &NodeId) -> Result<RpcSender> {
        if self.blocked.read().contains(target) {
            return Err(RaftError::Transport {
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("link to {target} blocked"),
                ),
            });
        }
        self.peers.read().get(target).cloned().ok_or_else(|| {
            RaftError::Transport {
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("peer not found: {target}"),
                ),
            }
        })
    }

    /// Ship `request`, wait for the correlated response or the deadline.
    async fn call(&self, target: &NodeId, request: RpcRequest) -> Result<RpcResponse> {
        let link = self.link_to(target)?;
        let request_id = self.correlate.next_id();
        let (reply_tx, reply_rx) = oneshot::channel();

        link.send(Envelope {
            request_id,
            from: self.local_id.clone(),
            request,
            reply: reply_tx,
        })
        .await
        .map_err(|_| RaftError::Transport {
            source: std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("peer {target} hung up"),
            ),
        })?;

        let reply = tokio::time::timeout(self.rpc_timeout, reply_rx)
            .await
            .map_err(|_| RaftError::Transport {
                source: std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("rpc {request_id} to {target} timed out"),
                ),
            })?
            .map_err(|_| RaftError::Transport {
                source: std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    format!("peer {target} dropped rpc {request_id}"),
                ),
            })?;

        if reply.request_id != request_id {
            return Err(RaftError::Internal {
                reason: format!(
                    "correlation mismatch: sent {request_id}, got {}",
                    reply.request_id
                ),
            });
        }

        Ok(reply.response)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn vote(&self, target: &NodeId, request: VoteRequest) -> Result<VoteResponse> {
        match self.call(target, RpcRequest::Vote(request)).await? {
            RpcResponse::Vote(response) => Ok(response),
            other => Err(RaftError::Internal {
                reason: format!("expected vote response, got {other:?}"),
            }),
        }
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        match self.call(target, RpcRequest::AppendEntries(request)).await? {
            RpcResponse::AppendEntries(response) => Ok(response),
            other => Err(RaftError::Internal {
                reason: format!("expected append-entries response, got {other:?}"),
            }),
        }
    }
}
