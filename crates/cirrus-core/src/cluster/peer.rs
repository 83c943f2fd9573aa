// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node to node calls.
//!
//! [`PeerChannel`] is how an agent manager reaches other management nodes:
//! forwarding agent requests to a host's owner, broadcasting host notices and
//! asking for liveness during investigation. [`QuicPeerChannel`] speaks the peer
//! protocol over QUIC; [`LocalPeerNetwork`] wires several in-process nodes
//! together.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use cirrus_protocol::messages::{
    AgentAnswer, ForwardRequest, HostNotice, Liveness, PeerRequest, PeerResponse,
    LivenessQuery, peer_response,
};
use cirrus_protocol::{CirrusClient, CirrusClientConfig, ClientError};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::handler::{NOT_OWNER_CODE, PeerRequestHandler};
use crate::error::{CoreError, duration_ms};
use crate::persistence::Persistence;

/// Failure of a peer call.
#[derive(Debug, Clone, Error)]
pub enum PeerError {
    /// The peer could not be reached or dropped the call.
    #[error("peer {node_id} unreachable: {reason}")]
    Unreachable { node_id: String, reason: String },

    /// The peer does not hold a direct connection to the host.
    #[error("peer {node_id} does not own host {host_id}")]
    NotOwner { node_id: String, host_id: i64 },

    /// The peer handled the call and reported this error.
    #[error(transparent)]
    Remote(CoreError),
}

impl PeerError {
    fn unreachable(node_id: &str, reason: impl std::fmt::Display) -> Self {
        Self::Unreachable {
            node_id: node_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Outbound calls to other management nodes.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Run an agent request on the node that owns the host.
    async fn forward(&self, node_id: &str, request: ForwardRequest) -> Result<AgentAnswer, PeerError>;

    async fn notify(&self, node_id: &str, notice: HostNotice) -> Result<(), PeerError>;

    /// How `node_id` currently sees `host_id`.
    async fn query_liveness(&self, node_id: &str, host_id: i64) -> Result<Liveness, PeerError>;
}

fn unexpected(node_id: &str, response: Option<peer_response::Response>) -> PeerError {
    PeerError::Remote(CoreError::Protocol {
        message: format!("unexpected response from peer {}: {:?}", node_id, response),
    })
}

/// Map a peer-level error body.
fn remote_error(node_id: &str, host_id: i64, code: &str, message: &str, details: &str) -> PeerError {
    if code == NOT_OWNER_CODE {
        return PeerError::NotOwner {
            node_id: node_id.to_string(),
            host_id,
        };
    }
    PeerError::Remote(CoreError::from_rpc_error(code, message, details))
}

fn expect_answer(node_id: &str, host_id: i64, response: PeerResponse) -> Result<AgentAnswer, PeerError> {
    match response.response {
        Some(peer_response::Response::Answer(answer)) => Ok(answer),
        Some(peer_response::Response::Error(e)) => {
            Err(remote_error(node_id, host_id, &e.code, &e.message, &e.details))
        }
        other => Err(unexpected(node_id, other)),
    }
}

fn expect_ack(node_id: &str, host_id: i64, response: PeerResponse) -> Result<(), PeerError> {
    match response.response {
        Some(peer_response::Response::Ack(_)) => Ok(()),
        Some(peer_response::Response::Error(e)) => {
            Err(remote_error(node_id, host_id, &e.code, &e.message, &e.details))
        }
        other => Err(unexpected(node_id, other)),
    }
}

fn expect_liveness(node_id: &str, host_id: i64, response: PeerResponse) -> Result<Liveness, PeerError> {
    match response.response {
        Some(peer_response::Response::Liveness(p)) => {
            Ok(Liveness::try_from(p.liveness).unwrap_or(Liveness::Unknown))
        }
        Some(peer_response::Response::Error(e)) => {
            Err(remote_error(node_id, host_id, &e.code, &e.message, &e.details))
        }
        other => Err(unexpected(node_id, other)),
    }
}

// ============================================================================
// QUIC
// ============================================================================

/// Settings for [`QuicPeerChannel`].
#[derive(Debug, Clone)]
pub struct QuicPeerConfig {
    pub server_name: String,
    pub skip_cert_verification: bool,
    pub connect_timeout: Duration,
}

impl Default for QuicPeerConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            skip_cert_verification: false,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Peer calls over QUIC. Peer addresses come from the node registry; one
/// client per peer is kept and dropped after a transport failure.
pub struct QuicPeerChannel {
    persistence: Arc<dyn Persistence>,
    config: QuicPeerConfig,
    clients: tokio::sync::Mutex<HashMap<String, (SocketAddr, Arc<CirrusClient>)>>,
}

impl QuicPeerChannel {
    pub fn new(persistence: Arc<dyn Persistence>, config: QuicPeerConfig) -> Self {
        Self {
            persistence,
            config,
            clients: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, node_id: &str) -> Result<Arc<CirrusClient>, PeerError> {
        let node = self
            .persistence
            .get_node(node_id)
            .await
            .map_err(|e| PeerError::unreachable(node_id, e))?
            .ok_or_else(|| PeerError::unreachable(node_id, "unknown node"))?;
        let addr: SocketAddr = node
            .peer_addr
            .parse()
            .map_err(|_| PeerError::unreachable(node_id, format!("invalid peer address '{}'", node.peer_addr)))?;

        let mut clients = self.clients.lock().await;
        if let Some((cached_addr, client)) = clients.get(node_id)
            && *cached_addr == addr
        {
            return Ok(client.clone());
        }

        let client = Arc::new(
            CirrusClient::new(CirrusClientConfig {
                server_addr: addr,
                server_name: self.config.server_name.clone(),
                dangerous_skip_cert_verification: self.config.skip_cert_verification,
                connect_timeout_ms: duration_ms(self.config.connect_timeout),
                ..Default::default()
            })
            .map_err(|e| PeerError::unreachable(node_id, e))?,
        );
        clients.insert(node_id.to_string(), (addr, client.clone()));
        Ok(client)
    }

    async fn call(&self, node_id: &str, host_id: i64, request: PeerRequest) -> Result<PeerResponse, PeerError> {
        let client = self.client(node_id).await?;
        match client.request::<PeerRequest, PeerResponse>(&request).await {
            Ok(response) => Ok(response),
            Err(ClientError::Remote {
                code,
                message,
                details,
            }) => Err(remote_error(node_id, host_id, &code, &message, &details)),
            Err(e) => {
                warn!(peer = %node_id, error = %e, "Peer call failed");
                self.clients.lock().await.remove(node_id);
                client.close().await;
                Err(PeerError::unreachable(node_id, e))
            }
        }
    }
}

#[async_trait]
impl PeerChannel for QuicPeerChannel {
    async fn forward(&self, node_id: &str, request: ForwardRequest) -> Result<AgentAnswer, PeerError> {
        let host_id = request.host_id;
        let response = self.call(node_id, host_id, PeerRequest::forward(request)).await?;
        expect_answer(node_id, host_id, response)
    }

    async fn notify(&self, node_id: &str, notice: HostNotice) -> Result<(), PeerError> {
        let host_id = notice.host_id;
        let request = PeerRequest {
            request: Some(cirrus_protocol::messages::peer_request::Request::Notify(notice)),
        };
        let response = self.call(node_id, host_id, request).await?;
        expect_ack(node_id, host_id, response)
    }

    async fn query_liveness(&self, node_id: &str, host_id: i64) -> Result<Liveness, PeerError> {
        let request = PeerRequest::liveness(LivenessQuery {
            source_node: String::new(),
            host_id,
        });
        let response = self.call(node_id, host_id, request).await?;
        expect_liveness(node_id, host_id, response)
    }
}

// ============================================================================
// In-process
// ============================================================================

struct LocalPeer {
    handler: Arc<PeerRequestHandler>,
    killed: Arc<Notify>,
}

/// Registry of in-process nodes for embedding and tests.
///
/// A killed node stops answering; calls already in flight to it fail with
/// [`PeerError::Unreachable`].
#[derive(Default)]
pub struct LocalPeerNetwork {
    peers: Mutex<HashMap<String, LocalPeer>>,
}

impl LocalPeerNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LocalPeer>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `handler` reachable as `node_id`, replacing any previous one.
    pub fn register(&self, node_id: impl Into<String>, handler: Arc<PeerRequestHandler>) {
        self.lock().insert(
            node_id.into(),
            LocalPeer {
                handler,
                killed: Arc::new(Notify::new()),
            },
        );
    }

    /// Cut `node_id` off the network.
    pub fn kill(&self, node_id: &str) {
        if let Some(peer) = self.lock().remove(node_id) {
            peer.killed.notify_waiters();
            debug!(node_id, "Local peer killed");
        }
    }

    pub fn is_reachable(&self, node_id: &str) -> bool {
        self.lock().contains_key(node_id)
    }

    /// Channel used by `source_node` to call the others.
    pub fn channel(self: &Arc<Self>, source_node: impl Into<String>) -> Arc<dyn PeerChannel> {
        Arc::new(LocalPeerChannel {
            network: self.clone(),
            source_node: source_node.into(),
        })
    }

    async fn call(&self, node_id: &str, request: PeerRequest) -> Result<PeerResponse, PeerError> {
        let (handler, killed) = {
            let peers = self.lock();
            let peer = peers
                .get(node_id)
                .ok_or_else(|| PeerError::unreachable(node_id, "connection refused"))?;
            (peer.handler.clone(), peer.killed.clone())
        };
        tokio::select! {
            response = handler.handle(request) => Ok(response),
            _ = killed.notified() => Err(PeerError::unreachable(node_id, "connection lost")),
        }
    }
}

struct LocalPeerChannel {
    network: Arc<LocalPeerNetwork>,
    source_node: String,
}

impl LocalPeerChannel {
    fn check_source(&self) -> Result<(), PeerError> {
        // A killed node cannot reach anyone either.
        if self.network.is_reachable(&self.source_node) {
            Ok(())
        } else {
            Err(PeerError::unreachable(&self.source_node, "network is down"))
        }
    }
}

#[async_trait]
impl PeerChannel for LocalPeerChannel {
    async fn forward(&self, node_id: &str, request: ForwardRequest) -> Result<AgentAnswer, PeerError> {
        self.check_source()?;
        let host_id = request.host_id;
        let response = self.network.call(node_id, PeerRequest::forward(request)).await?;
        expect_answer(node_id, host_id, response)
    }

    async fn notify(&self, node_id: &str, notice: HostNotice) -> Result<(), PeerError> {
        self.check_source()?;
        let host_id = notice.host_id;
        let request = PeerRequest {
            request: Some(cirrus_protocol::messages::peer_request::Request::Notify(notice)),
        };
        let response = self.network.call(node_id, request).await?;
        expect_ack(node_id, host_id, response)
    }

    async fn query_liveness(&self, node_id: &str, host_id: i64) -> Result<Liveness, PeerError> {
        self.check_source()?;
        let request = PeerRequest::liveness(LivenessQuery {
            source_node: self.source_node.clone(),
            host_id,
        });
        let response = self.network.call(node_id, request).await?;
        expect_liveness(node_id, host_id, response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_protocol::messages::RpcError;

    #[test]
    fn test_not_owner_code_maps_to_not_owner() {
        let response = PeerResponse {
            response: Some(peer_response::Response::Error(RpcError {
                code: NOT_OWNER_CODE.to_string(),
                message: "no direct connection".to_string(),
                details: String::new(),
            })),
        };
        let err = expect_answer("node-b", 7, response).unwrap_err();
        assert!(matches!(err, PeerError::NotOwner { host_id: 7, .. }));
    }

    #[test]
    fn test_remote_error_keeps_variant() {
        let original = CoreError::OperationTimedOut {
            host_id: 7,
            timeout_ms: 500,
        };
        let rpc = original.to_rpc_error();
        let response = PeerResponse {
            response: Some(peer_response::Response::Error(rpc)),
        };
        match expect_answer("node-b", 7, response).unwrap_err() {
            PeerError::Remote(e) => assert_eq!(e, original),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_liveness_value_is_unknown() {
        let response = PeerResponse::liveness(Liveness::Down);
        assert_eq!(expect_liveness("n", 1, response).unwrap(), Liveness::Down);

        let bogus = PeerResponse {
            response: Some(peer_response::Response::Liveness(
                cirrus_protocol::messages::LivenessReport { liveness: 42 },
            )),
        };
        assert_eq!(expect_liveness("n", 1, bogus).unwrap(), Liveness::Unknown);
    }

    #[tokio::test]
    async fn test_unregistered_peer_is_unreachable() {
        let network = LocalPeerNetwork::new();
        let err = network
            .call("ghost", PeerRequest::liveness(LivenessQuery::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Unreachable { .. }));
    }
}
