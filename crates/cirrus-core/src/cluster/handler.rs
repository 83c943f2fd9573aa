// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Serving peer requests against the local agent manager.

use std::sync::{Arc, Weak};
use std::time::Duration;

use cirrus_protocol::messages::{ForwardRequest, PeerRequest, PeerResponse, peer_request};
use tracing::{debug, instrument};

use crate::agent::{AgentManager, AttacheMode};

/// Error code for a forward that reached a node without a direct connection.
pub const NOT_OWNER_CODE: &str = "NOT_OWNER";

/// Upper bound on the timeout a peer may ask for.
const MAX_FORWARD_TIMEOUT: Duration = Duration::from_secs(600);

/// Answers peer requests for one node.
pub struct PeerRequestHandler {
    manager: Weak<AgentManager>,
}

impl PeerRequestHandler {
    pub fn new(manager: &Arc<AgentManager>) -> Self {
        Self {
            manager: Arc::downgrade(manager),
        }
    }

    #[instrument(skip_all)]
    pub async fn handle(&self, request: PeerRequest) -> PeerResponse {
        let Some(manager) = self.manager.upgrade() else {
            return PeerResponse::error("UNAVAILABLE", "node is shutting down");
        };
        match request.request {
            Some(peer_request::Request::Forward(forward)) => handle_forward(&manager, forward).await,
            Some(peer_request::Request::Notify(notice)) => {
                manager.handle_peer_notice(notice).await;
                PeerResponse::ack()
            }
            Some(peer_request::Request::Liveness(query)) => {
                let liveness = manager.local_liveness(query.host_id);
                debug!(host_id = query.host_id, source = %query.source_node, liveness = ?liveness, "Peer liveness query");
                PeerResponse::liveness(liveness.to_wire())
            }
            None => PeerResponse::error("INVALID_REQUEST", "empty peer request"),
        }
    }
}

async fn handle_forward(manager: &AgentManager, forward: ForwardRequest) -> PeerResponse {
    let host_id = forward.host_id;
    let Some(request) = forward.request else {
        return PeerResponse::error("INVALID_REQUEST", "forward without agent request");
    };

    // Only the direct holder may run it; never forward twice.
    let direct = manager.attache(host_id).and_then(|a| match a.mode() {
        AttacheMode::Direct { link } => Some((a, link)),
        AttacheMode::Forward { .. } => None,
    });
    let Some((attache, link)) = direct else {
        debug!(host_id, source = %forward.source_node, "Forward rejected, not owner");
        return PeerResponse::error(
            NOT_OWNER_CODE,
            format!("node {} has no direct connection to host {}", manager.node_id(), host_id),
        );
    };

    let timeout = Duration::from_millis(forward.timeout_ms).min(MAX_FORWARD_TIMEOUT);
    debug!(host_id, source = %forward.source_node, commands = request.commands.len(), "Serving forwarded request");
    match manager
        .send_direct(&attache, link, request.commands, timeout)
        .await
    {
        Ok(answer) => PeerResponse::answer(answer),
        Err(e) => PeerResponse {
            response: Some(cirrus_protocol::messages::peer_response::Response::Error(
                e.to_rpc_error(),
            )),
        },
    }
}

