// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Clustered coordination between management nodes.
//!
//! Nodes share one store. Host ownership is a CAS on the host row; membership
//! is a heartbeat row per node. Nodes that do not own a host reach it through
//! the owner over the peer protocol.

pub mod handler;
pub mod peer;
pub mod scanner;
pub mod server;

pub use handler::{NOT_OWNER_CODE, PeerRequestHandler};
pub use peer::{LocalPeerNetwork, PeerChannel, PeerError, QuicPeerChannel, QuicPeerConfig};
pub use scanner::{OwnershipScanner, OwnershipScannerConfig, ScanReport};
pub use server::run_peer_server;

/// How a management node identifies itself to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: String,
    /// Address peers dial to reach this node.
    pub peer_addr: String,
}

impl NodeIdentity {
    pub fn new(node_id: impl Into<String>, peer_addr: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            peer_addr: peer_addr.into(),
        }
    }
}
