// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cirrus Protocol - QUIC + Protobuf communication layer
//!
//! This crate provides the wire protocol for two links:
//! - Management node to host agent (agent protocol)
//! - Management node to management node (peer protocol)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    cirrus-protocol                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: length + kind header, one frame per message       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn)                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Agent protocol
//!
//! A node opens one long-lived stream per host and sends a [`messages::NodeHello`]
//! followed by [`messages::AgentRequest`]s, each carrying a per-host sequence
//! number. The agent replies with [`messages::AgentMessage`]s: a startup
//! announcement first, then answers echoing the sequence, and optionally a
//! shutdown notice.
//!
//! # Peer protocol
//!
//! Management nodes call each other with one [`messages::PeerRequest`] per
//! stream: forwarding agent requests to the owning node, notifying host state
//! changes, and probing host liveness during investigation.
//!
//! ```ignore
//! use cirrus_protocol::{CirrusClient, CirrusClientConfig, messages};
//!
//! let client = CirrusClient::new(CirrusClientConfig::insecure(peer_addr))?;
//! let request = messages::PeerRequest::liveness(messages::LivenessQuery {
//!     source_node: "node-a".into(),
//!     host_id: 42,
//! });
//! let response: messages::PeerResponse = client.request(&request).await?;
//! ```

pub mod client;
pub mod frame;
pub mod messages;
pub mod server;

pub use client::{CirrusClient, CirrusClientConfig, ClientError};
pub use frame::{Frame, FrameError, FramedStream, MessageType};
pub use server::{CirrusServer, CirrusServerConfig, ConnectionHandler, ServerError, StreamHandler};
