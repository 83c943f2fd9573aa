// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf messages for the agent and peer protocols.
//!
//! Agent protocol (one long-lived stream per host):
//! - node → agent: [`NodeMessage`] (`Hello` once, then `Request`s)
//! - agent → node: [`AgentMessage`] (`Startup` once, then `Answer`s, optional `Shutdown`)
//!
//! Peer protocol (one stream per call between management nodes):
//! - [`PeerRequest`] → [`PeerResponse`]

use prost::{Enumeration, Message};

// ============================================================================
// Agent protocol
// ============================================================================

/// Sent by a management node right after opening the agent stream.
#[derive(Clone, PartialEq, Message)]
pub struct NodeHello {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(int64, tag = "2")]
    pub host_id: i64,
}

/// A single command for a host agent. The payload is opaque to the control plane.
#[derive(Clone, PartialEq, Message)]
pub struct Command {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

impl Command {
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Liveness check understood by every agent.
    pub fn ping() -> Self {
        Self::new(PING_COMMAND, Vec::new())
    }
}

/// Name of the liveness check command.
pub const PING_COMMAND: &str = "ping";

/// A batch of commands sharing one sequence number.
#[derive(Clone, PartialEq, Message)]
pub struct AgentRequest {
    #[prost(int64, tag = "1")]
    pub host_id: i64,
    #[prost(uint64, tag = "2")]
    pub sequence: u64,
    #[prost(message, repeated, tag = "3")]
    pub commands: Vec<Command>,
    /// Agent stops executing the batch at the first failed command.
    #[prost(bool, tag = "4")]
    pub stop_on_error: bool,
}

/// Result of one command.
#[derive(Clone, PartialEq, Message)]
pub struct Answer {
    #[prost(string, tag = "1")]
    pub command: String,
    #[prost(bool, tag = "2")]
    pub result: bool,
    #[prost(string, tag = "3")]
    pub details: String,
    /// Machine-readable failure code (empty on success), e.g. `insufficient_capacity`.
    #[prost(string, tag = "4")]
    pub code: String,
    #[prost(bytes = "vec", tag = "5")]
    pub payload: Vec<u8>,
}

impl Answer {
    pub fn success(command: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            command: command.into(),
            result: true,
            details: String::new(),
            code: String::new(),
            payload,
        }
    }

    pub fn failure(
        command: impl Into<String>,
        code: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            result: false,
            details: details.into(),
            code: code.into(),
            payload: Vec::new(),
        }
    }
}

/// All answers for one sequence number.
#[derive(Clone, PartialEq, Message)]
pub struct AgentAnswer {
    #[prost(int64, tag = "1")]
    pub host_id: i64,
    #[prost(uint64, tag = "2")]
    pub sequence: u64,
    #[prost(message, repeated, tag = "3")]
    pub answers: Vec<Answer>,
}

impl AgentAnswer {
    /// True when every command in the batch succeeded.
    pub fn is_success(&self) -> bool {
        !self.answers.is_empty() && self.answers.iter().all(|a| a.result)
    }

    /// First failed answer, if any.
    pub fn first_failure(&self) -> Option<&Answer> {
        self.answers.iter().find(|a| !a.result)
    }
}

/// Agent self-description sent once the stream is up.
#[derive(Clone, PartialEq, Message)]
pub struct StartupInfo {
    #[prost(int64, tag = "1")]
    pub host_id: i64,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub version: String,
    #[prost(string, repeated, tag = "4")]
    pub capabilities: Vec<String>,
}

/// Agent is going away on purpose.
#[derive(Clone, PartialEq, Message)]
pub struct ShutdownNotice {
    #[prost(int64, tag = "1")]
    pub host_id: i64,
    #[prost(string, tag = "2")]
    pub reason: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeMessage {
    #[prost(oneof = "node_message::Kind", tags = "1, 2")]
    pub kind: Option<node_message::Kind>,
}

pub mod node_message {
    use prost::Oneof;

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Hello(super::NodeHello),
        #[prost(message, tag = "2")]
        Request(super::AgentRequest),
    }
}

impl NodeMessage {
    pub fn hello(node_id: impl Into<String>, host_id: i64) -> Self {
        Self {
            kind: Some(node_message::Kind::Hello(NodeHello {
                node_id: node_id.into(),
                host_id,
            })),
        }
    }

    pub fn request(request: AgentRequest) -> Self {
        Self {
            kind: Some(node_message::Kind::Request(request)),
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct AgentMessage {
    #[prost(oneof = "agent_message::Kind", tags = "1, 2, 3")]
    pub kind: Option<agent_message::Kind>,
}

pub mod agent_message {
    use prost::Oneof;

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Startup(super::StartupInfo),
        #[prost(message, tag = "2")]
        Answer(super::AgentAnswer),
        #[prost(message, tag = "3")]
        Shutdown(super::ShutdownNotice),
    }
}

impl AgentMessage {
    pub fn startup(info: StartupInfo) -> Self {
        Self {
            kind: Some(agent_message::Kind::Startup(info)),
        }
    }

    pub fn answer(answer: AgentAnswer) -> Self {
        Self {
            kind: Some(agent_message::Kind::Answer(answer)),
        }
    }

    pub fn shutdown(host_id: i64, reason: impl Into<String>) -> Self {
        Self {
            kind: Some(agent_message::Kind::Shutdown(ShutdownNotice {
                host_id,
                reason: reason.into(),
            })),
        }
    }
}

// ============================================================================
// Peer protocol
// ============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct RpcError {
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(string, tag = "2")]
    pub message: String,
    /// Structured error body, JSON encoded by the sender when it has one.
    #[prost(string, tag = "3")]
    pub details: String,
}

/// Relay of an agent request to the node holding the direct connection.
#[derive(Clone, PartialEq, Message)]
pub struct ForwardRequest {
    #[prost(string, tag = "1")]
    pub source_node: String,
    #[prost(int64, tag = "2")]
    pub host_id: i64,
    #[prost(message, optional, tag = "3")]
    pub request: Option<AgentRequest>,
    #[prost(uint64, tag = "4")]
    pub timeout_ms: u64,
}

/// What happened to a host on the sending node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum HostNoticeKind {
    Unspecified = 0,
    /// Owner lost the agent connection.
    Disconnected = 1,
    /// Owner gave up ownership (shutdown, rebalance).
    Released = 2,
    /// Sender now holds the direct connection.
    Claimed = 3,
}

#[derive(Clone, PartialEq, Message)]
pub struct HostNotice {
    #[prost(string, tag = "1")]
    pub source_node: String,
    #[prost(int64, tag = "2")]
    pub host_id: i64,
    #[prost(enumeration = "HostNoticeKind", tag = "3")]
    pub kind: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct LivenessQuery {
    #[prost(string, tag = "1")]
    pub source_node: String,
    #[prost(int64, tag = "2")]
    pub host_id: i64,
}

/// Liveness as seen by the answering node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum Liveness {
    Unknown = 0,
    Up = 1,
    Down = 2,
    Disconnected = 3,
}

#[derive(Clone, PartialEq, Message)]
pub struct LivenessReport {
    #[prost(enumeration = "Liveness", tag = "1")]
    pub liveness: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Ack {}

#[derive(Clone, PartialEq, Message)]
pub struct PeerRequest {
    #[prost(oneof = "peer_request::Request", tags = "1, 2, 3")]
    pub request: Option<peer_request::Request>,
}

pub mod peer_request {
    use prost::Oneof;

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        Forward(super::ForwardRequest),
        #[prost(message, tag = "2")]
        Notify(super::HostNotice),
        #[prost(message, tag = "3")]
        Liveness(super::LivenessQuery),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct PeerResponse {
    #[prost(oneof = "peer_response::Response", tags = "1, 2, 3, 4")]
    pub response: Option<peer_response::Response>,
}

pub mod peer_response {
    use prost::Oneof;

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Response {
        #[prost(message, tag = "1")]
        Answer(super::AgentAnswer),
        #[prost(message, tag = "2")]
        Ack(super::Ack),
        #[prost(message, tag = "3")]
        Liveness(super::LivenessReport),
        #[prost(message, tag = "4")]
        Error(super::RpcError),
    }
}

impl PeerRequest {
    pub fn forward(forward: ForwardRequest) -> Self {
        Self {
            request: Some(peer_request::Request::Forward(forward)),
        }
    }

    pub fn notify(source_node: impl Into<String>, host_id: i64, kind: HostNoticeKind) -> Self {
        Self {
            request: Some(peer_request::Request::Notify(HostNotice {
                source_node: source_node.into(),
                host_id,
                kind: kind as i32,
            })),
        }
    }

    pub fn liveness(query: LivenessQuery) -> Self {
        Self {
            request: Some(peer_request::Request::Liveness(query)),
        }
    }
}

impl PeerResponse {
    pub fn answer(answer: AgentAnswer) -> Self {
        Self {
            response: Some(peer_response::Response::Answer(answer)),
        }
    }

    pub fn ack() -> Self {
        Self {
            response: Some(peer_response::Response::Ack(Ack {})),
        }
    }

    pub fn liveness(liveness: Liveness) -> Self {
        Self {
            response: Some(peer_response::Response::Liveness(LivenessReport {
                liveness: liveness as i32,
            })),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            response: Some(peer_response::Response::Error(RpcError {
                code: code.into(),
                message: message.into(),
                details: String::new(),
            })),
        }
    }
}
