// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent connection layer.
//!
//! A management node holds one [`Attache`] per host it talks to. The owner of a
//! host holds the direct transport; every other node forwards through the owner.
//! Requests carry per-attache sequence numbers and answers are correlated back
//! to the waiting caller by sequence, in any order.

pub mod attache;
pub mod investigator;
pub mod link;
pub mod listeners;
pub mod manager;
pub mod monitor;

pub use attache::{Attache, AttacheMode, PendingRequest};
pub use investigator::{
    CHECK_HOST_COMMAND, HOST_DOWN_CODE, HostLiveness, InvestigationPolicy, InvestigationStep,
    Investigator,
};
pub use link::{
    AgentConnector, AgentEvent, AgentLink, AgentSession, QuicAgentConnector,
    QuicAgentConnectorConfig, QuicAgentLink,
};
pub use listeners::{AnswerListener, ConnectionFailure, HostEventMask, HostListener, ListenerId};
pub use manager::{AgentManager, AgentManagerBuilder, AgentManagerConfig};
pub use monitor::{PingMonitor, PingMonitorConfig, PingReport};
