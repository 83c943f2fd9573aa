// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Determining whether a suspect host is really gone.
//!
//! Steps run in the configured order and the first definitive answer wins.
//! `Unknown` from a step moves on to the next one.

use std::time::Duration;

use chrono::Utc;
use cirrus_protocol::messages::{Command, Liveness};
use serde::Serialize;
use tracing::{debug, info};

use super::AgentManager;
use crate::fsm::HostEvent;
use crate::persistence::{HostRecord, liveness_cutoff};

/// Command sent to a neighbouring host's agent to check on another host.
pub const CHECK_HOST_COMMAND: &str = "check_host";

/// Answer code a neighbour uses to report the checked host as dead.
pub const HOST_DOWN_CODE: &str = "host_down";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvestigationStep {
    /// Ask the connector whether the host answers at all.
    Direct,
    /// Ask directly connected hosts in the same cluster.
    Neighbors,
    /// Ask live peer management nodes.
    Peers,
}

/// Ordered investigation steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvestigationPolicy {
    steps: Vec<InvestigationStep>,
}

impl InvestigationPolicy {
    pub fn new(steps: Vec<InvestigationStep>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[InvestigationStep] {
        &self.steps
    }
}

impl Default for InvestigationPolicy {
    fn default() -> Self {
        Self::new(vec![
            InvestigationStep::Direct,
            InvestigationStep::Neighbors,
            InvestigationStep::Peers,
        ])
    }
}

/// Verdict of an investigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostLiveness {
    /// Host and agent respond.
    Up,
    /// Host is dead.
    Down,
    /// Host is alive but its agent cannot be reached.
    Disconnected,
    Unknown,
}

impl HostLiveness {
    /// Host event recorded for this verdict.
    pub fn host_event(self) -> HostEvent {
        match self {
            Self::Up => HostEvent::Ping,
            Self::Down => HostEvent::HostDown,
            Self::Disconnected => HostEvent::AgentDisconnected,
            Self::Unknown => HostEvent::PingTimeout,
        }
    }

    pub fn to_wire(self) -> Liveness {
        match self {
            Self::Up => Liveness::Up,
            Self::Down => Liveness::Down,
            Self::Disconnected => Liveness::Disconnected,
            Self::Unknown => Liveness::Unknown,
        }
    }

    pub fn from_wire(liveness: Liveness) -> Self {
        match liveness {
            Liveness::Up => Self::Up,
            Liveness::Down => Self::Down,
            Liveness::Disconnected => Self::Disconnected,
            Liveness::Unknown => Self::Unknown,
        }
    }
}

#[derive(Serialize)]
struct CheckHost<'a> {
    host_id: i64,
    address: &'a str,
}

/// Runs an [`InvestigationPolicy`] against a host using the manager's
/// connector, neighbours and peers.
pub struct Investigator<'a> {
    manager: &'a AgentManager,
    policy: &'a InvestigationPolicy,
    timeout: Duration,
}

impl<'a> Investigator<'a> {
    pub fn new(manager: &'a AgentManager, policy: &'a InvestigationPolicy, timeout: Duration) -> Self {
        Self {
            manager,
            policy,
            timeout,
        }
    }

    pub async fn investigate(&self, host: &HostRecord) -> HostLiveness {
        for step in self.policy.steps() {
            let verdict = match step {
                InvestigationStep::Direct => self.manager.connector().reachability(host).await,
                InvestigationStep::Neighbors => self.ask_neighbors(host).await,
                InvestigationStep::Peers => self.ask_peers(host).await,
            };
            debug!(host_id = host.host_id, step = ?step, verdict = ?verdict, "Investigation step");
            if verdict != HostLiveness::Unknown {
                info!(host_id = host.host_id, step = ?step, verdict = ?verdict, "Investigation concluded");
                return verdict;
            }
        }
        info!(host_id = host.host_id, "Investigation inconclusive");
        HostLiveness::Unknown
    }

    async fn ask_neighbors(&self, host: &HostRecord) -> HostLiveness {
        let Some(cluster) = host.cluster.as_deref() else {
            return HostLiveness::Unknown;
        };
        let hosts = match self.manager.persistence().list_hosts().await {
            Ok(hosts) => hosts,
            Err(e) => {
                debug!(host_id = host.host_id, error = %e, "Cannot list neighbours");
                return HostLiveness::Unknown;
            }
        };
        let payload = match serde_json::to_vec(&CheckHost {
            host_id: host.host_id,
            address: &host.address,
        }) {
            Ok(p) => p,
            Err(_) => return HostLiveness::Unknown,
        };

        for neighbour in hosts
            .iter()
            .filter(|h| h.host_id != host.host_id && h.cluster.as_deref() == Some(cluster))
            .filter(|h| self.manager.has_ready_direct(h.host_id))
        {
            let answer = self
                .manager
                .send(
                    neighbour.host_id,
                    vec![Command::new(CHECK_HOST_COMMAND, payload.clone())],
                    self.timeout,
                )
                .await;
            match answer {
                Ok(answer) if answer.is_success() => return HostLiveness::Disconnected,
                Ok(answer) => {
                    if answer
                        .first_failure()
                        .is_some_and(|a| a.code == HOST_DOWN_CODE)
                    {
                        return HostLiveness::Down;
                    }
                }
                Err(e) => {
                    debug!(
                        host_id = host.host_id,
                        neighbour = neighbour.host_id,
                        error = %e,
                        "Neighbour check failed"
                    );
                }
            }
        }
        HostLiveness::Unknown
    }

    async fn ask_peers(&self, host: &HostRecord) -> HostLiveness {
        let Some(peers) = self.manager.peers() else {
            return HostLiveness::Unknown;
        };
        let nodes = match self.manager.persistence().list_nodes().await {
            Ok(nodes) => nodes,
            Err(_) => return HostLiveness::Unknown,
        };
        let cutoff = liveness_cutoff(Utc::now(), self.manager.node_timeout());
        for node in nodes
            .iter()
            .filter(|n| n.node_id != self.manager.node_id() && n.is_live(cutoff))
        {
            match peers.query_liveness(&node.node_id, host.host_id).await {
                Ok(liveness) => {
                    let verdict = HostLiveness::from_wire(liveness);
                    if verdict != HostLiveness::Unknown {
                        return verdict;
                    }
                }
                Err(e) => debug!(peer = %node.node_id, error = %e, "Peer liveness query failed"),
            }
        }
        HostLiveness::Unknown
    }
}
