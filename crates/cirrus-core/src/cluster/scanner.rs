// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that keeps this node's share of hosts connected.
//!
//! Each scan heartbeats the node, retires peers that stopped heartbeating,
//! claims hosts nobody live owns, and reconciles the agent manager's direct
//! connections with what the store says this node owns. Ownership itself is
//! only ever changed through the store's `owner_version` CAS.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::NodeIdentity;
use crate::agent::AgentManager;
use crate::error::CoreError;
use crate::persistence::{Persistence, liveness_cutoff};

/// Configuration for the ownership scanner.
///
/// `node_timeout` should span several scan intervals so a single slow scan
/// does not let peers take over this node's hosts.
#[derive(Debug, Clone)]
pub struct OwnershipScannerConfig {
    pub scan_interval: Duration,
    /// Hosts claimed per scan.
    pub batch_size: u32,
    /// Heartbeat age after which a node is considered dead.
    pub node_timeout: Duration,
}

impl Default for OwnershipScannerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            batch_size: 16,
            node_timeout: Duration::from_secs(60),
        }
    }
}

/// What one scan changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Peers newly marked down.
    pub expired_nodes: Vec<String>,
    /// Hosts whose ownership this scan acquired.
    pub claimed: Vec<i64>,
    /// Hosts a direct connection was established to.
    pub connected: Vec<i64>,
    /// Direct connections dropped because the host is owned elsewhere.
    pub relinquished: Vec<i64>,
}

/// Periodic ownership scan for one node.
pub struct OwnershipScanner {
    identity: NodeIdentity,
    manager: Arc<AgentManager>,
    persistence: Arc<dyn Persistence>,
    config: OwnershipScannerConfig,
    shutdown: Arc<Notify>,
}

impl OwnershipScanner {
    pub fn new(identity: NodeIdentity, manager: Arc<AgentManager>, config: OwnershipScannerConfig) -> Self {
        let persistence = manager.persistence().clone();
        Self {
            identity,
            manager,
            persistence,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Add this node to the membership table with a fresh heartbeat.
    pub async fn register(&self) -> Result<(), CoreError> {
        self.persistence
            .upsert_node(&self.identity.node_id, &self.identity.peer_addr, Utc::now())
            .await?;
        info!(node_id = %self.identity.node_id, peer_addr = %self.identity.peer_addr, "Node registered");
        Ok(())
    }

    /// Run the scan loop until shutdown, then release every owned host and
    /// mark this node down.
    pub async fn run(&self) {
        info!(
            node_id = %self.identity.node_id,
            scan_interval_secs = self.config.scan_interval.as_secs(),
            node_timeout_secs = self.config.node_timeout.as_secs(),
            "Ownership scanner started"
        );

        if let Err(e) = self.register().await {
            error!(error = %e, "Failed to register node");
        }

        let wake = self.manager.scan_wake();
        loop {
            if let Err(e) = self.scan_once().await {
                error!(error = %e, "Ownership scan failed");
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Ownership scanner received shutdown signal");
                    break;
                }

                _ = wake.notified() => {
                    debug!("Ownership scan requested early");
                }

                _ = tokio::time::sleep(self.config.scan_interval) => {}
            }
        }

        self.release().await;
        info!("Ownership scanner stopped");
    }

    /// One pass over membership and ownership.
    pub async fn scan_once(&self) -> Result<ScanReport, CoreError> {
        let node_id = self.identity.node_id.as_str();
        let now = Utc::now();
        let mut report = ScanReport::default();

        if !self.persistence.heartbeat_node(node_id, now).await? {
            self.persistence
                .upsert_node(node_id, &self.identity.peer_addr, now)
                .await?;
        }

        let cutoff = liveness_cutoff(now, self.config.node_timeout);
        report.expired_nodes = self
            .persistence
            .mark_expired_nodes_down(cutoff, node_id)
            .await?;
        for expired in &report.expired_nodes {
            let dropped = self.manager.drop_forwarding_for_node(expired);
            warn!(peer = %expired, forwarding_dropped = dropped.len(), "Peer node expired");
        }

        if self.manager.is_closing() {
            return Ok(report);
        }

        let claimed = self
            .persistence
            .claim_hosts(node_id, cutoff, self.config.batch_size)
            .await?;
        report.claimed = claimed.iter().map(|h| h.host_id).collect();
        if !report.claimed.is_empty() {
            info!(count = report.claimed.len(), hosts = ?report.claimed, "Claimed hosts");
        }

        let owned = self.persistence.list_owned_hosts(node_id).await?;
        let owned_ids: HashSet<i64> = owned.iter().map(|h| h.host_id).collect();

        let mut connects = JoinSet::new();
        for host in owned
            .into_iter()
            .filter(|h| !self.manager.has_direct(h.host_id))
        {
            let manager = self.manager.clone();
            connects.spawn(async move {
                let host_id = host.host_id;
                (host_id, manager.connect_host(&host).await)
            });
        }
        while let Some(joined) = connects.join_next().await {
            match joined {
                Ok((host_id, Ok(_))) => report.connected.push(host_id),
                Ok((host_id, Err(e))) => {
                    debug!(host_id, error = %e, "Owned host not connected yet");
                }
                Err(e) => error!(error = %e, "Connect task panicked"),
            }
        }
        report.connected.sort_unstable();

        for host_id in self.manager.direct_hosts() {
            if !owned_ids.contains(&host_id) && self.manager.relinquish(host_id).await {
                warn!(host_id, "Host owned elsewhere, direct connection dropped");
                report.relinquished.push(host_id);
            }
        }

        Ok(report)
    }

    /// Give up every owned host and leave the membership table.
    pub async fn release(&self) {
        let released = self.manager.release_all().await;
        if let Err(e) = self.persistence.mark_node_down(&self.identity.node_id).await {
            warn!(error = %e, "Failed to mark node down");
        }
        info!(released = released.len(), "Node left the cluster");
    }
}
