// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that pings directly connected hosts.
//!
//! A ping that fails or times out escalates to an investigated disconnect
//! through [`AgentManager::ping`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::AgentManager;

/// Configuration for the ping monitor.
#[derive(Debug, Clone)]
pub struct PingMonitorConfig {
    pub ping_interval: Duration,
    /// How long one ping may wait for its answer.
    pub ping_timeout: Duration,
    /// Cap on pings outstanding at the same time.
    pub max_concurrent_pings: usize,
}

impl Default for PingMonitorConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(30),
            max_concurrent_pings: 50,
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PingReport {
    pub healthy: Vec<i64>,
    pub failed: Vec<i64>,
}

/// Periodic liveness checks for one node's direct connections.
pub struct PingMonitor {
    manager: Arc<AgentManager>,
    config: PingMonitorConfig,
    permits: Arc<Semaphore>,
    shutdown: Arc<Notify>,
}

impl PingMonitor {
    pub fn new(manager: Arc<AgentManager>, config: PingMonitorConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_pings.max(1)));
        Self {
            manager,
            config,
            permits,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(&self) {
        info!(
            ping_interval_secs = self.config.ping_interval.as_secs(),
            ping_timeout_secs = self.config.ping_timeout.as_secs(),
            max_concurrent_pings = self.config.max_concurrent_pings,
            "Ping monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Ping monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.ping_interval) => {
                    let report = self.ping_all().await;
                    if !report.failed.is_empty() {
                        info!(failed = ?report.failed, healthy = report.healthy.len(), "Ping sweep found failures");
                    }
                }
            }
        }

        info!("Ping monitor stopped");
    }

    /// Ping every ready direct host once.
    pub async fn ping_all(&self) -> PingReport {
        let hosts: Vec<i64> = self
            .manager
            .direct_hosts()
            .into_iter()
            .filter(|h| self.manager.has_ready_direct(*h))
            .collect();
        debug!(count = hosts.len(), "Pinging hosts");

        let mut pings = JoinSet::new();
        for host_id in hosts {
            let manager = self.manager.clone();
            let permits = self.permits.clone();
            let timeout = self.config.ping_timeout;
            pings.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (host_id, false);
                };
                (host_id, manager.ping(host_id, timeout).await.is_ok())
            });
        }

        let mut report = PingReport::default();
        while let Some(joined) = pings.join_next().await {
            match joined {
                Ok((host_id, true)) => report.healthy.push(host_id),
                Ok((host_id, false)) => report.failed.push(host_id),
                Err(e) => error!(error = %e, "Ping task panicked"),
            }
        }
        report.healthy.sort_unstable();
        report.failed.sort_unstable();
        report
    }
}
