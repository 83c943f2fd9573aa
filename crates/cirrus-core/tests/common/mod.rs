// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for cirrus-core integration tests.
//!
//! Provides TestCluster: one in-memory SQLite store, one scripted agent
//! connector and one in-process peer network shared by any number of
//! simulated management nodes.

#![allow(dead_code)]

mod mock;

pub use mock::{MockBehavior, MockConnector};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use cirrus_core::agent::{AgentManager, AgentManagerConfig, InvestigationPolicy};
use cirrus_core::cluster::{
    LocalPeerNetwork, NodeIdentity, OwnershipScanner, OwnershipScannerConfig, PeerRequestHandler,
};
use cirrus_core::fsm::kinds::vm_machine;
use cirrus_core::fsm::{StateMachine, VmEvent, VmState};
use cirrus_core::jobs::vm::vm_handlers;
use cirrus_core::jobs::{JobDispatcher, JobDispatcherConfig};
use cirrus_core::persistence::{HostRecord, NewHost, Persistence, SqlitePersistence};

/// Shared store, agents and network for simulated nodes.
pub struct TestCluster {
    pub persistence: Arc<dyn Persistence>,
    /// The same store, for raw SQL.
    pub sqlite: SqlitePersistence,
    pub connector: MockConnector,
    pub network: Arc<LocalPeerNetwork>,
}

/// One simulated management node.
pub struct TestNode {
    pub node_id: String,
    pub manager: Arc<AgentManager>,
    pub scanner: OwnershipScanner,
    pub peer_handler: Arc<PeerRequestHandler>,
}

impl TestCluster {
    pub async fn new() -> Self {
        let persistence = SqlitePersistence::in_memory()
            .await
            .expect("Failed to open in-memory store");
        Self {
            sqlite: persistence.clone(),
            persistence: Arc::new(persistence),
            connector: MockConnector::new(),
            network: LocalPeerNetwork::new(),
        }
    }

    /// Register a host row. Nobody owns it yet.
    pub async fn add_host(&self, host_id: i64, cluster: Option<&str>) -> HostRecord {
        self.persistence
            .register_host(&NewHost {
                host_id,
                name: format!("host-{}", host_id),
                address: format!("10.0.0.{}:8260", host_id),
                cluster: cluster.map(str::to_string),
            })
            .await
            .expect("Failed to register host")
    }

    pub async fn host(&self, host_id: i64) -> HostRecord {
        self.persistence
            .get_host(host_id)
            .await
            .unwrap()
            .expect("host should exist")
    }

    /// Start a node with fast timers, reachable on the local peer network.
    pub async fn node(&self, node_id: &str) -> TestNode {
        self.node_with(node_id, InvestigationPolicy::default()).await
    }

    pub async fn node_with(&self, node_id: &str, investigation: InvestigationPolicy) -> TestNode {
        let manager = AgentManager::builder(
            node_id,
            self.persistence.clone(),
            Arc::new(self.connector.clone()),
        )
        .peers(self.network.channel(node_id))
        .config(AgentManagerConfig {
            reconnect_delay: Duration::from_millis(50),
            investigation_timeout: Duration::from_millis(200),
            node_timeout: Duration::from_secs(30),
            forward_grace: Duration::from_millis(500),
            investigation,
        })
        .build()
        .expect("Failed to build agent manager");

        let peer_handler = Arc::new(PeerRequestHandler::new(&manager));
        self.network.register(node_id, peer_handler.clone());

        let scanner = OwnershipScanner::new(
            NodeIdentity::new(node_id, format!("local://{}", node_id)),
            manager.clone(),
            OwnershipScannerConfig {
                scan_interval: Duration::from_millis(100),
                batch_size: 16,
                node_timeout: Duration::from_secs(30),
            },
        );
        scanner.register().await.expect("Failed to register node");

        TestNode {
            node_id: node_id.to_string(),
            manager,
            scanner,
            peer_handler,
        }
    }

    /// Simulate a crashed node: it drops off the network and its heartbeat
    /// is old enough for every other node to consider it dead.
    pub async fn crash(&self, node: &TestNode) {
        self.network.kill(&node.node_id);
        self.persistence
            .upsert_node(
                &node.node_id,
                &format!("local://{}", node.node_id),
                Utc::now() - chrono::Duration::minutes(10),
            )
            .await
            .unwrap();
    }

    pub fn vm_machine(&self) -> Arc<StateMachine<VmState, VmEvent>> {
        Arc::new(vm_machine().build().expect("vm machine is deterministic"))
    }

    /// Job dispatcher with the VM handlers for `node`.
    pub fn dispatcher(
        &self,
        node: &TestNode,
        vm: Arc<StateMachine<VmState, VmEvent>>,
    ) -> Arc<JobDispatcher> {
        JobDispatcher::builder(&node.node_id, self.persistence.clone(), node.manager.clone())
            .handlers(vm_handlers(vm))
            .config(JobDispatcherConfig {
                max_workers: 4,
                poll_interval: Duration::from_millis(20),
                recovery_interval: Duration::from_secs(3600),
                node_timeout: Duration::from_secs(30),
            })
            .build()
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Scanner pass that must succeed.
pub async fn scan(node: &TestNode) -> cirrus_core::cluster::ScanReport {
    node.scanner.scan_once().await.expect("scan failed")
}

/// Poll the host status resource until it reaches `want`.
pub async fn wait_for_host_status(
    node: &TestNode,
    host_id: i64,
    want: cirrus_core::fsm::HostStatus,
) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if let Ok(status) = node.manager.host_status(host_id).await
            && status.state == want
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
