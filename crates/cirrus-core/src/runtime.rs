// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for one management node.
//!
//! [`NodeRuntime`] wires the agent manager, the ownership scanner, the ping
//! monitor, the job dispatcher and (optionally) the peer QUIC server around a
//! shared store, so a node can run inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cirrus_core::agent::{QuicAgentConnector, QuicAgentConnectorConfig};
//! use cirrus_core::cluster::{NodeIdentity, QuicPeerChannel, QuicPeerConfig};
//! use cirrus_core::persistence::PostgresPersistence;
//! use cirrus_core::runtime::NodeRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     let persistence = Arc::new(PostgresPersistence::new(pool));
//!
//!     let runtime = NodeRuntime::builder()
//!         .persistence(persistence.clone())
//!         .identity(NodeIdentity::new("node-a", "10.0.0.5:8250"))
//!         .connector(Arc::new(QuicAgentConnector::new(QuicAgentConnectorConfig::default())))
//!         .peers(Arc::new(QuicPeerChannel::new(persistence, QuicPeerConfig::default())))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... submit jobs through runtime.dispatcher() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use cirrus_protocol::server::CirrusServer;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::agent::{
    AgentConnector, AgentManager, AgentManagerConfig, PingMonitor, PingMonitorConfig,
};
use crate::cluster::{
    NodeIdentity, OwnershipScanner, OwnershipScannerConfig, PeerChannel, PeerRequestHandler,
    run_peer_server,
};
use crate::events::{
    CompositeEventSink, EventPublishingListener, EventSink, PersistentEventSink, TracingEventSink,
};
use crate::fsm::kinds::{host_machine, vm_machine};
use crate::fsm::{StateMachine, VmEvent, VmState};
use crate::jobs::vm::vm_handlers;
use crate::jobs::{JobDispatcher, JobDispatcherConfig, WorkHandler};
use crate::persistence::Persistence;

/// Builder for creating a [`NodeRuntime`].
#[derive(Default)]
pub struct NodeRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    identity: Option<NodeIdentity>,
    connector: Option<Arc<dyn AgentConnector>>,
    peers: Option<Arc<dyn PeerChannel>>,
    peer_server: Option<Arc<CirrusServer>>,
    event_sink: Option<Arc<dyn EventSink>>,
    handlers: Vec<Arc<dyn WorkHandler>>,
    agent_config: AgentManagerConfig,
    scanner_config: OwnershipScannerConfig,
    ping_config: PingMonitorConfig,
    job_config: JobDispatcherConfig,
}

impl std::fmt::Debug for NodeRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntimeBuilder")
            .field("identity", &self.identity)
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("peers", &self.peers.is_some())
            .field("peer_server", &self.peer_server.is_some())
            .field("extra_handlers", &self.handlers.len())
            .finish()
    }
}

impl NodeRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shared store (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set this node's cluster identity (required).
    pub fn identity(mut self, identity: NodeIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Set the agent transport (required).
    pub fn connector(mut self, connector: Arc<dyn AgentConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Channel to other nodes. Without one, hosts owned elsewhere are unreachable.
    pub fn peers(mut self, peers: Arc<dyn PeerChannel>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Serve peer requests on this endpoint while the runtime is up.
    pub fn peer_server(mut self, server: Arc<CirrusServer>) -> Self {
        self.peer_server = Some(server);
        self
    }

    /// Where committed transitions are published.
    ///
    /// Default: logged and appended to `resource_events`.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Register a work handler in addition to the VM lifecycle handlers.
    pub fn handler(mut self, handler: Arc<dyn WorkHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn agent_config(mut self, config: AgentManagerConfig) -> Self {
        self.agent_config = config;
        self
    }

    pub fn scanner_config(mut self, config: OwnershipScannerConfig) -> Self {
        self.scanner_config = config;
        self
    }

    pub fn ping_config(mut self, config: PingMonitorConfig) -> Self {
        self.ping_config = config;
        self
    }

    pub fn job_config(mut self, config: JobDispatcherConfig) -> Self {
        self.job_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<NodeRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let identity = self
            .identity
            .ok_or_else(|| anyhow::anyhow!("identity is required"))?;
        let connector = self
            .connector
            .ok_or_else(|| anyhow::anyhow!("connector is required"))?;

        let event_sink = self.event_sink.unwrap_or_else(|| {
            Arc::new(CompositeEventSink::new(vec![
                Arc::new(TracingEventSink),
                Arc::new(PersistentEventSink::new(persistence.clone())),
            ]))
        });

        Ok(NodeRuntimeConfig {
            persistence,
            identity,
            connector,
            peers: self.peers,
            peer_server: self.peer_server,
            event_sink,
            handlers: self.handlers,
            agent_config: self.agent_config,
            scanner_config: self.scanner_config,
            ping_config: self.ping_config,
            job_config: self.job_config,
        })
    }
}

/// Validated configuration for a [`NodeRuntime`].
pub struct NodeRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    identity: NodeIdentity,
    connector: Arc<dyn AgentConnector>,
    peers: Option<Arc<dyn PeerChannel>>,
    peer_server: Option<Arc<CirrusServer>>,
    event_sink: Arc<dyn EventSink>,
    handlers: Vec<Arc<dyn WorkHandler>>,
    agent_config: AgentManagerConfig,
    scanner_config: OwnershipScannerConfig,
    ping_config: PingMonitorConfig,
    job_config: JobDispatcherConfig,
}

impl std::fmt::Debug for NodeRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRuntimeConfig")
            .field("identity", &self.identity)
            .field("agent_config", &self.agent_config)
            .field("scanner_config", &self.scanner_config)
            .field("ping_config", &self.ping_config)
            .field("job_config", &self.job_config)
            .finish()
    }
}

impl NodeRuntimeConfig {
    /// Register the node and spawn its background tasks.
    pub async fn start(self) -> Result<NodeRuntime> {
        let node_id = self.identity.node_id.clone();
        let publisher = Arc::new(EventPublishingListener::new(
            self.event_sink,
            Some(node_id.clone()),
        ));

        let host_fsm = Arc::new(host_machine().listener(publisher.clone()).build()?);
        let vm_fsm = Arc::new(vm_machine().listener(publisher).build()?);

        let mut agents = AgentManager::builder(&node_id, self.persistence.clone(), self.connector)
            .host_machine(host_fsm)
            .config(self.agent_config);
        if let Some(peers) = self.peers {
            agents = agents.peers(peers);
        }
        let manager = agents.build()?;
        let peer_handler = Arc::new(PeerRequestHandler::new(&manager));

        let dispatcher = JobDispatcher::builder(&node_id, self.persistence.clone(), manager.clone())
            .handlers(vm_handlers(vm_fsm.clone()))
            .handlers(self.handlers)
            .config(self.job_config)
            .build();

        let scanner = Arc::new(OwnershipScanner::new(
            self.identity.clone(),
            manager.clone(),
            self.scanner_config,
        ));
        // Peers must see this node before it claims anything.
        scanner.register().await?;

        let ping_monitor = PingMonitor::new(manager.clone(), self.ping_config);

        // Serve peers before the first scan so forwarded requests find us.
        let server_handle = self.peer_server.clone().map(|server| {
            tokio::spawn(run_peer_server(server, peer_handler.clone()))
        });

        let scanner_shutdown = scanner.shutdown_handle();
        let scanner_task = scanner.clone();
        let scanner_handle = tokio::spawn(async move {
            scanner_task.run().await;
        });

        let ping_shutdown = ping_monitor.shutdown_handle();
        let ping_handle = tokio::spawn(async move {
            ping_monitor.run().await;
        });

        let jobs_shutdown = dispatcher.shutdown_handle();
        let jobs_task = dispatcher.clone();
        let jobs_handle = tokio::spawn(async move {
            jobs_task.run().await;
        });

        info!(
            node_id = %node_id,
            peer_addr = %self.identity.peer_addr,
            peer_server = server_handle.is_some(),
            handlers = ?dispatcher.handler_names(),
            "NodeRuntime started"
        );

        Ok(NodeRuntime {
            identity: self.identity,
            persistence: self.persistence,
            manager,
            dispatcher,
            scanner,
            peer_handler,
            vm_fsm,
            peer_server: self.peer_server,
            server_handle,
            scanner_handle,
            ping_handle,
            jobs_handle,
            scanner_shutdown,
            ping_shutdown,
            jobs_shutdown,
        })
    }
}

/// A running management node.
///
/// The runtime manages:
/// - Ownership scanner (heartbeat, claims, reconnects)
/// - Ping monitor for directly connected agents
/// - Recovery loop for orphaned work jobs
/// - Peer QUIC server (when one was supplied)
///
/// Call [`shutdown`](Self::shutdown) to release owned hosts and stop.
pub struct NodeRuntime {
    identity: NodeIdentity,
    persistence: Arc<dyn Persistence>,
    manager: Arc<AgentManager>,
    dispatcher: Arc<JobDispatcher>,
    scanner: Arc<OwnershipScanner>,
    peer_handler: Arc<PeerRequestHandler>,
    vm_fsm: Arc<StateMachine<VmState, VmEvent>>,
    peer_server: Option<Arc<CirrusServer>>,
    server_handle: Option<JoinHandle<Result<()>>>,
    scanner_handle: JoinHandle<()>,
    ping_handle: JoinHandle<()>,
    jobs_handle: JoinHandle<()>,
    scanner_shutdown: Arc<Notify>,
    ping_shutdown: Arc<Notify>,
    jobs_shutdown: Arc<Notify>,
}

impl NodeRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> NodeRuntimeBuilder {
        NodeRuntimeBuilder::new()
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn manager(&self) -> &Arc<AgentManager> {
        &self.manager
    }

    pub fn dispatcher(&self) -> &Arc<JobDispatcher> {
        &self.dispatcher
    }

    pub fn scanner(&self) -> &Arc<OwnershipScanner> {
        &self.scanner
    }

    /// Handler for peer requests addressed to this node, for transports other
    /// than the built-in QUIC server.
    pub fn peer_handler(&self) -> &Arc<PeerRequestHandler> {
        &self.peer_handler
    }

    /// The VM state machine used by the lifecycle handlers.
    pub fn vm_machine(&self) -> &Arc<StateMachine<VmState, VmEvent>> {
        &self.vm_fsm
    }

    /// Check if the background tasks are still running.
    pub fn is_running(&self) -> bool {
        !self.scanner_handle.is_finished()
    }

    /// Gracefully shut down the node.
    ///
    /// Job recovery and pings stop first. The scanner then releases every
    /// owned host and marks the node down, and only after that is the peer
    /// server closed so peers can still be notified.
    pub async fn shutdown(self) -> Result<()> {
        info!(node_id = %self.identity.node_id, "NodeRuntime shutting down...");

        self.jobs_shutdown.notify_one();
        self.ping_shutdown.notify_one();

        if let Err(e) = self.jobs_handle.await {
            error!("Job recovery task panicked: {}", e);
        }
        if let Err(e) = self.ping_handle.await {
            error!("Ping monitor task panicked: {}", e);
        }

        self.scanner_shutdown.notify_one();
        if let Err(e) = self.scanner_handle.await {
            error!("Ownership scanner task panicked: {}", e);
        }

        let Some(handle) = self.server_handle else {
            info!("NodeRuntime shutdown complete");
            return Ok(());
        };
        if let Some(server) = &self.peer_server {
            server.close();
        }

        match handle.await {
            Ok(Ok(())) => {
                info!("NodeRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Peer server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("Peer server task panicked: {}", e);
                Err(anyhow::anyhow!("peer server task panicked: {}", e))
            }
        }
    }
}
