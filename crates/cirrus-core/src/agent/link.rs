// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport seam between the agent manager and host agents.
//!
//! A connector dials a host and performs the startup handshake; the resulting
//! [`AgentSession`] carries the write half as an [`AgentLink`] and the read
//! half as a stream of [`AgentEvent`]s consumed by the manager's dispatch task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cirrus_protocol::messages::{
    AgentAnswer, AgentMessage, AgentRequest, NodeMessage, StartupInfo, agent_message,
};
use cirrus_protocol::{CirrusClient, CirrusClientConfig, ClientError, FramedStream, MessageType};
use quinn::{RecvStream, SendStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::investigator::HostLiveness;
use crate::error::{CoreError, duration_ms};
use crate::persistence::HostRecord;

/// Something read from an agent connection.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Answer(AgentAnswer),
    /// The agent announced it is going away.
    Shutdown(String),
    /// The transport closed or failed.
    Closed(String),
}

/// Write half of an agent connection.
#[async_trait]
pub trait AgentLink: Send + Sync {
    /// Write one request. A failure means the transport is unusable.
    async fn send(&self, request: AgentRequest) -> Result<(), CoreError>;

    async fn close(&self);

    fn is_open(&self) -> bool;
}

/// A freshly established agent connection.
pub struct AgentSession {
    pub link: Arc<dyn AgentLink>,
    pub startup: StartupInfo,
    pub events: mpsc::UnboundedReceiver<AgentEvent>,
}

/// Establishes agent connections and checks reachability.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, host: &HostRecord, node_id: &str) -> Result<AgentSession, CoreError>;

    /// Quick reachability check that does not disturb an existing session.
    async fn reachability(&self, host: &HostRecord) -> HostLiveness;
}

fn unavailable(host_id: i64, reason: impl std::fmt::Display) -> CoreError {
    CoreError::AgentUnavailable {
        host_id,
        reason: reason.to_string(),
    }
}

/// Settings for [`QuicAgentConnector`].
#[derive(Debug, Clone)]
pub struct QuicAgentConnectorConfig {
    /// TLS server name expected from agents.
    pub server_name: String,
    pub skip_cert_verification: bool,
    pub connect_timeout: Duration,
    /// How long to wait for the agent's startup notice.
    pub handshake_timeout: Duration,
    pub reach_timeout: Duration,
}

impl Default for QuicAgentConnectorConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            skip_cert_verification: false,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            reach_timeout: Duration::from_secs(2),
        }
    }
}

/// Dials host agents over QUIC, one long-lived bidirectional stream per host.
pub struct QuicAgentConnector {
    config: QuicAgentConnectorConfig,
}

impl QuicAgentConnector {
    pub fn new(config: QuicAgentConnectorConfig) -> Self {
        Self { config }
    }

    fn client_for(&self, addr: SocketAddr, connect_timeout: Duration) -> Result<CirrusClient, ClientError> {
        CirrusClient::new(CirrusClientConfig {
            server_addr: addr,
            server_name: self.config.server_name.clone(),
            dangerous_skip_cert_verification: self.config.skip_cert_verification,
            connect_timeout_ms: duration_ms(connect_timeout),
            ..Default::default()
        })
    }
}

fn parse_address(host: &HostRecord) -> Result<SocketAddr, CoreError> {
    host.address.parse().map_err(|_| CoreError::Validation {
        field: "address".to_string(),
        message: format!("host {} has invalid agent address '{}'", host.host_id, host.address),
    })
}

#[async_trait]
impl AgentConnector for QuicAgentConnector {
    async fn connect(&self, host: &HostRecord, node_id: &str) -> Result<AgentSession, CoreError> {
        let addr = parse_address(host)?;
        let host_id = host.host_id;

        let client = self
            .client_for(addr, self.config.connect_timeout)
            .map_err(|e| unavailable(host_id, e))?;
        let (mut tx, mut rx) = client
            .open_channel()
            .await
            .map_err(|e| unavailable(host_id, e))?;

        tx.send_request(&NodeMessage::hello(node_id, host_id))
            .await
            .map_err(|e| unavailable(host_id, e))?;

        let first: AgentMessage = tokio::time::timeout(
            self.config.handshake_timeout,
            rx.read_message(MessageType::Notice),
        )
        .await
        .map_err(|_| unavailable(host_id, "startup handshake timed out"))?
        .map_err(|e| unavailable(host_id, e))?;

        let startup = match first.kind {
            Some(agent_message::Kind::Startup(info)) => info,
            other => {
                return Err(CoreError::Protocol {
                    message: format!("expected startup from host {}, got {:?}", host_id, other),
                });
            }
        };
        if startup.host_id != host_id {
            return Err(CoreError::Protocol {
                message: format!(
                    "agent at {} reported host {} instead of {}",
                    addr, startup.host_id, host_id
                ),
            });
        }

        info!(host_id, addr = %addr, version = %startup.version, "Agent connected");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(host_id, rx, events_tx, open.clone()));

        let link = Arc::new(QuicAgentLink {
            host_id,
            client,
            writer: Mutex::new(tx),
            open,
            reader: std::sync::Mutex::new(Some(reader)),
        });

        Ok(AgentSession {
            link,
            startup,
            events: events_rx,
        })
    }

    async fn reachability(&self, host: &HostRecord) -> HostLiveness {
        let Ok(addr) = parse_address(host) else {
            return HostLiveness::Unknown;
        };
        let Ok(client) = self.client_for(addr, self.config.reach_timeout) else {
            return HostLiveness::Unknown;
        };
        let liveness = match client.connect().await {
            Ok(()) => HostLiveness::Up,
            // Unreachable from here is not proof the host is down.
            Err(e) => {
                debug!(host_id = host.host_id, error = %e, "Direct reachability check failed");
                HostLiveness::Unknown
            }
        };
        client.close().await;
        liveness
    }
}

async fn read_loop(
    host_id: i64,
    mut rx: FramedStream<RecvStream>,
    events: mpsc::UnboundedSender<AgentEvent>,
    open: Arc<AtomicBool>,
) {
    let reason = loop {
        let frame = match rx.read_frame().await {
            Ok(frame) => frame,
            Err(e) => break e.to_string(),
        };
        let message: AgentMessage = match frame.decode() {
            Ok(m) => m,
            Err(e) => {
                warn!(host_id, error = %e, "Undecodable agent frame");
                continue;
            }
        };
        let event = match message.kind {
            Some(agent_message::Kind::Answer(answer)) => AgentEvent::Answer(answer),
            Some(agent_message::Kind::Shutdown(notice)) => AgentEvent::Shutdown(notice.reason),
            Some(agent_message::Kind::Startup(_)) | None => continue,
        };
        let shutdown = matches!(event, AgentEvent::Shutdown(_));
        if events.send(event).is_err() || shutdown {
            open.store(false, Ordering::SeqCst);
            return;
        }
    };

    open.store(false, Ordering::SeqCst);
    debug!(host_id, reason = %reason, "Agent stream closed");
    let _ = events.send(AgentEvent::Closed(reason));
}

/// Write half of a QUIC agent channel.
pub struct QuicAgentLink {
    host_id: i64,
    client: CirrusClient,
    writer: Mutex<FramedStream<SendStream>>,
    open: Arc<AtomicBool>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl AgentLink for QuicAgentLink {
    async fn send(&self, request: AgentRequest) -> Result<(), CoreError> {
        if !self.is_open() {
            return Err(unavailable(self.host_id, "link closed"));
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send_request(&NodeMessage::request(request)).await {
            self.open.store(false, Ordering::SeqCst);
            return Err(unavailable(self.host_id, e));
        }
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
        self.client.close().await;
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
