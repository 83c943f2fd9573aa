// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-node agent manager.
//!
//! Holds one [`Attache`] per host this node talks to. Direct attaches own the
//! agent transport; forwarding attaches relay through the owning node's peer
//! endpoint. The attache map is locked only for lookups and swaps; request
//! bookkeeping is locked per attache.
//!
//! Disconnects and reconnects are queued to a background task so that the
//! dispatch path never waits on investigation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use cirrus_protocol::messages::{
    AgentAnswer, AgentRequest, Command, ForwardRequest, HostNotice, HostNoticeKind, StartupInfo,
};
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use super::attache::{Attache, AttacheMode, Completion, PendingRequest};
use super::investigator::{HostLiveness, InvestigationPolicy, Investigator};
use super::link::{AgentConnector, AgentEvent, AgentLink};
use super::listeners::{AnswerListener, HostEventMask, HostListener, ListenerId};
use crate::cluster::peer::{PeerChannel, PeerError};
use crate::error::{CoreError, duration_ms};
use crate::fsm::kinds::host_machine;
use crate::fsm::{HostEvent, HostStatus, StateMachine, Versioned};
use crate::persistence::{HostRecord, NewHost, Persistence, liveness_cutoff};

/// Configuration for the agent manager.
#[derive(Debug, Clone)]
pub struct AgentManagerConfig {
    /// Wait before reconnecting to a host this node still owns.
    pub reconnect_delay: Duration,
    /// Timeout for each neighbour check during investigation.
    pub investigation_timeout: Duration,
    /// Heartbeat age after which a peer node is ignored.
    pub node_timeout: Duration,
    /// Extra time allowed for a forwarded request on top of the caller's timeout.
    pub forward_grace: Duration,
    pub investigation: InvestigationPolicy,
}

impl Default for AgentManagerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            investigation_timeout: Duration::from_secs(5),
            node_timeout: Duration::from_secs(60),
            forward_grace: Duration::from_secs(2),
            investigation: InvestigationPolicy::default(),
        }
    }
}

struct RegisteredListener {
    id: ListenerId,
    mask: HostEventMask,
    listener: Arc<dyn HostListener>,
}

enum ManagerTask {
    Disconnect {
        host_id: i64,
        event: HostEvent,
        investigate: bool,
        /// Only act if this is still the host's attache.
        attache: Option<Arc<Attache>>,
    },
    Reconnect {
        host_id: i64,
    },
}

/// Builder for [`AgentManager`].
pub struct AgentManagerBuilder {
    node_id: String,
    persistence: Arc<dyn Persistence>,
    connector: Arc<dyn AgentConnector>,
    peers: Option<Arc<dyn PeerChannel>>,
    host_machine: Option<Arc<StateMachine<HostStatus, HostEvent>>>,
    config: AgentManagerConfig,
}

impl AgentManagerBuilder {
    pub fn peers(mut self, peers: Arc<dyn PeerChannel>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Host status machine, e.g. with event listeners attached.
    pub fn host_machine(mut self, machine: Arc<StateMachine<HostStatus, HostEvent>>) -> Self {
        self.host_machine = Some(machine);
        self
    }

    pub fn config(mut self, config: AgentManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the manager and start its background task queue.
    pub fn build(self) -> Result<Arc<AgentManager>, CoreError> {
        let host_fsm = match self.host_machine {
            Some(m) => m,
            None => Arc::new(host_machine().build()?),
        };
        let (tasks, rx) = mpsc::unbounded_channel();

        let manager = Arc::new_cyclic(|me| AgentManager {
            node_id: self.node_id,
            persistence: self.persistence,
            connector: self.connector,
            peers: self.peers,
            host_fsm,
            config: self.config,
            attaches: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            tasks,
            scan_wake: Arc::new(Notify::new()),
            closing: AtomicBool::new(false),
            me: me.clone(),
        });

        tokio::spawn(run_tasks(Arc::downgrade(&manager), rx));
        Ok(manager)
    }
}

async fn run_tasks(manager: Weak<AgentManager>, mut rx: mpsc::UnboundedReceiver<ManagerTask>) {
    while let Some(task) = rx.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        tokio::spawn(async move { manager.run_task(task).await });
    }
}

/// Agent connection layer of one management node.
pub struct AgentManager {
    node_id: String,
    persistence: Arc<dyn Persistence>,
    connector: Arc<dyn AgentConnector>,
    peers: Option<Arc<dyn PeerChannel>>,
    host_fsm: Arc<StateMachine<HostStatus, HostEvent>>,
    config: AgentManagerConfig,
    attaches: RwLock<HashMap<i64, Arc<Attache>>>,
    listeners: RwLock<Vec<RegisteredListener>>,
    next_listener_id: AtomicU64,
    tasks: mpsc::UnboundedSender<ManagerTask>,
    scan_wake: Arc<Notify>,
    closing: AtomicBool,
    me: Weak<AgentManager>,
}

impl std::fmt::Debug for AgentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentManager")
            .field("node_id", &self.node_id)
            .field("attaches", &self.read_attaches().len())
            .finish()
    }
}

fn unavailable(host_id: i64, reason: impl std::fmt::Display) -> CoreError {
    CoreError::AgentUnavailable {
        host_id,
        reason: reason.to_string(),
    }
}

impl AgentManager {
    pub fn builder(
        node_id: impl Into<String>,
        persistence: Arc<dyn Persistence>,
        connector: Arc<dyn AgentConnector>,
    ) -> AgentManagerBuilder {
        AgentManagerBuilder {
            node_id: node_id.into(),
            persistence,
            connector,
            peers: None,
            host_machine: None,
            config: AgentManagerConfig::default(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn connector(&self) -> &Arc<dyn AgentConnector> {
        &self.connector
    }

    pub fn peers(&self) -> Option<&Arc<dyn PeerChannel>> {
        self.peers.as_ref()
    }

    pub fn host_machine(&self) -> &Arc<StateMachine<HostStatus, HostEvent>> {
        &self.host_fsm
    }

    pub fn node_timeout(&self) -> Duration {
        self.config.node_timeout
    }

    /// Notified whenever the manager wants an ownership scan sooner than scheduled.
    pub fn scan_wake(&self) -> Arc<Notify> {
        self.scan_wake.clone()
    }

    fn wake_scanner(&self) {
        self.scan_wake.notify_one();
    }

    fn queue(&self, task: ManagerTask) {
        if self.tasks.send(task).is_err() {
            debug!("Manager task queue closed");
        }
    }

    // ------------------------------------------------------------------
    // Attache map
    // ------------------------------------------------------------------

    fn read_attaches(&self) -> std::sync::RwLockReadGuard<'_, HashMap<i64, Arc<Attache>>> {
        self.attaches.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_attaches(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<i64, Arc<Attache>>> {
        self.attaches.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn attache(&self, host_id: i64) -> Option<Arc<Attache>> {
        self.read_attaches().get(&host_id).cloned()
    }

    fn is_current(&self, attache: &Arc<Attache>) -> bool {
        self.read_attaches()
            .get(&attache.host_id())
            .is_some_and(|a| Arc::ptr_eq(a, attache))
    }

    fn remove_if_current(&self, attache: &Arc<Attache>) -> bool {
        let mut map = self.write_attaches();
        match map.get(&attache.host_id()) {
            Some(current) if Arc::ptr_eq(current, attache) => {
                map.remove(&attache.host_id());
                true
            }
            _ => false,
        }
    }

    /// Hosts with a direct attache, ready or not.
    pub fn direct_hosts(&self) -> Vec<i64> {
        let mut hosts: Vec<i64> = self
            .read_attaches()
            .values()
            .filter(|a| !a.is_forward())
            .map(|a| a.host_id())
            .collect();
        hosts.sort_unstable();
        hosts
    }

    /// Hosts this node relays through another node.
    pub fn forwarding_hosts(&self) -> Vec<(i64, String)> {
        let mut hosts: Vec<(i64, String)> = self
            .read_attaches()
            .values()
            .filter_map(|a| a.owner_node().map(|owner| (a.host_id(), owner)))
            .collect();
        hosts.sort_unstable();
        hosts
    }

    pub fn has_direct(&self, host_id: i64) -> bool {
        self.attache(host_id).is_some_and(|a| !a.is_forward())
    }

    pub fn has_ready_direct(&self, host_id: i64) -> bool {
        self.attache(host_id)
            .is_some_and(|a| !a.is_forward() && a.is_ready())
    }

    /// Ensure a forwarding attache towards `owner_node`, replacing one that
    /// points elsewhere. A direct attache is left untouched.
    pub fn ensure_forwarding(&self, host_id: i64, name: &str, owner_node: &str) -> Arc<Attache> {
        let mut map = self.write_attaches();
        if let Some(existing) = map.get(&host_id)
            && (!existing.is_forward() || existing.owner_node().as_deref() == Some(owner_node))
        {
            return existing.clone();
        }
        let attache = Arc::new(Attache::forwarding(host_id, name, owner_node));
        map.insert(host_id, attache.clone());
        debug!(host_id, owner = %owner_node, "Forwarding attache created");
        attache
    }

    /// Drop the forwarding attache for `host_id` if it still points at `owner_node`.
    pub fn drop_forwarding(&self, host_id: i64, owner_node: &str) -> bool {
        let mut map = self.write_attaches();
        let matches = map
            .get(&host_id)
            .is_some_and(|a| a.owner_node().as_deref() == Some(owner_node));
        if matches {
            map.remove(&host_id);
            debug!(host_id, owner = %owner_node, "Forwarding attache dropped");
        }
        matches
    }

    /// Drop every forwarding attache pointing at `owner_node`.
    pub fn drop_forwarding_for_node(&self, owner_node: &str) -> Vec<i64> {
        let mut map = self.write_attaches();
        let hosts: Vec<i64> = map
            .values()
            .filter(|a| a.owner_node().as_deref() == Some(owner_node))
            .map(|a| a.host_id())
            .collect();
        for host_id in &hosts {
            map.remove(host_id);
        }
        hosts
    }

    /// Outstanding sequence numbers for a host, for diagnostics.
    pub fn pending_sequences(&self, host_id: i64) -> Vec<u64> {
        self.attache(host_id)
            .map(|a| a.pending_sequences())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Host listeners
    // ------------------------------------------------------------------

    pub fn register_for_host_events(
        &self,
        listener: Arc<dyn HostListener>,
        mask: HostEventMask,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(RegisteredListener { id, mask, listener });
        id
    }

    pub fn unregister_host_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    fn listeners_where(&self, want: impl Fn(&HostEventMask) -> bool) -> Vec<Arc<dyn HostListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|l| want(&l.mask))
            .map(|l| l.listener.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Host status
    // ------------------------------------------------------------------

    /// Register a host and create its status resource.
    pub async fn register_host(&self, host: NewHost) -> Result<HostRecord, CoreError> {
        let record = self.persistence.register_host(&host).await?;
        self.host_fsm
            .create(self.persistence.as_ref(), &host.host_id.to_string(), None)
            .await?;
        info!(host_id = host.host_id, name = %host.name, "Host registered");
        Ok(record)
    }

    pub async fn host_status(&self, host_id: i64) -> Result<Versioned<HostStatus>, CoreError> {
        self.host_fsm
            .load(self.persistence.as_ref(), &host_id.to_string())
            .await
    }

    async fn load_or_create_status(&self, host_id: i64) -> Result<Versioned<HostStatus>, CoreError> {
        let id = host_id.to_string();
        let store = self.persistence.as_ref();
        if let Some(current) = self.host_fsm.find(store, &id).await? {
            return Ok(current);
        }
        match self.host_fsm.create(store, &id, None).await {
            Ok(created) => Ok(created),
            // Lost a creation race.
            Err(CoreError::Validation { .. }) => self.host_fsm.load(store, &id).await,
            Err(e) => Err(e),
        }
    }

    /// Apply a host event, skipping self-loops. Concurrent updates are retried
    /// once against a fresh read. Returns the resulting status.
    async fn drive_host(&self, host_id: i64, event: HostEvent) -> Option<HostStatus> {
        for _ in 0..2 {
            let current = match self.load_or_create_status(host_id).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(host_id, event = %event, error = %e, "Cannot load host status");
                    return None;
                }
            };
            let Some(next) = self.host_fsm.next_state(current.state, event) else {
                debug!(host_id, state = %current.state, event = %event, "Host event ignored");
                return Some(current.state);
            };
            if next == current.state {
                return Some(next);
            }
            match self
                .host_fsm
                .transition(self.persistence.as_ref(), &current, event)
                .await
            {
                Ok(updated) => return Some(updated.state),
                Err(CoreError::StaleResource { .. }) => continue,
                Err(e) => {
                    warn!(host_id, event = %event, error = %e, "Host transition failed");
                    return None;
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    async fn resolve_attache(&self, host_id: i64) -> Result<Arc<Attache>, CoreError> {
        if let Some(attache) = self.attache(host_id) {
            return Ok(attache);
        }

        let host = self
            .persistence
            .get_host(host_id)
            .await?
            .ok_or(CoreError::HostNotFound { host_id })?;

        match host.owner_node {
            Some(owner) if owner != self.node_id => {
                let cutoff = liveness_cutoff(Utc::now(), self.config.node_timeout);
                let live = self
                    .persistence
                    .get_node(&owner)
                    .await?
                    .is_some_and(|n| n.is_live(cutoff));
                if !live {
                    self.wake_scanner();
                    return Err(unavailable(host_id, format!("owner node {} is not live", owner)));
                }
                Ok(self.ensure_forwarding(host_id, &host.name, &owner))
            }
            Some(_) => Err(unavailable(host_id, "agent is not connected")),
            None => {
                self.wake_scanner();
                Err(unavailable(host_id, "host has no owner"))
            }
        }
    }

    /// Send a command batch and wait for its answer.
    ///
    /// Relays through the owning node when this node has no direct connection.
    /// A write failure is [`CoreError::AgentUnavailable`] and also disconnects
    /// the host; no answer within `timeout` is [`CoreError::OperationTimedOut`].
    #[instrument(skip(self, commands), fields(node_id = %self.node_id, commands = commands.len()))]
    pub async fn send(
        &self,
        host_id: i64,
        commands: Vec<Command>,
        timeout: Duration,
    ) -> Result<AgentAnswer, CoreError> {
        let attache = self.resolve_attache(host_id).await?;
        match attache.mode() {
            AttacheMode::Direct { link } => self.send_direct(&attache, link, commands, timeout).await,
            AttacheMode::Forward { owner_node } => {
                self.send_forward(host_id, &owner_node, commands, timeout)
                    .await
            }
        }
    }

    /// Send without waiting. `listener` is called exactly once with the
    /// answer, a timeout, or a disconnect. Returns the sequence number.
    pub async fn send_async(
        &self,
        host_id: i64,
        commands: Vec<Command>,
        timeout: Duration,
        listener: Arc<dyn AnswerListener>,
    ) -> Result<u64, CoreError> {
        let attache = self.resolve_attache(host_id).await?;
        match attache.mode() {
            AttacheMode::Direct { link } => {
                if !attache.is_ready() {
                    return Err(unavailable(host_id, "agent is not ready"));
                }
                let sequence = attache.next_sequence();
                attache.register(PendingRequest::new(
                    sequence,
                    commands.iter().map(|c| c.name.clone()).collect(),
                    timeout,
                    Completion::Listener(listener),
                ));
                self.write(&attache, link.as_ref(), sequence, commands)
                    .await?;

                let weak = Arc::downgrade(&attache);
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(attache) = weak.upgrade()
                        && let Some(pending) = attache.take(sequence)
                    {
                        debug!(host_id, sequence, "Async request timed out");
                        pending.complete(
                            host_id,
                            Err(CoreError::timed_out(host_id, timeout)),
                        );
                    }
                });
                Ok(sequence)
            }
            AttacheMode::Forward { owner_node } => {
                let sequence = attache.next_sequence();
                let manager = self
                    .me
                    .upgrade()
                    .ok_or_else(|| unavailable(host_id, "manager is shutting down"))?;
                tokio::spawn(async move {
                    let result = manager
                        .send_forward(host_id, &owner_node, commands, timeout)
                        .await;
                    listener.on_answer(host_id, sequence, result);
                });
                Ok(sequence)
            }
        }
    }

    /// Send over a direct attache.
    pub(crate) async fn send_direct(
        &self,
        attache: &Arc<Attache>,
        link: Arc<dyn AgentLink>,
        commands: Vec<Command>,
        timeout: Duration,
    ) -> Result<AgentAnswer, CoreError> {
        let host_id = attache.host_id();
        if !attache.is_ready() {
            return Err(unavailable(host_id, "agent is not ready"));
        }

        let sequence = attache.next_sequence();
        let (tx, rx) = oneshot::channel();
        attache.register(PendingRequest::new(
            sequence,
            commands.iter().map(|c| c.name.clone()).collect(),
            timeout,
            Completion::Blocking(tx),
        ));
        self.write(attache, link.as_ref(), sequence, commands)
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(unavailable(host_id, "request abandoned")),
            Err(_) => {
                attache.take(sequence);
                let err = CoreError::timed_out(host_id, timeout);
                warn!(host_id, sequence, error = %err, "Agent request timed out");
                Err(err)
            }
        }
    }

    async fn write(
        &self,
        attache: &Arc<Attache>,
        link: &dyn AgentLink,
        sequence: u64,
        commands: Vec<Command>,
    ) -> Result<(), CoreError> {
        let host_id = attache.host_id();
        for listener in self.listeners_where(|m| m.command_before_send) {
            listener.before_send(host_id, sequence, &commands);
        }

        let request = AgentRequest {
            host_id,
            sequence,
            commands,
            stop_on_error: true,
        };
        if let Err(e) = link.send(request).await {
            attache.take(sequence);
            warn!(host_id, sequence, error = %e, "Agent write failed");
            self.queue(ManagerTask::Disconnect {
                host_id,
                event: HostEvent::AgentDisconnected,
                investigate: false,
                attache: Some(attache.clone()),
            });
            return Err(match e {
                CoreError::AgentUnavailable { .. } => e,
                other => unavailable(host_id, other),
            });
        }
        debug!(host_id, sequence, "Request written");
        Ok(())
    }

    async fn send_forward(
        &self,
        host_id: i64,
        owner_node: &str,
        commands: Vec<Command>,
        timeout: Duration,
    ) -> Result<AgentAnswer, CoreError> {
        let Some(peers) = self.peers.as_ref() else {
            return Err(unavailable(host_id, "no peer channel configured"));
        };
        let request = ForwardRequest {
            source_node: self.node_id.clone(),
            host_id,
            request: Some(AgentRequest {
                host_id,
                sequence: 0,
                commands,
                stop_on_error: true,
            }),
            timeout_ms: duration_ms(timeout),
        };

        match tokio::time::timeout(
            timeout.saturating_add(self.config.forward_grace),
            peers.forward(owner_node, request),
        )
        .await
        {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(PeerError::Remote(e))) => Err(e),
            Ok(Err(e)) => {
                warn!(host_id, owner = %owner_node, error = %e, "Forwarding target unusable");
                self.drop_forwarding(host_id, owner_node);
                self.wake_scanner();
                Err(unavailable(host_id, e))
            }
            Err(_) => Err(CoreError::timed_out(host_id, timeout)),
        }
    }

    /// Route an answer to the request that carries its sequence number.
    /// Unmatched and late answers are dropped.
    pub fn process_answer(&self, host_id: i64, answer: AgentAnswer) {
        match self.attache(host_id) {
            Some(attache) => self.deliver(&attache, answer),
            None => warn!(host_id, sequence = answer.sequence, "Answer for unknown host dropped"),
        }
    }

    fn deliver(&self, attache: &Attache, answer: AgentAnswer) {
        let host_id = attache.host_id();
        match attache.take(answer.sequence) {
            Some(pending) => {
                debug!(host_id, sequence = answer.sequence, "Answer matched");
                pending.complete(host_id, Ok(answer));
            }
            None => warn!(
                host_id,
                sequence = answer.sequence,
                "Dropping unmatched or late answer"
            ),
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        attache: Arc<Attache>,
        mut events: mpsc::UnboundedReceiver<AgentEvent>,
    ) {
        let host_id = attache.host_id();
        let (event, investigate) = loop {
            match events.recv().await {
                Some(AgentEvent::Answer(answer)) => {
                    if self.is_current(&attache) {
                        self.deliver(&attache, answer);
                    } else {
                        debug!(host_id, sequence = answer.sequence, "Answer for replaced connection dropped");
                    }
                }
                Some(AgentEvent::Shutdown(reason)) => {
                    info!(host_id, reason = %reason, "Agent shutting down");
                    break (HostEvent::ShutdownRequested, false);
                }
                Some(AgentEvent::Closed(reason)) => {
                    debug!(host_id, reason = %reason, "Agent connection closed");
                    break (HostEvent::AgentDisconnected, true);
                }
                None => break (HostEvent::AgentDisconnected, true),
            }
        };
        self.queue(ManagerTask::Disconnect {
            host_id,
            event,
            investigate,
            attache: Some(attache),
        });
    }

    // ------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------

    /// Dial a host this node owns and bring it up.
    ///
    /// An existing forwarding attache is promoted in place. Connect listeners
    /// run before the attache is marked ready.
    #[instrument(skip(self, host), fields(node_id = %self.node_id, host_id = host.host_id))]
    pub async fn connect_host(&self, host: &HostRecord) -> Result<Arc<Attache>, CoreError> {
        let host_id = host.host_id;
        if self.closing.load(Ordering::SeqCst) {
            return Err(unavailable(host_id, "node is shutting down"));
        }
        if let Some(existing) = self.attache(host_id)
            && existing.link().is_some_and(|l| l.is_open())
        {
            return Ok(existing);
        }

        let session = match self.connector.connect(host, &self.node_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(host_id, error = %e, "Agent connect failed");
                self.drive_host(host_id, HostEvent::AgentDisconnected).await;
                return Err(e);
            }
        };
        self.drive_host(host_id, HostEvent::AgentConnected).await;

        let (attache, replaced) = {
            let mut map = self.write_attaches();
            match map.get(&host_id).cloned() {
                Some(existing) if existing.is_forward() => {
                    existing.promote(session.link.clone());
                    info!(host_id, "Forwarding attache promoted to direct");
                    (existing, None)
                }
                previous => {
                    let attache = Arc::new(Attache::direct(host_id, &host.name, session.link.clone()));
                    map.insert(host_id, attache.clone());
                    (attache, previous)
                }
            }
        };

        if let Some(old) = replaced {
            for pending in old.drain() {
                pending.complete(host_id, Err(unavailable(host_id, "connection replaced")));
            }
            if let Some(link) = old.link() {
                link.close().await;
            }
        }

        let me = self
            .me
            .upgrade()
            .ok_or_else(|| unavailable(host_id, "manager is shutting down"))?;
        tokio::spawn(me.dispatch(attache.clone(), session.events));

        self.notify_monitors_of_connection(&attache, host, &session.startup)
            .await?;
        Ok(attache)
    }

    /// Run connect listeners in order, then mark the attache ready and the
    /// host `Up`. A refusing listener unwinds the ones that already accepted
    /// and tears the connection down.
    pub async fn notify_monitors_of_connection(
        &self,
        attache: &Arc<Attache>,
        host: &HostRecord,
        startup: &StartupInfo,
    ) -> Result<(), CoreError> {
        let host_id = attache.host_id();
        let mut accepted: Vec<Arc<dyn HostListener>> = Vec::new();

        for listener in self.listeners_where(|m| m.connect) {
            if let Err(failure) = listener.on_connect(host, startup).await {
                warn!(
                    host_id,
                    listener = listener.name(),
                    retriable = failure.retriable,
                    reason = %failure.reason,
                    "Connect listener refused host"
                );
                for previous in accepted.iter().rev() {
                    previous
                        .on_disconnect(host_id, Some(HostStatus::Disconnected))
                        .await;
                }
                let event = if failure.retriable {
                    HostEvent::AgentDisconnected
                } else {
                    HostEvent::ShutdownRequested
                };
                self.disconnect(attache, event, false).await;
                return Err(unavailable(
                    host_id,
                    format!("{} refused connection: {}", listener.name(), failure.reason),
                ));
            }
            accepted.push(listener);
        }

        attache.set_ready(true);
        let status = self.drive_host(host_id, HostEvent::Ready).await;
        self.notify_peers(host_id, HostNoticeKind::Claimed);
        info!(host_id, status = ?status, "Host ready");
        Ok(())
    }

    async fn reconnect(&self, host_id: i64) {
        if self.closing.load(Ordering::SeqCst) || self.has_direct(host_id) {
            return;
        }
        let host = match self.persistence.get_host(host_id).await {
            Ok(Some(host)) => host,
            Ok(None) => return,
            Err(e) => {
                warn!(host_id, error = %e, "Cannot load host for reconnect");
                return;
            }
        };
        if host.owner_node.as_deref() != Some(self.node_id.as_str()) {
            debug!(host_id, "No longer owner, skipping reconnect");
            return;
        }
        if let Err(e) = self.connect_host(&host).await {
            debug!(host_id, error = %e, "Reconnect failed");
        }
    }

    // ------------------------------------------------------------------
    // Disconnecting
    // ------------------------------------------------------------------

    async fn run_task(&self, task: ManagerTask) {
        match task {
            ManagerTask::Disconnect {
                host_id,
                event,
                investigate,
                attache,
            } => {
                if let Some(attache) = &attache
                    && !self.is_current(attache)
                {
                    debug!(host_id, "Disconnect for replaced connection ignored");
                    return;
                }
                if let Err(e) = self.handle_disconnect(host_id, event, investigate, false).await {
                    warn!(host_id, error = %e, "Disconnect handling failed");
                }
            }
            ManagerTask::Reconnect { host_id } => {
                tokio::time::sleep(self.config.reconnect_delay).await;
                self.reconnect(host_id).await;
            }
        }
    }

    /// Handle a suspected or confirmed host failure.
    ///
    /// With `investigate` (and without `force`) the host is investigated
    /// first. If it turns out alive over a still-open link nothing is torn
    /// down and `false` is returned. Otherwise the verdict picks the host event,
    /// outstanding requests fail with [`CoreError::AgentUnavailable`] and the
    /// attache is removed.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn handle_disconnect(
        &self,
        host_id: i64,
        event: HostEvent,
        investigate: bool,
        force: bool,
    ) -> Result<bool, CoreError> {
        let Some(attache) = self.attache(host_id) else {
            return Ok(false);
        };
        if attache.is_forward() {
            self.remove_if_current(&attache);
            return Ok(true);
        }

        let mut event = event;
        if investigate
            && !force
            && let Some(host) = self.persistence.get_host(host_id).await?
        {
            let verdict = Investigator::new(
                self,
                &self.config.investigation,
                self.config.investigation_timeout,
            )
            .investigate(&host)
            .await;
            let link_open = attache.link().is_some_and(|l| l.is_open());
            if verdict == HostLiveness::Up && link_open {
                info!(host_id, "Host found alive, keeping connection");
                self.drive_host(host_id, HostEvent::Ping).await;
                return Ok(false);
            }
            event = match verdict {
                HostLiveness::Up => HostEvent::AgentDisconnected,
                other => other.host_event(),
            };
        }

        self.disconnect(&attache, event, true).await;
        Ok(true)
    }

    async fn disconnect(&self, attache: &Arc<Attache>, event: HostEvent, notify_listeners: bool) {
        let host_id = attache.host_id();
        let removed = self.remove_if_current(attache);
        attache.set_ready(false);

        let pending = attache.drain();
        if !pending.is_empty() {
            info!(host_id, count = pending.len(), "Failing outstanding requests");
        }
        for request in pending {
            request.complete(host_id, Err(unavailable(host_id, "host disconnected")));
        }
        if let Some(link) = attache.link() {
            link.close().await;
        }

        let status = self.drive_host(host_id, event).await;
        if notify_listeners {
            for listener in self.listeners_where(|m| m.disconnect) {
                listener.on_disconnect(host_id, status).await;
            }
        }
        if removed {
            self.notify_peers(host_id, HostNoticeKind::Disconnected);
        }
        info!(host_id, event = %event, status = ?status, "Host disconnected");

        if matches!(
            event,
            HostEvent::AgentDisconnected | HostEvent::PingTimeout | HostEvent::HostDown
        ) && !self.closing.load(Ordering::SeqCst)
        {
            self.queue(ManagerTask::Reconnect { host_id });
        }
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    /// Ping one host. Failure escalates to an investigated disconnect.
    pub async fn ping(&self, host_id: i64, timeout: Duration) -> Result<(), CoreError> {
        match self.send(host_id, vec![Command::ping()], timeout).await {
            Ok(_) => {
                if let Err(e) = self.persistence.touch_host_ping(host_id, Utc::now()).await {
                    debug!(host_id, error = %e, "Failed to record ping");
                }
                self.drive_host(host_id, HostEvent::Ping).await;
                Ok(())
            }
            Err(e) => {
                warn!(host_id, error = %e, "Ping failed");
                self.handle_disconnect(host_id, HostEvent::PingTimeout, true, false)
                    .await?;
                Err(e)
            }
        }
    }

    /// Liveness as seen from this node, answered to peers during investigation.
    pub fn local_liveness(&self, host_id: i64) -> HostLiveness {
        match self.attache(host_id) {
            Some(a) if !a.is_forward() => match a.link() {
                Some(link) if link.is_open() && a.is_ready() => HostLiveness::Up,
                Some(_) => HostLiveness::Disconnected,
                None => HostLiveness::Unknown,
            },
            _ => HostLiveness::Unknown,
        }
    }

    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    fn notify_peers(&self, host_id: i64, kind: HostNoticeKind) {
        let Some(peers) = self.peers.clone() else {
            return;
        };
        let persistence = self.persistence.clone();
        let node_id = self.node_id.clone();
        let node_timeout = self.config.node_timeout;
        tokio::spawn(async move {
            broadcast_notice(persistence, peers, node_id, node_timeout, host_id, kind).await;
        });
    }

    /// React to a notice from another node.
    pub async fn handle_peer_notice(&self, notice: HostNotice) {
        let host_id = notice.host_id;
        let source = notice.source_node.as_str();
        let kind = HostNoticeKind::try_from(notice.kind).unwrap_or(HostNoticeKind::Unspecified);
        debug!(host_id, source = %source, kind = ?kind, "Peer notice");

        match kind {
            HostNoticeKind::Disconnected | HostNoticeKind::Released => {
                self.drop_forwarding(host_id, source);
                if kind == HostNoticeKind::Released {
                    self.wake_scanner();
                }
            }
            HostNoticeKind::Claimed => {
                let Some(attache) = self.attache(host_id) else {
                    return;
                };
                if attache.is_forward() {
                    if attache.owner_node().as_deref() != Some(source) {
                        self.ensure_forwarding(host_id, attache.name(), source);
                    }
                    return;
                }
                // Another node claims a host we hold directly: trust the store.
                match self.persistence.get_host(host_id).await {
                    Ok(Some(host)) if host.owner_node.as_deref() != Some(self.node_id.as_str()) => {
                        warn!(host_id, claimer = %source, "Lost ownership, dropping direct connection");
                        self.relinquish(host_id).await;
                        if let Some(owner) = host.owner_node {
                            self.ensure_forwarding(host_id, &host.name, &owner);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(host_id, error = %e, "Cannot verify ownership"),
                }
            }
            HostNoticeKind::Unspecified => {}
        }
    }

    /// Tear down the direct connection to a host this node no longer owns.
    /// No reconnect is scheduled.
    pub async fn relinquish(&self, host_id: i64) -> bool {
        match self.attache(host_id) {
            Some(attache) if !attache.is_forward() => {
                self.disconnect(&attache, HostEvent::ManagementServerDown, true)
                    .await;
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop accepting connections, take every owned host down with
    /// `ManagementServerDown`, clear ownership and tell peers.
    pub async fn release_all(&self) -> Vec<i64> {
        self.closing.store(true, Ordering::SeqCst);
        let attaches: Vec<Arc<Attache>> = self.read_attaches().values().cloned().collect();

        let mut released = Vec::new();
        for attache in attaches {
            let host_id = attache.host_id();
            if attache.is_forward() {
                self.remove_if_current(&attache);
                continue;
            }
            self.disconnect(&attache, HostEvent::ManagementServerDown, true)
                .await;
            match self.persistence.release_host(host_id, &self.node_id).await {
                Ok(true) => released.push(host_id),
                Ok(false) => debug!(host_id, "Host was not owned at release"),
                Err(e) => warn!(host_id, error = %e, "Failed to release host"),
            }
        }

        if let Some(peers) = self.peers.clone() {
            for host_id in &released {
                broadcast_notice(
                    self.persistence.clone(),
                    peers.clone(),
                    self.node_id.clone(),
                    self.config.node_timeout,
                    *host_id,
                    HostNoticeKind::Released,
                )
                .await;
            }
        }
        info!(node_id = %self.node_id, count = released.len(), "Released hosts");
        released
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

async fn broadcast_notice(
    persistence: Arc<dyn Persistence>,
    peers: Arc<dyn PeerChannel>,
    node_id: String,
    node_timeout: Duration,
    host_id: i64,
    kind: HostNoticeKind,
) {
    let nodes = match persistence.list_nodes().await {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(error = %e, "Cannot list peers for notice");
            return;
        }
    };
    let cutoff = liveness_cutoff(Utc::now(), node_timeout);
    for node in nodes
        .into_iter()
        .filter(|n| n.node_id != node_id && n.is_live(cutoff))
    {
        let notice = HostNotice {
            source_node: node_id.clone(),
            host_id,
            kind: kind as i32,
        };
        if let Err(e) = peers.notify(&node.node_id, notice).await {
            debug!(peer = %node.node_id, host_id, error = %e, "Peer notice failed");
        }
    }
}
