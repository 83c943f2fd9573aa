// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process agent connector.
//!
//! Every host answers all commands successfully unless scripted otherwise.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use cirrus_protocol::messages::{AgentAnswer, AgentRequest, Answer, Command, StartupInfo};
use tokio::sync::mpsc;

use cirrus_core::CoreError;
use cirrus_core::agent::{AgentConnector, AgentEvent, AgentLink, AgentSession, HostLiveness};
use cirrus_core::persistence::HostRecord;

type Responder = Arc<dyn Fn(&Command) -> Answer + Send + Sync>;
type DelayFn = Arc<dyn Fn(&AgentRequest) -> Duration + Send + Sync>;

/// How a mock host treats written requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Answer every request.
    Answer,
    /// Accept writes, never answer.
    Silent,
    /// Fail every write.
    FailWrites,
}

struct MockHost {
    behavior: MockBehavior,
    refuse_connect: bool,
    liveness: HostLiveness,
    responder: Option<Responder>,
    delay: Option<DelayFn>,
    sent: Vec<AgentRequest>,
    connects: usize,
    session: Option<(mpsc::UnboundedSender<AgentEvent>, Arc<AtomicBool>)>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self {
            behavior: MockBehavior::Answer,
            refuse_connect: false,
            liveness: HostLiveness::Up,
            responder: None,
            delay: None,
            sent: Vec::new(),
            connects: 0,
            session: None,
        }
    }
}

#[derive(Default)]
struct MockState {
    hosts: HashMap<i64, MockHost>,
}

/// Scriptable in-memory [`AgentConnector`].
///
/// Clones share the same scripted hosts, so one connector can serve several
/// simulated management nodes.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_host<R>(&self, host_id: i64, f: impl FnOnce(&mut MockHost) -> R) -> R {
        let mut state = self.lock();
        f(state.hosts.entry(host_id).or_default())
    }

    pub fn set_behavior(&self, host_id: i64, behavior: MockBehavior) {
        self.with_host(host_id, |h| h.behavior = behavior);
    }

    pub fn refuse_connections(&self, host_id: i64, refuse: bool) {
        self.with_host(host_id, |h| h.refuse_connect = refuse);
    }

    /// Verdict returned by [`AgentConnector::reachability`].
    pub fn set_liveness(&self, host_id: i64, liveness: HostLiveness) {
        self.with_host(host_id, |h| h.liveness = liveness);
    }

    pub fn set_responder<F>(&self, host_id: i64, responder: F)
    where
        F: Fn(&Command) -> Answer + Send + Sync + 'static,
    {
        self.with_host(host_id, |h| h.responder = Some(Arc::new(responder)));
    }

    /// Delay before a request is answered.
    pub fn set_delay<F>(&self, host_id: i64, delay: F)
    where
        F: Fn(&AgentRequest) -> Duration + Send + Sync + 'static,
    {
        self.with_host(host_id, |h| h.delay = Some(Arc::new(delay)));
    }

    /// Requests written to the host, in write order.
    pub fn sent_requests(&self, host_id: i64) -> Vec<AgentRequest> {
        self.with_host(host_id, |h| h.sent.clone())
    }

    pub fn connect_count(&self, host_id: i64) -> usize {
        self.with_host(host_id, |h| h.connects)
    }

    /// Drop the current session as if the transport failed.
    pub fn kill_connection(&self, host_id: i64, reason: &str) {
        if let Some((events, open)) = self.with_host(host_id, |h| h.session.take()) {
            open.store(false, Ordering::SeqCst);
            let _ = events.send(AgentEvent::Closed(reason.to_string()));
        }
    }

    /// Have the agent announce its shutdown.
    pub fn send_shutdown(&self, host_id: i64, reason: &str) {
        if let Some((events, open)) = self.with_host(host_id, |h| h.session.take()) {
            open.store(false, Ordering::SeqCst);
            let _ = events.send(AgentEvent::Shutdown(reason.to_string()));
        }
    }

    /// Push an answer into the current session regardless of what was sent.
    pub fn inject_answer(&self, host_id: i64, answer: AgentAnswer) {
        if let Some((events, _)) = self.with_host(host_id, |h| h.session.clone()) {
            let _ = events.send(AgentEvent::Answer(answer));
        }
    }

    pub fn is_connected(&self, host_id: i64) -> bool {
        self.with_host(host_id, |h| {
            h.session
                .as_ref()
                .is_some_and(|(_, open)| open.load(Ordering::SeqCst))
        })
    }
}

#[async_trait]
impl AgentConnector for MockConnector {
    async fn connect(&self, host: &HostRecord, _node_id: &str) -> Result<AgentSession, CoreError> {
        let host_id = host.host_id;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let previous = self.with_host(host_id, |h| {
            if h.refuse_connect {
                return Err(CoreError::AgentUnavailable {
                    host_id,
                    reason: "connection refused".to_string(),
                });
            }
            h.connects += 1;
            Ok(h.session.replace((events_tx.clone(), open.clone())))
        })?;
        // An agent accepts one session; the older one is cut off.
        if let Some((old_events, old_open)) = previous {
            old_open.store(false, Ordering::SeqCst);
            let _ = old_events.send(AgentEvent::Closed("superseded".to_string()));
        }

        let link = Arc::new(MockLink {
            host_id,
            connector: self.clone(),
            events: events_tx,
            open,
        });

        Ok(AgentSession {
            link,
            startup: StartupInfo {
                host_id,
                name: host.name.clone(),
                version: "mock".to_string(),
                capabilities: vec!["mock".to_string()],
            },
            events: events_rx,
        })
    }

    async fn reachability(&self, host: &HostRecord) -> HostLiveness {
        self.with_host(host.host_id, |h| h.liveness)
    }
}

struct MockLink {
    host_id: i64,
    connector: MockConnector,
    events: mpsc::UnboundedSender<AgentEvent>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl AgentLink for MockLink {
    async fn send(&self, request: AgentRequest) -> Result<(), CoreError> {
        if !self.is_open() {
            return Err(CoreError::AgentUnavailable {
                host_id: self.host_id,
                reason: "link closed".to_string(),
            });
        }

        let (behavior, responder, delay) = self.connector.with_host(self.host_id, |h| {
            h.sent.push(request.clone());
            (h.behavior, h.responder.clone(), h.delay.clone())
        });

        match behavior {
            MockBehavior::FailWrites => {
                self.open.store(false, Ordering::SeqCst);
                Err(CoreError::AgentUnavailable {
                    host_id: self.host_id,
                    reason: "broken pipe".to_string(),
                })
            }
            MockBehavior::Silent => Ok(()),
            MockBehavior::Answer => {
                let answers = request
                    .commands
                    .iter()
                    .map(|c| match &responder {
                        Some(r) => r(c),
                        None => Answer::success(c.name.clone(), Vec::new()),
                    })
                    .collect();
                let answer = AgentAnswer {
                    host_id: self.host_id,
                    sequence: request.sequence,
                    answers,
                };
                let delay = delay.map(|d| d(&request)).unwrap_or_default();
                if delay.is_zero() {
                    let _ = self.events.send(AgentEvent::Answer(answer));
                } else {
                    let events = self.events.clone();
                    let open = self.open.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if open.load(Ordering::SeqCst) {
                            let _ = events.send(AgentEvent::Answer(answer));
                        }
                    });
                }
                Ok(())
            }
        }
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(AgentEvent::Closed("closed by node".to_string()));
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
