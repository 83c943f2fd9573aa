// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! A node's handle on one host's command channel.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use cirrus_protocol::messages::AgentAnswer;
use tokio::sync::oneshot;
use tracing::warn;

use super::link::AgentLink;
use super::listeners::AnswerListener;
use crate::error::CoreError;

/// How an outstanding request reports back.
pub(crate) enum Completion {
    Blocking(oneshot::Sender<Result<AgentAnswer, CoreError>>),
    Listener(Arc<dyn AnswerListener>),
}

/// A command batch waiting for its answer.
pub struct PendingRequest {
    pub sequence: u64,
    /// Command names, for logging.
    pub commands: Vec<String>,
    /// None when the timeout runs past the clock's range.
    pub deadline: Option<Instant>,
    completion: Completion,
}

impl PendingRequest {
    pub(crate) fn new(
        sequence: u64,
        commands: Vec<String>,
        timeout: Duration,
        completion: Completion,
    ) -> Self {
        Self {
            sequence,
            commands,
            deadline: Instant::now().checked_add(timeout),
            completion,
        }
    }

    pub(crate) fn complete(self, host_id: i64, result: Result<AgentAnswer, CoreError>) {
        match self.completion {
            Completion::Blocking(tx) => {
                // Receiver gone means the caller already timed out.
                let _ = tx.send(result);
            }
            Completion::Listener(listener) => listener.on_answer(host_id, self.sequence, result),
        }
    }
}

/// Whether this node holds the host's transport or relays through its owner.
#[derive(Clone)]
pub enum AttacheMode {
    Direct { link: Arc<dyn AgentLink> },
    Forward { owner_node: String },
}

struct AttacheState {
    mode: AttacheMode,
    ready: bool,
    pending: BTreeMap<u64, PendingRequest>,
}

/// One per (node, host). Sequence numbers are unique per attache and
/// strictly increasing.
pub struct Attache {
    host_id: i64,
    name: String,
    sequence: AtomicU64,
    state: Mutex<AttacheState>,
}

impl std::fmt::Debug for Attache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Attache")
            .field("host_id", &self.host_id)
            .field("name", &self.name)
            .field("forward", &matches!(state.mode, AttacheMode::Forward { .. }))
            .field("ready", &state.ready)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Attache {
    pub fn direct(host_id: i64, name: impl Into<String>, link: Arc<dyn AgentLink>) -> Self {
        Self::with_mode(host_id, name.into(), AttacheMode::Direct { link }, false)
    }

    /// Forwarding attaches are usable immediately; readiness is the owner's concern.
    pub fn forwarding(host_id: i64, name: impl Into<String>, owner_node: impl Into<String>) -> Self {
        Self::with_mode(
            host_id,
            name.into(),
            AttacheMode::Forward {
                owner_node: owner_node.into(),
            },
            true,
        )
    }

    fn with_mode(host_id: i64, name: String, mode: AttacheMode, ready: bool) -> Self {
        Self {
            host_id,
            name,
            sequence: AtomicU64::new(0),
            state: Mutex::new(AttacheState {
                mode,
                ready,
                pending: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AttacheState> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn host_id(&self) -> i64 {
        self.host_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> AttacheMode {
        self.lock().mode.clone()
    }

    pub fn is_forward(&self) -> bool {
        matches!(self.lock().mode, AttacheMode::Forward { .. })
    }

    pub fn link(&self) -> Option<Arc<dyn AgentLink>> {
        match &self.lock().mode {
            AttacheMode::Direct { link } => Some(link.clone()),
            AttacheMode::Forward { .. } => None,
        }
    }

    pub fn owner_node(&self) -> Option<String> {
        match &self.lock().mode {
            AttacheMode::Forward { owner_node } => Some(owner_node.clone()),
            AttacheMode::Direct { .. } => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    pub fn set_ready(&self, ready: bool) {
        self.lock().ready = ready;
    }

    /// Turn a forwarding attache into a direct one. Not ready until the
    /// connect listeners have run.
    pub fn promote(&self, link: Arc<dyn AgentLink>) {
        let mut state = self.lock();
        state.mode = AttacheMode::Direct { link };
        state.ready = false;
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn register(&self, request: PendingRequest) {
        let mut state = self.lock();
        if let Some(previous) = state.pending.insert(request.sequence, request) {
            warn!(
                host_id = self.host_id,
                sequence = previous.sequence,
                "Replaced outstanding request with duplicate sequence"
            );
        }
    }

    /// Remove the request for `sequence`, if it is still outstanding.
    pub(crate) fn take(&self, sequence: u64) -> Option<PendingRequest> {
        self.lock().pending.remove(&sequence)
    }

    /// Remove every outstanding request, in sequence order.
    pub(crate) fn drain(&self) -> Vec<PendingRequest> {
        let mut state = self.lock();
        std::mem::take(&mut state.pending).into_values().collect()
    }

    pub fn pending_sequences(&self) -> Vec<u64> {
        self.lock().pending.keys().copied().collect()
    }
}
