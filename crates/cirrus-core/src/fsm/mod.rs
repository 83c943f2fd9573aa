// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence-backed finite state machines.
//!
//! A [`StateMachine`] is an immutable `(state, event) → state` table for one
//! [`ResourceKind`] plus an ordered list of [`TransitionListener`]s. It never
//! owns resource storage; every transition is a conditional update through
//! [`Persistence::update_resource_state`], so two nodes racing on the same
//! resource see exactly one winner and one [`CoreError::StaleResource`].
//!
//! ```ignore
//! let vm = kinds::vm_machine().build()?;
//! let snapshot = vm.load(store.as_ref(), "vm-1").await?;
//! let starting = vm.transition(store.as_ref(), &snapshot, VmEvent::Start).await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::persistence::{Persistence, ResourceRecord};

pub use kinds::{
    HostEvent, HostStatus, NetworkEvent, NetworkState, VmEvent, VmState, VolumeEvent, VolumeState,
};

/// A state or event name with a stable persisted form.
pub trait Token:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    fn as_str(&self) -> &'static str;

    fn parse(s: &str) -> Option<Self>;
}

/// Declares a state or event enum together with its persisted names.
macro_rules! token_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Every value, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl $crate::fsm::Token for $name {
            fn as_str(&self) -> &'static str {
                $name::as_str(self)
            }

            fn parse(s: &str) -> Option<Self> {
                $name::parse(s)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                $name::parse(s)
                    .ok_or_else(|| format!("Unknown {}: {}", stringify!($name), s))
            }
        }
    };
}

pub mod kinds;

/// Kinds of resources that carry a lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Vm,
    Host,
    Network,
    Volume,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vm => "vm",
            Self::Host => "host",
            Self::Network => "network",
            Self::Volume => "volume",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vm" => Ok(Self::Vm),
            "host" => Ok(Self::Host),
            "network" => Ok(Self::Network),
            "volume" => Ok(Self::Volume),
            _ => Err(format!("Unknown resource kind: {}", s)),
        }
    }
}

/// Typed snapshot of a resource at a given version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<S> {
    pub id: String,
    pub state: S,
    pub update_version: i64,
    pub payload: Option<String>,
}

impl<S: Token> Versioned<S> {
    fn from_record(kind: ResourceKind, record: ResourceRecord) -> Result<Self, CoreError> {
        let state = S::parse(&record.state).ok_or_else(|| CoreError::Database {
            operation: "decode_state".to_string(),
            details: format!(
                "{} '{}' has unknown state '{}'",
                kind, record.resource_id, record.state
            ),
        })?;
        Ok(Self {
            id: record.resource_id,
            state,
            update_version: record.update_version,
            payload: record.payload,
        })
    }

    /// Decode the JSON payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<Option<T>, CoreError> {
        match &self.payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }
}

/// One attempted transition as seen by listeners.
#[derive(Debug, Clone)]
pub struct Transition<S, E> {
    pub kind: ResourceKind,
    pub resource_id: String,
    pub from: S,
    pub event: E,
    pub to: S,
    /// Version the caller read. The committed version is `version + 1`.
    pub version: i64,
}

/// Callback invoked around transitions, in registration order.
#[async_trait]
pub trait TransitionListener<S: Token, E: Token>: Send + Sync {
    /// Name reported in [`CoreError::TransitionVetoed`] and in logs.
    fn name(&self) -> &str;

    /// Return `false` to veto. Runs before anything is persisted.
    fn pre_transition(&self, _transition: &Transition<S, E>) -> bool {
        true
    }

    /// Runs after the conditional update. Errors are logged by the engine and
    /// never undo a committed transition.
    async fn post_transition(
        &self,
        _transition: &Transition<S, E>,
        _success: bool,
    ) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Builder for [`StateMachine`].
pub struct StateMachineBuilder<S: Token, E: Token> {
    kind: ResourceKind,
    initial: S,
    edges: Vec<(S, E, S)>,
    listeners: Vec<Arc<dyn TransitionListener<S, E>>>,
}

impl<S: Token, E: Token> StateMachineBuilder<S, E> {
    pub fn edge(mut self, from: S, event: E, to: S) -> Self {
        self.edges.push((from, event, to));
        self
    }

    /// Append a listener. Listeners run in the order they are added.
    pub fn listener(mut self, listener: Arc<dyn TransitionListener<S, E>>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Build the machine. Fails if any `(state, event)` maps to two different
    /// next states.
    pub fn build(self) -> Result<StateMachine<S, E>, CoreError> {
        let mut table = HashMap::with_capacity(self.edges.len());
        for (from, event, to) in self.edges {
            if let Some(existing) = table.insert((from, event), to)
                && existing != to
            {
                return Err(CoreError::Validation {
                    field: "transition_table".to_string(),
                    message: format!(
                        "{}: ({}, {}) maps to both {} and {}",
                        self.kind, from, event, existing, to
                    ),
                });
            }
        }
        Ok(StateMachine {
            kind: self.kind,
            initial: self.initial,
            table,
            listeners: self.listeners,
        })
    }
}

/// Immutable transition table plus listeners for one resource kind.
pub struct StateMachine<S: Token, E: Token> {
    kind: ResourceKind,
    initial: S,
    table: HashMap<(S, E), S>,
    listeners: Vec<Arc<dyn TransitionListener<S, E>>>,
}

impl<S: Token, E: Token> fmt::Debug for StateMachine<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("kind", &self.kind)
            .field("initial", &self.initial)
            .field("edges", &self.table.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<S: Token, E: Token> StateMachine<S, E> {
    pub fn builder(kind: ResourceKind, initial: S) -> StateMachineBuilder<S, E> {
        StateMachineBuilder {
            kind,
            initial,
            edges: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn initial_state(&self) -> S {
        self.initial
    }

    pub fn next_state(&self, state: S, event: E) -> Option<S> {
        self.table.get(&(state, event)).copied()
    }

    /// A state with no outgoing edge.
    pub fn is_terminal(&self, state: S) -> bool {
        !self.table.keys().any(|(from, _)| *from == state)
    }

    /// Events accepted in `state`.
    pub fn events_from(&self, state: S) -> Vec<E> {
        self.table
            .keys()
            .filter(|(from, _)| *from == state)
            .map(|(_, event)| *event)
            .collect()
    }

    /// Persist a new resource in the initial state at version 0.
    pub async fn create(
        &self,
        store: &dyn Persistence,
        id: &str,
        payload: Option<&str>,
    ) -> Result<Versioned<S>, CoreError> {
        let record = store
            .insert_resource(self.kind.as_str(), id, self.initial.as_str(), payload)
            .await?;
        debug!(kind = %self.kind, resource_id = %id, state = %self.initial, "Resource created");
        Versioned::from_record(self.kind, record)
    }

    pub async fn load(&self, store: &dyn Persistence, id: &str) -> Result<Versioned<S>, CoreError> {
        let record = store
            .get_resource(self.kind.as_str(), id)
            .await?
            .ok_or_else(|| CoreError::ResourceNotFound {
                kind: self.kind.as_str().to_string(),
                resource_id: id.to_string(),
            })?;
        Versioned::from_record(self.kind, record)
    }

    /// Load the resource, or `None` when it does not exist.
    pub async fn find(
        &self,
        store: &dyn Persistence,
        id: &str,
    ) -> Result<Option<Versioned<S>>, CoreError> {
        match store.get_resource(self.kind.as_str(), id).await? {
            Some(record) => Ok(Some(Versioned::from_record(self.kind, record)?)),
            None => Ok(None),
        }
    }

    /// Apply `event` to the snapshot. Never retries; a concurrent change
    /// surfaces as [`CoreError::StaleResource`].
    pub async fn transition(
        &self,
        store: &dyn Persistence,
        resource: &Versioned<S>,
        event: E,
    ) -> Result<Versioned<S>, CoreError> {
        self.apply(store, resource, event, None).await
    }

    /// Like [`transition`](Self::transition), also replacing the payload in the
    /// same conditional update.
    pub async fn transition_with_payload(
        &self,
        store: &dyn Persistence,
        resource: &Versioned<S>,
        event: E,
        payload: &str,
    ) -> Result<Versioned<S>, CoreError> {
        self.apply(store, resource, event, Some(payload)).await
    }

    async fn apply(
        &self,
        store: &dyn Persistence,
        resource: &Versioned<S>,
        event: E,
        payload: Option<&str>,
    ) -> Result<Versioned<S>, CoreError> {
        let to = self
            .next_state(resource.state, event)
            .ok_or_else(|| CoreError::IllegalTransition {
                kind: self.kind.as_str().to_string(),
                resource_id: resource.id.clone(),
                state: resource.state.as_str().to_string(),
                event: event.as_str().to_string(),
            })?;

        let transition = Transition {
            kind: self.kind,
            resource_id: resource.id.clone(),
            from: resource.state,
            event,
            to,
            version: resource.update_version,
        };

        for listener in &self.listeners {
            if !listener.pre_transition(&transition) {
                debug!(
                    kind = %self.kind,
                    resource_id = %resource.id,
                    event = %event,
                    listener = listener.name(),
                    "Transition vetoed"
                );
                return Err(CoreError::TransitionVetoed {
                    kind: self.kind.as_str().to_string(),
                    resource_id: resource.id.clone(),
                    event: event.as_str().to_string(),
                    listener: listener.name().to_string(),
                });
            }
        }

        let updated = store
            .update_resource_state(
                self.kind.as_str(),
                &resource.id,
                resource.state.as_str(),
                resource.update_version,
                to.as_str(),
                payload,
            )
            .await?;

        self.notify_post(&transition, updated).await;

        if !updated {
            return Err(CoreError::StaleResource {
                kind: self.kind.as_str().to_string(),
                resource_id: resource.id.clone(),
                state: resource.state.as_str().to_string(),
                version: resource.update_version,
            });
        }

        debug!(
            kind = %self.kind,
            resource_id = %resource.id,
            from = %resource.state,
            event = %event,
            to = %to,
            version = resource.update_version + 1,
            "Transition committed"
        );

        Ok(Versioned {
            id: resource.id.clone(),
            state: to,
            update_version: resource.update_version + 1,
            payload: payload
                .map(str::to_string)
                .or_else(|| resource.payload.clone()),
        })
    }

    async fn notify_post(&self, transition: &Transition<S, E>, success: bool) {
        for listener in &self.listeners {
            if let Err(e) = listener.post_transition(transition, success).await {
                warn!(
                    kind = %transition.kind,
                    resource_id = %transition.resource_id,
                    listener = listener.name(),
                    error = %e,
                    "Post-transition listener failed"
                );
            }
        }
    }
}
