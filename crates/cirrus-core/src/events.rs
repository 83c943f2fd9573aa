// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Publication of committed transitions.
//!
//! Sinks are fire-and-forget. A failing sink is logged and never reaches the
//! caller of the transition that produced the event.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::CoreError;
use crate::fsm::{ResourceKind, Token, Transition, TransitionListener};
use crate::persistence::{Persistence, ResourceEventRecord};

/// A committed state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEvent {
    pub kind: ResourceKind,
    pub resource_id: String,
    pub from_state: String,
    pub event: String,
    pub to_state: String,
    /// Version after the transition.
    pub update_version: i64,
    pub node_id: Option<String>,
    pub at: DateTime<Utc>,
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: ResourceEvent);
}

/// Logs every event at info level.
#[derive(Debug, Default, Clone)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: ResourceEvent) {
        info!(
            kind = %event.kind,
            resource_id = %event.resource_id,
            from = %event.from_state,
            event = %event.event,
            to = %event.to_state,
            version = event.update_version,
            "Resource transitioned"
        );
    }
}

/// Appends events to `resource_events` on a spawned task.
#[derive(Clone)]
pub struct PersistentEventSink {
    persistence: Arc<dyn Persistence>,
}

impl PersistentEventSink {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }
}

impl EventSink for PersistentEventSink {
    fn publish(&self, event: ResourceEvent) {
        let persistence = self.persistence.clone();
        tokio::spawn(async move {
            let record = ResourceEventRecord {
                id: None,
                kind: event.kind.as_str().to_string(),
                resource_id: event.resource_id,
                from_state: event.from_state,
                event: event.event,
                to_state: event.to_state,
                update_version: event.update_version,
                node_id: event.node_id,
                created_at: event.at,
            };
            if let Err(e) = persistence.insert_resource_event(&record).await {
                warn!(
                    kind = %record.kind,
                    resource_id = %record.resource_id,
                    error = %e,
                    "Failed to persist resource event"
                );
            }
        });
    }
}

/// Fans out to several sinks in order.
#[derive(Default, Clone)]
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CompositeEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for CompositeEventSink {
    fn publish(&self, event: ResourceEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }
}

/// Post-transition listener that publishes successful transitions.
pub struct EventPublishingListener {
    sink: Arc<dyn EventSink>,
    node_id: Option<String>,
}

impl EventPublishingListener {
    pub fn new(sink: Arc<dyn EventSink>, node_id: Option<String>) -> Self {
        Self { sink, node_id }
    }
}

#[async_trait]
impl<S: Token, E: Token> TransitionListener<S, E> for EventPublishingListener {
    fn name(&self) -> &str {
        "event-publisher"
    }

    async fn post_transition(
        &self,
        transition: &Transition<S, E>,
        success: bool,
    ) -> Result<(), CoreError> {
        if success {
            self.sink.publish(ResourceEvent {
                kind: transition.kind,
                resource_id: transition.resource_id.clone(),
                from_state: transition.from.as_str().to_string(),
                event: transition.event.as_str().to_string(),
                to_state: transition.to.as_str().to_string(),
                update_version: transition.version + 1,
                node_id: self.node_id.clone(),
                at: Utc::now(),
            });
        }
        Ok(())
    }
}
