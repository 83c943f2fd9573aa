// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Callbacks for host connection events and asynchronous answers.

use async_trait::async_trait;
use cirrus_protocol::messages::{AgentAnswer, Command, StartupInfo};

use crate::error::CoreError;
use crate::fsm::HostStatus;
use crate::persistence::HostRecord;

/// Identifies a registered [`HostListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

/// Which callbacks a listener wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEventMask {
    pub connect: bool,
    pub disconnect: bool,
    pub command_before_send: bool,
}

impl HostEventMask {
    pub const ALL: Self = Self {
        connect: true,
        disconnect: true,
        command_before_send: true,
    };

    pub const CONNECTIONS: Self = Self {
        connect: true,
        disconnect: true,
        command_before_send: false,
    };
}

/// Returned by [`HostListener::on_connect`] to refuse a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFailure {
    /// A retriable failure tears the connection down and schedules a
    /// reconnect. A non-retriable one is treated as a setup error and the
    /// host is left disconnected.
    pub retriable: bool,
    pub reason: String,
}

impl ConnectionFailure {
    pub fn retriable(reason: impl Into<String>) -> Self {
        Self {
            retriable: true,
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            retriable: false,
            reason: reason.into(),
        }
    }
}

/// Subscriber to host connection lifecycle events.
///
/// Connect callbacks run in registration order on the connecting task; a
/// failure unwinds the listeners that already accepted the host by calling
/// their [`on_disconnect`](Self::on_disconnect).
#[async_trait]
pub trait HostListener: Send + Sync {
    fn name(&self) -> &str;

    async fn on_connect(
        &self,
        _host: &HostRecord,
        _startup: &StartupInfo,
    ) -> Result<(), ConnectionFailure> {
        Ok(())
    }

    async fn on_disconnect(&self, _host_id: i64, _status: Option<HostStatus>) {}

    /// Observes a batch just before it is written to a direct link.
    fn before_send(&self, _host_id: i64, _sequence: u64, _commands: &[Command]) {}
}

/// Completion callback for [`AgentManager::send_async`](super::AgentManager::send_async).
///
/// Invoked exactly once per accepted request, from the connection's dispatch
/// task (or the timeout task), with the answer or the failure.
pub trait AnswerListener: Send + Sync {
    fn on_answer(&self, host_id: i64, sequence: u64, result: Result<AgentAnswer, CoreError>);
}

impl<F> AnswerListener for F
where
    F: Fn(i64, u64, Result<AgentAnswer, CoreError>) + Send + Sync,
{
    fn on_answer(&self, host_id: i64, sequence: u64, result: Result<AgentAnswer, CoreError>) {
        self(host_id, sequence, result)
    }
}
