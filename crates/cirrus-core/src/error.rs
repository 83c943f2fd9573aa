// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cirrus-core.
//!
//! One error type covers the state machine engine, the agent layer, cluster
//! forwarding and work jobs. It is serializable so a failed job can record it
//! and an [`Outcome`](crate::jobs::Outcome) on any node can re-raise the same
//! variant, and it maps to RPC errors for the peer protocol.

use cirrus_protocol::FrameError;
use cirrus_protocol::messages::RpcError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by the control-plane core.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
#[non_exhaustive]
pub enum CoreError {
    /// No edge for `(state, event)` in the kind's table.
    #[error("illegal transition for {kind} '{resource_id}': no edge for event {event} from {state}")]
    IllegalTransition {
        kind: String,
        resource_id: String,
        state: String,
        event: String,
    },

    /// A pre-transition listener rejected the change; nothing was persisted.
    #[error("transition {event} on {kind} '{resource_id}' vetoed by {listener}")]
    TransitionVetoed {
        kind: String,
        resource_id: String,
        event: String,
        listener: String,
    },

    /// The conditional update matched no row: someone else moved the resource first.
    #[error("stale {kind} '{resource_id}': expected {state} at version {version}")]
    StaleResource {
        kind: String,
        resource_id: String,
        state: String,
        version: i64,
    },

    #[error("{kind} '{resource_id}' not found")]
    ResourceNotFound { kind: String, resource_id: String },

    #[error("host {host_id} not found")]
    HostNotFound { host_id: i64 },

    /// Transport failure or unreachable forwarding target. Safe to retry once
    /// the host is confirmed reconnected.
    #[error("agent for host {host_id} unavailable: {reason}")]
    AgentUnavailable { host_id: i64, reason: String },

    /// No answer in time. The outcome on the host is unknown.
    #[error("operation on host {host_id} timed out after {timeout_ms}ms")]
    OperationTimedOut { host_id: i64, timeout_ms: u64 },

    /// A queued or running job already holds the resource.
    #[error("another operation is already in progress for {kind} '{resource_id}'")]
    ConcurrentOperation { kind: String, resource_id: String },

    #[error("insufficient capacity: {reason}")]
    InsufficientCapacity { reason: String },

    #[error("resource {resource} unavailable: {reason}")]
    ResourceUnavailable { resource: String, reason: String },

    #[error("job '{job_id}' not found")]
    JobNotFound { job_id: String },

    #[error("job '{job_id}' was cancelled")]
    Cancelled { job_id: String },

    #[error("validation error for '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("database error during '{operation}': {details}")]
    Database { operation: String, details: String },

    #[error("protocol error: {message}")]
    Protocol { message: String },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::TransitionVetoed { .. } => "TRANSITION_VETOED",
            Self::StaleResource { .. } => "STALE_RESOURCE",
            Self::ResourceNotFound { .. } => "RESOURCE_NOT_FOUND",
            Self::HostNotFound { .. } => "HOST_NOT_FOUND",
            Self::AgentUnavailable { .. } => "AGENT_UNAVAILABLE",
            Self::OperationTimedOut { .. } => "OPERATION_TIMED_OUT",
            Self::ConcurrentOperation { .. } => "CONCURRENT_OPERATION",
            Self::InsufficientCapacity { .. } => "INSUFFICIENT_CAPACITY",
            Self::ResourceUnavailable { .. } => "RESOURCE_UNAVAILABLE",
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::Cancelled { .. } => "CANCELLED",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
        }
    }

    /// Convert this error to an RpcError for peer responses.
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.error_code().to_string(),
            message: self.to_string(),
            details: serde_json::to_string(self).unwrap_or_default(),
        }
    }

    /// Rebuild an error received from a peer.
    ///
    /// Falls back to [`CoreError::Protocol`] when the peer sent no structured body.
    pub fn from_rpc_error(code: &str, message: &str, details: &str) -> Self {
        serde_json::from_str(details).unwrap_or_else(|_| Self::Protocol {
            message: format!("[{}] {}", code, message),
        })
    }

    /// True when the failure leaves the effect on the host undetermined.
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(self, Self::OperationTimedOut { .. })
    }

    /// Timeout error for `host_id`; the millisecond count saturates.
    pub fn timed_out(host_id: i64, timeout: std::time::Duration) -> Self {
        Self::OperationTimedOut {
            host_id,
            timeout_ms: duration_ms(timeout),
        }
    }

    pub(crate) fn database(operation: &str, err: impl std::fmt::Display) -> Self {
        Self::Database {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub(crate) fn duration_ms(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::database("query", err)
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::database("migrate", err)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::database("json", err)
    }
}

impl From<FrameError> for CoreError {
    fn from(err: FrameError) -> Self {
        CoreError::Protocol {
            message: err.to_string(),
        }
    }
}

/// True when a database error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}
