// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work handler interface and execution context.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cirrus_protocol::messages::{AgentAnswer, Command};
use tracing::info;

use super::params::{JobParams, ParamKey};
use crate::agent::AgentManager;
use crate::error::CoreError;
use crate::persistence::Persistence;

/// What crash recovery does with a job whose owner died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPolicy {
    /// Run the job again on the recovering node.
    Rerun,
    /// Record the job as failed.
    MarkFailed,
}

/// A lifecycle operation that can run as a work job.
///
/// `execute` receives parameters already validated against
/// [`required_params`](Self::required_params) and
/// [`optional_params`](Self::optional_params).
#[async_trait]
pub trait WorkHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn required_params(&self) -> &'static [ParamKey];

    fn optional_params(&self) -> &'static [ParamKey] {
        &[]
    }

    fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy::MarkFailed
    }

    async fn execute(
        &self,
        ctx: &JobContext,
        params: &JobParams,
    ) -> Result<serde_json::Value, CoreError>;
}

/// What a handler can see and use while running one job.
pub struct JobContext {
    job_id: String,
    resource_kind: String,
    resource_id: String,
    attempt: i32,
    persistence: Arc<dyn Persistence>,
    agents: Arc<AgentManager>,
}

impl JobContext {
    pub fn new(
        job_id: impl Into<String>,
        resource_kind: impl Into<String>,
        resource_id: impl Into<String>,
        attempt: i32,
        persistence: Arc<dyn Persistence>,
        agents: Arc<AgentManager>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            resource_kind: resource_kind.into(),
            resource_id: resource_id.into(),
            attempt,
            persistence,
            agents,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn resource_kind(&self) -> &str {
        &self.resource_kind
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// 1 on first execution, incremented by every recovery.
    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn agents(&self) -> &Arc<AgentManager> {
        &self.agents
    }

    pub async fn is_cancel_requested(&self) -> Result<bool, CoreError> {
        Ok(self
            .persistence
            .get_job(&self.job_id)
            .await?
            .is_some_and(|j| j.cancel_requested))
    }

    /// Fail with [`CoreError::Cancelled`] if cancellation was requested.
    /// Handlers call this between agent commands.
    pub async fn check_cancelled(&self) -> Result<(), CoreError> {
        if self.is_cancel_requested().await? {
            info!(job_id = %self.job_id, "Job cancelled before next agent command");
            return Err(CoreError::Cancelled {
                job_id: self.job_id.clone(),
            });
        }
        Ok(())
    }

    /// Send one command batch to a host through the agent layer.
    pub async fn send(
        &self,
        host_id: i64,
        commands: Vec<Command>,
        timeout: Duration,
    ) -> Result<AgentAnswer, CoreError> {
        self.agents.send(host_id, commands, timeout).await
    }
}
