// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admission and execution of work jobs.
//!
//! Admission is an insert guarded by a partial unique index on active jobs per
//! resource, so at most one lifecycle operation per resource is queued or
//! running across the whole cluster. Execution runs on a bounded pool and
//! records the terminal status exactly once through a status CAS.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, Semaphore, watch};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::JobStatus;
use super::handler::{JobContext, RecoveryPolicy, WorkHandler};
use super::outcome::{JobResult, Outcome};
use super::params::JobParams;
use crate::agent::AgentManager;
use crate::error::CoreError;
use crate::fsm::ResourceKind;
use crate::persistence::{Persistence, WorkJobRecord, liveness_cutoff};

/// Configuration for the job dispatcher.
#[derive(Debug, Clone)]
pub struct JobDispatcherConfig {
    /// Jobs executing at the same time on this node.
    pub max_workers: usize,
    /// Store polling interval for outcomes of jobs running elsewhere.
    pub poll_interval: Duration,
    /// Interval between orphaned job scans.
    pub recovery_interval: Duration,
    /// Heartbeat age after which a job's owner is considered dead.
    pub node_timeout: Duration,
}

impl Default for JobDispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: 16,
            poll_interval: Duration::from_millis(500),
            recovery_interval: Duration::from_secs(30),
            node_timeout: Duration::from_secs(60),
        }
    }
}

/// A lifecycle operation request.
#[derive(Debug, Clone)]
pub struct SubmitJob {
    pub account_id: String,
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    /// Registered handler name.
    pub handler: String,
    pub params: JobParams,
}

impl SubmitJob {
    pub fn new(
        resource_kind: ResourceKind,
        resource_id: impl Into<String>,
        handler: impl Into<String>,
        params: JobParams,
    ) -> Self {
        Self {
            account_id: "system".to_string(),
            resource_kind,
            resource_id: resource_id.into(),
            handler: handler.into(),
            params,
        }
    }

    pub fn account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self
    }
}

/// Jobs taken over by one recovery pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub rerun: Vec<String>,
    pub failed: Vec<String>,
}

/// Builder for [`JobDispatcher`].
pub struct JobDispatcherBuilder {
    node_id: String,
    persistence: Arc<dyn Persistence>,
    agents: Arc<AgentManager>,
    handlers: HashMap<&'static str, Arc<dyn WorkHandler>>,
    config: JobDispatcherConfig,
}

impl JobDispatcherBuilder {
    pub fn handler(mut self, handler: Arc<dyn WorkHandler>) -> Self {
        self.handlers.insert(handler.name(), handler);
        self
    }

    pub fn handlers(mut self, handlers: impl IntoIterator<Item = Arc<dyn WorkHandler>>) -> Self {
        for handler in handlers {
            self.handlers.insert(handler.name(), handler);
        }
        self
    }

    pub fn config(mut self, config: JobDispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Arc<JobDispatcher> {
        let permits = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        Arc::new_cyclic(|me| JobDispatcher {
            node_id: self.node_id,
            persistence: self.persistence,
            agents: self.agents,
            handlers: self.handlers,
            config: self.config,
            permits,
            watchers: Mutex::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
            me: me.clone(),
        })
    }
}

/// Per-node job admission, execution and crash recovery.
pub struct JobDispatcher {
    node_id: String,
    persistence: Arc<dyn Persistence>,
    agents: Arc<AgentManager>,
    handlers: HashMap<&'static str, Arc<dyn WorkHandler>>,
    config: JobDispatcherConfig,
    permits: Arc<Semaphore>,
    /// Result channels of jobs executing in this process.
    watchers: Mutex<HashMap<String, watch::Sender<Option<JobResult>>>>,
    shutdown: Arc<Notify>,
    me: Weak<JobDispatcher>,
}

impl JobDispatcher {
    pub fn builder(
        node_id: impl Into<String>,
        persistence: Arc<dyn Persistence>,
        agents: Arc<AgentManager>,
    ) -> JobDispatcherBuilder {
        JobDispatcherBuilder {
            node_id: node_id.into(),
            persistence,
            agents,
            handlers: HashMap::new(),
            config: JobDispatcherConfig::default(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Registered handler names, sorted.
    pub fn handler_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<String, watch::Sender<Option<JobResult>>>> {
        self.watchers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn watch_job(&self, job_id: &str) -> watch::Receiver<Option<JobResult>> {
        let mut watchers = self.watchers();
        match watchers.get(job_id) {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = watch::channel(None);
                watchers.insert(job_id.to_string(), tx);
                rx
            }
        }
    }

    fn publish(&self, job_id: &str, result: JobResult) {
        if let Some(tx) = self.watchers().remove(job_id) {
            tx.send_replace(Some(result));
        }
    }

    fn outcome_handle(&self, job_id: &str, local: Option<watch::Receiver<Option<JobResult>>>) -> Outcome {
        Outcome::new(
            job_id.to_string(),
            self.persistence.clone(),
            self.config.poll_interval,
            local,
        )
    }

    /// Admit a job and start executing it.
    ///
    /// Unknown handlers and invalid parameters are [`CoreError::Validation`];
    /// an active job on the same resource is [`CoreError::ConcurrentOperation`].
    #[instrument(skip(self, request), fields(handler = %request.handler, resource_id = %request.resource_id))]
    pub async fn submit(&self, request: SubmitJob) -> Result<Outcome, CoreError> {
        let handler = self
            .handlers
            .get(request.handler.as_str())
            .ok_or_else(|| CoreError::Validation {
                field: "handler".to_string(),
                message: format!("unknown handler '{}'", request.handler),
            })?
            .clone();
        request
            .params
            .validate(handler.required_params(), handler.optional_params())?;

        let record = WorkJobRecord {
            job_id: Uuid::new_v4().to_string(),
            account_id: request.account_id,
            resource_kind: request.resource_kind.as_str().to_string(),
            resource_id: request.resource_id,
            handler: handler.name().to_string(),
            params: request.params.to_json()?,
            status: JobStatus::Queued.as_str().to_string(),
            result: None,
            error: None,
            owner_node: self.node_id.clone(),
            cancel_requested: false,
            attempt: 1,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        if let Err(e) = self.persistence.insert_job(&record).await {
            if matches!(e, CoreError::ConcurrentOperation { .. }) {
                info!(resource_id = %record.resource_id, "Job rejected, resource busy");
            }
            return Err(e);
        }
        info!(job_id = %record.job_id, attempt = record.attempt, "Job queued");

        let rx = self.watch_job(&record.job_id);
        let outcome = self.outcome_handle(&record.job_id, Some(rx));
        self.spawn_execution(record, handler);
        Ok(outcome)
    }

    /// Outcome of any job, including ones owned by other nodes.
    pub async fn outcome(&self, job_id: &str) -> Result<Outcome, CoreError> {
        let local = self.watchers().get(job_id).map(|tx| tx.subscribe());
        if local.is_none() && self.persistence.get_job(job_id).await?.is_none() {
            return Err(CoreError::JobNotFound {
                job_id: job_id.to_string(),
            });
        }
        Ok(self.outcome_handle(job_id, local))
    }

    /// Flag a job for cancellation. Returns false when it already finished.
    /// A command already sent to a host is never interrupted.
    pub async fn request_cancel(&self, job_id: &str) -> Result<bool, CoreError> {
        if self.persistence.request_job_cancel(job_id).await? {
            info!(job_id, "Job cancellation requested");
            return Ok(true);
        }
        match self.persistence.get_job(job_id).await? {
            Some(_) => Ok(false),
            None => Err(CoreError::JobNotFound {
                job_id: job_id.to_string(),
            }),
        }
    }

    fn spawn_execution(&self, record: WorkJobRecord, handler: Arc<dyn WorkHandler>) {
        let Some(me) = self.me.upgrade() else {
            warn!(job_id = %record.job_id, "Dispatcher dropped, job left queued");
            return;
        };
        tokio::spawn(async move { me.execute(record, handler).await });
    }

    async fn execute(&self, record: WorkJobRecord, handler: Arc<dyn WorkHandler>) {
        let job_id = record.job_id.clone();
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            warn!(job_id = %job_id, "Worker pool closed, job left queued");
            return;
        };

        match self
            .persistence
            .mark_job_running(&job_id, &self.node_id, Utc::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job_id, "Job no longer queued for this node");
                self.watchers().remove(&job_id);
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to start job");
                self.finish(&job_id, Err(e)).await;
                return;
            }
        }
        info!(job_id = %job_id, handler = handler.name(), attempt = record.attempt, "Job running");

        let ctx = JobContext::new(
            job_id.clone(),
            record.resource_kind.clone(),
            record.resource_id.clone(),
            record.attempt,
            self.persistence.clone(),
            self.agents.clone(),
        );
        let result = match JobParams::from_json(&record.params) {
            Ok(params) => match ctx.check_cancelled().await {
                Ok(()) => handler.execute(&ctx, &params).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        self.finish(&job_id, result).await;
    }

    async fn finish(&self, job_id: &str, result: JobResult) {
        let now = Utc::now();
        let recorded = match &result {
            Ok(value) => {
                let body = value.to_string();
                self.persistence
                    .complete_job(job_id, JobStatus::Succeeded.as_str(), Some(&body), None, now)
                    .await
            }
            Err(e) => {
                let body = serde_json::to_string(e).unwrap_or_default();
                self.persistence
                    .complete_job(job_id, JobStatus::Failed.as_str(), None, Some(&body), now)
                    .await
            }
        };

        match recorded {
            Ok(true) => match &result {
                Ok(_) => info!(job_id, "Job succeeded"),
                Err(e) => info!(job_id, error_code = e.error_code(), error = %e, "Job failed"),
            },
            Ok(false) => warn!(job_id, "Job already finished, result not recorded"),
            Err(e) => error!(job_id, error = %e, "Failed to record job result"),
        }
        self.publish(job_id, result);
    }

    /// Take over active jobs whose owner node is gone.
    ///
    /// Each job is moved to this node with an owner CAS; a job another node
    /// took first is skipped. The handler's [`RecoveryPolicy`] then decides
    /// between running it again and recording it as failed.
    pub async fn recover_orphaned_jobs(&self) -> Result<RecoveryReport, CoreError> {
        let cutoff = liveness_cutoff(Utc::now(), self.config.node_timeout);
        let orphans = self.persistence.list_orphaned_jobs(cutoff).await?;
        let mut report = RecoveryReport::default();

        for orphan in orphans {
            if orphan.owner_node == self.node_id && self.watchers().contains_key(&orphan.job_id) {
                continue;
            }
            match self
                .persistence
                .reassign_job(&orphan.job_id, &orphan.owner_node, &self.node_id)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job_id = %orphan.job_id, "Orphaned job taken by another node");
                    continue;
                }
                Err(e) => {
                    warn!(job_id = %orphan.job_id, error = %e, "Failed to take over orphaned job");
                    continue;
                }
            }
            let dead_owner = orphan.owner_node.clone();
            let record = match self.persistence.get_job(&orphan.job_id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(job_id = %orphan.job_id, error = %e, "Failed to load reassigned job");
                    continue;
                }
            };

            let handler = self.handlers.get(record.handler.as_str()).cloned();
            match handler {
                Some(handler) if handler.recovery_policy() == RecoveryPolicy::Rerun => {
                    info!(job_id = %record.job_id, from = %dead_owner, attempt = record.attempt, "Rerunning orphaned job");
                    report.rerun.push(record.job_id.clone());
                    self.watch_job(&record.job_id);
                    self.spawn_execution(record, handler);
                }
                _ => {
                    warn!(job_id = %record.job_id, from = %dead_owner, was = %orphan.status, "Failing orphaned job");
                    report.failed.push(record.job_id.clone());
                    let error = CoreError::ResourceUnavailable {
                        resource: format!("{}/{}", record.resource_kind, record.resource_id),
                        reason: format!(
                            "owner node {} died while the job was {}",
                            dead_owner, orphan.status
                        ),
                    };
                    self.finish(&record.job_id, Err(error)).await;
                }
            }
        }

        if !report.rerun.is_empty() || !report.failed.is_empty() {
            info!(rerun = report.rerun.len(), failed = report.failed.len(), "Orphaned jobs recovered");
        }
        Ok(report)
    }

    /// Periodically recover orphaned jobs until shutdown.
    pub async fn run(&self) {
        info!(
            recovery_interval_secs = self.config.recovery_interval.as_secs(),
            max_workers = self.config.max_workers,
            "Job recovery started"
        );

        loop {
            if let Err(e) = self.recover_orphaned_jobs().await {
                error!(error = %e, "Failed to recover orphaned jobs");
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Job recovery received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.recovery_interval) => {}
            }
        }

        info!("Job recovery stopped");
    }
}
