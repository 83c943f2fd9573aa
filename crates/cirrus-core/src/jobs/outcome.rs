// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Awaitable handle on a job's result.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use super::JobStatus;
use crate::error::CoreError;
use crate::persistence::{Persistence, WorkJobRecord};

pub(crate) type JobResult = Result<serde_json::Value, CoreError>;

/// Result of a job, resolved locally when the job runs in this process and
/// by polling the store otherwise.
#[derive(Clone)]
pub struct Outcome {
    job_id: String,
    persistence: Arc<dyn Persistence>,
    poll_interval: Duration,
    local: Option<watch::Receiver<Option<JobResult>>>,
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outcome")
            .field("job_id", &self.job_id)
            .field("local", &self.local.is_some())
            .finish()
    }
}

/// Terminal result recorded on a job row, or `None` while it is active.
pub(crate) fn resolve_record(record: &WorkJobRecord) -> Option<JobResult> {
    match JobStatus::parse(&record.status)? {
        JobStatus::Queued | JobStatus::Running => None,
        JobStatus::Succeeded => Some(Ok(record
            .result
            .as_deref()
            .and_then(|r| serde_json::from_str(r).ok())
            .unwrap_or(serde_json::Value::Null))),
        JobStatus::Failed => Some(Err(record
            .error
            .as_deref()
            .and_then(|e| serde_json::from_str::<CoreError>(e).ok())
            .unwrap_or_else(|| CoreError::Protocol {
                message: format!("job {} failed without a recorded error", record.job_id),
            }))),
    }
}

impl Outcome {
    pub(crate) fn new(
        job_id: String,
        persistence: Arc<dyn Persistence>,
        poll_interval: Duration,
        local: Option<watch::Receiver<Option<JobResult>>>,
    ) -> Self {
        Self {
            job_id,
            persistence,
            poll_interval,
            local,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn status(&self) -> Result<JobStatus, CoreError> {
        let record = self.record().await?;
        JobStatus::parse(&record.status).ok_or_else(|| CoreError::Protocol {
            message: format!("job {} has unknown status '{}'", self.job_id, record.status),
        })
    }

    async fn record(&self) -> Result<WorkJobRecord, CoreError> {
        self.persistence
            .get_job(&self.job_id)
            .await?
            .ok_or_else(|| CoreError::JobNotFound {
                job_id: self.job_id.clone(),
            })
    }

    /// The result without waiting; `None` while the job is active.
    pub async fn try_get(&self) -> Result<Option<serde_json::Value>, CoreError> {
        if let Some(rx) = &self.local {
            let published = rx.borrow().clone();
            if let Some(result) = published {
                return result.map(Some);
            }
        }
        match resolve_record(&self.record().await?) {
            Some(result) => result.map(Some),
            None => Ok(None),
        }
    }

    /// Wait for the job to finish. A failed job re-raises its recorded error.
    pub async fn get(&self) -> Result<serde_json::Value, CoreError> {
        if let Some(mut rx) = self.local.clone() {
            let published = rx.wait_for(Option::is_some).await.map(|v| v.clone());
            match published {
                Ok(Some(result)) => return result,
                Ok(None) => {}
                // Executor went away without publishing; fall back to the store.
                Err(_) => debug!(job_id = %self.job_id, "Local outcome channel closed"),
            }
        }

        loop {
            if let Some(result) = resolve_record(&self.record().await?) {
                return result;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Like [`get`](Self::get) but gives up after `timeout`, returning
    /// `Ok(None)` if the job is still active.
    pub async fn wait(&self, timeout: Duration) -> Result<Option<serde_json::Value>, CoreError> {
        match tokio::time::timeout(timeout, self.get()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }
}
