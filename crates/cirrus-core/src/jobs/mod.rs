// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-resource work jobs.
//!
//! A lifecycle operation on a resource is admitted as a persisted job, run by
//! a named [`WorkHandler`] and awaited through an [`Outcome`]. The handler name
//! and the JSON parameters are enough to run the job again on another node.

pub mod dispatcher;
pub mod handler;
pub mod outcome;
pub mod params;
pub mod vm;

pub use dispatcher::{
    JobDispatcher, JobDispatcherBuilder, JobDispatcherConfig, RecoveryReport, SubmitJob,
};
pub use handler::{JobContext, RecoveryPolicy, WorkHandler};
pub use outcome::Outcome;
pub use params::{JobParams, ParamKey, ParamValue};

use std::fmt;

/// Lifecycle of a work job. Only `Queued` and `Running` count as active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_and_activity() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert!(JobStatus::Running.is_active());
        assert!(!JobStatus::Failed.is_active());
        assert_eq!(JobStatus::parse("cancelled"), None);
    }
}
