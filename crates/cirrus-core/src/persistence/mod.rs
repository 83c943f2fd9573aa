// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for cirrus-core.
//!
//! Every mutation that must hold across management nodes is a conditional
//! update whose affected-row count is reported back to the caller:
//! - resource state: `WHERE kind, id, state, update_version`
//! - host ownership: `WHERE host_id, owner_version`
//! - job status: `WHERE job_id, status IN (...)`
//!
//! In-process locks are never the source of truth.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;

/// Resource row as stored for the state machine engine.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ResourceRecord {
    /// Resource kind (`vm`, `host`, `network`, `volume`).
    pub kind: String,
    /// Opaque identifier, unique within the kind.
    pub resource_id: String,
    /// Persisted state name.
    pub state: String,
    /// Optimistic concurrency counter, bumped on every transition.
    pub update_version: i64,
    /// Kind-specific JSON payload.
    pub payload: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A committed transition.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResourceEventRecord {
    /// Database primary key (None when inserting new events).
    #[sqlx(default)]
    pub id: Option<i64>,
    pub kind: String,
    pub resource_id: String,
    pub from_state: String,
    pub event: String,
    pub to_state: String,
    /// Version after the transition.
    pub update_version: i64,
    /// Node that performed the transition.
    pub node_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Managed host and its current connection owner.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct HostRecord {
    pub host_id: i64,
    pub name: String,
    /// Agent endpoint (`ip:port`).
    pub address: String,
    /// Neighbourhood used for investigation (hosts sharing a cluster can vouch for each other).
    pub cluster: Option<String>,
    /// Node holding the direct connection, if any.
    pub owner_node: Option<String>,
    /// Ownership CAS counter, bumped on every claim and release.
    pub owner_version: i64,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to register a host.
#[derive(Debug, Clone)]
pub struct NewHost {
    pub host_id: i64,
    pub name: String,
    pub address: String,
    pub cluster: Option<String>,
}

/// Membership row of a management node.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct NodeRecord {
    pub node_id: String,
    /// Address peers use to reach this node.
    pub peer_addr: String,
    /// `up` or `down`.
    pub status: String,
    pub heartbeat_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl NodeRecord {
    /// Whether the node counts as live at `cutoff` (heartbeat newer than it).
    pub fn is_live(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == NODE_UP && self.heartbeat_at >= cutoff
    }
}

pub const NODE_UP: &str = "up";
pub const NODE_DOWN: &str = "down";

/// Oldest heartbeat still considered live `timeout` before `now`.
pub fn liveness_cutoff(now: DateTime<Utc>, timeout: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Persisted work job.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct WorkJobRecord {
    pub job_id: String,
    /// Requesting account.
    pub account_id: String,
    /// Serialization key, part one.
    pub resource_kind: String,
    /// Serialization key, part two.
    pub resource_id: String,
    /// Name of the handler that runs the job.
    pub handler: String,
    /// JSON encoded parameter map.
    pub params: String,
    /// `queued`, `running`, `succeeded` or `failed`.
    pub status: String,
    /// JSON result of a successful run.
    pub result: Option<String>,
    /// JSON encoded [`CoreError`] of a failed run.
    pub error: Option<String>,
    /// Node responsible for running the job.
    pub owner_node: String,
    pub cancel_requested: bool,
    pub attempt: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Persistence interface used by every core component.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------

    /// Insert a resource at `update_version = 0`.
    async fn insert_resource(
        &self,
        kind: &str,
        resource_id: &str,
        state: &str,
        payload: Option<&str>,
    ) -> Result<ResourceRecord, CoreError>;

    async fn get_resource(
        &self,
        kind: &str,
        resource_id: &str,
    ) -> Result<Option<ResourceRecord>, CoreError>;

    /// Conditional state update.
    ///
    /// Applies only if the row still has `from_state` at `expected_version`;
    /// bumps the version by one. A `None` payload keeps the stored one.
    /// Returns whether a row was updated.
    async fn update_resource_state(
        &self,
        kind: &str,
        resource_id: &str,
        from_state: &str,
        expected_version: i64,
        to_state: &str,
        payload: Option<&str>,
    ) -> Result<bool, CoreError>;

    async fn list_resources(
        &self,
        kind: &str,
        state: Option<&str>,
    ) -> Result<Vec<ResourceRecord>, CoreError>;

    async fn insert_resource_event(&self, event: &ResourceEventRecord) -> Result<(), CoreError>;

    /// Events for one resource, oldest first.
    async fn list_resource_events(
        &self,
        kind: &str,
        resource_id: &str,
    ) -> Result<Vec<ResourceEventRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Hosts
    // ------------------------------------------------------------------

    async fn register_host(&self, host: &NewHost) -> Result<HostRecord, CoreError>;

    async fn get_host(&self, host_id: i64) -> Result<Option<HostRecord>, CoreError>;

    async fn list_hosts(&self) -> Result<Vec<HostRecord>, CoreError>;

    /// Claim up to `limit` hosts that are unowned or owned by a node that is
    /// not live at `cutoff`. Each claim is an `owner_version` CAS; hosts lost
    /// to a concurrent claimer are skipped. Returns the hosts now owned by `node_id`.
    async fn claim_hosts(
        &self,
        node_id: &str,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<HostRecord>, CoreError>;

    /// Clear the owner if it is still `node_id`.
    async fn release_host(&self, host_id: i64, node_id: &str) -> Result<bool, CoreError>;

    async fn list_owned_hosts(&self, node_id: &str) -> Result<Vec<HostRecord>, CoreError>;

    async fn touch_host_ping(&self, host_id: i64, at: DateTime<Utc>) -> Result<(), CoreError>;

    // ------------------------------------------------------------------
    // Management nodes
    // ------------------------------------------------------------------

    /// Register or revive a node with a fresh heartbeat.
    async fn upsert_node(
        &self,
        node_id: &str,
        peer_addr: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Refresh the heartbeat; returns false when the node row is missing.
    async fn heartbeat_node(&self, node_id: &str, now: DateTime<Utc>) -> Result<bool, CoreError>;

    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>, CoreError>;

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, CoreError>;

    /// Mark every `up` node whose heartbeat is older than `cutoff` as down,
    /// except `except_node`. Returns the ids that changed.
    async fn mark_expired_nodes_down(
        &self,
        cutoff: DateTime<Utc>,
        except_node: &str,
    ) -> Result<Vec<String>, CoreError>;

    async fn mark_node_down(&self, node_id: &str) -> Result<(), CoreError>;

    // ------------------------------------------------------------------
    // Work jobs
    // ------------------------------------------------------------------

    /// Insert a queued job. An active job for the same resource is reported as
    /// [`CoreError::ConcurrentOperation`].
    async fn insert_job(&self, job: &WorkJobRecord) -> Result<(), CoreError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<WorkJobRecord>, CoreError>;

    /// Jobs for one resource, newest first.
    async fn list_jobs_for_resource(
        &self,
        resource_kind: &str,
        resource_id: &str,
    ) -> Result<Vec<WorkJobRecord>, CoreError>;

    /// `queued → running` CAS for the owning node.
    async fn mark_job_running(
        &self,
        job_id: &str,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Record the terminal status. Applies only while the job is still active.
    async fn complete_job(
        &self,
        job_id: &str,
        status: &str,
        result: Option<&str>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    async fn request_job_cancel(&self, job_id: &str) -> Result<bool, CoreError>;

    /// Active jobs whose owner is missing, down, or silent since `cutoff`.
    async fn list_orphaned_jobs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkJobRecord>, CoreError>;

    /// Take over an active job from `from_node`: back to `queued`, owned by
    /// `to_node`, attempt incremented.
    async fn reassign_job(
        &self,
        job_id: &str,
        from_node: &str,
        to_node: &str,
    ) -> Result<bool, CoreError>;

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    async fn health_check_db(&self) -> Result<bool, CoreError>;
}
