// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! Timestamps are always bound from Rust so that stored values compare
//! consistently as text.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::{CoreError, is_unique_violation};

use super::{
    HostRecord, NODE_DOWN, NODE_UP, NewHost, NodeRecord, Persistence, ResourceEventRecord,
    ResourceRecord, WorkJobRecord,
};

const RESOURCE_COLUMNS: &str =
    "kind, resource_id, state, update_version, payload, created_at, updated_at";
const HOST_COLUMNS: &str = "host_id, name, address, cluster, owner_node, owner_version, \
     claimed_at, last_ping_at, created_at";
const JOB_COLUMNS: &str = "job_id, account_id, resource_kind, resource_id, handler, params, \
     status, result, error, owner_node, cancel_requested, attempt, created_at, started_at, \
     finished_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/cirrus.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::database(
                    "create_dir",
                    format!("failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| {
                CoreError::database(
                    "connect",
                    format!("failed to connect to SQLite at {:?}: {}", path, e),
                )
            })?;

        crate::migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory database with migrations applied. Single connection, so every
    /// caller sees the same database.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        crate::migrations::run_sqlite(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_resource(
        &self,
        kind: &str,
        resource_id: &str,
        state: &str,
        payload: Option<&str>,
    ) -> Result<ResourceRecord, CoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO resources (kind, resource_id, state, update_version, payload, created_at, updated_at)
            VALUES (?1, ?2, ?3, 0, ?4, ?5, ?5)
            "#,
        )
        .bind(kind)
        .bind(resource_id)
        .bind(state)
        .bind(payload)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CoreError::Validation {
                    field: "resource_id".to_string(),
                    message: format!("{} '{}' already exists", kind, resource_id),
                }
            } else {
                e.into()
            }
        })?;

        Ok(ResourceRecord {
            kind: kind.to_string(),
            resource_id: resource_id.to_string(),
            state: state.to_string(),
            update_version: 0,
            payload: payload.map(str::to_string),
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_resource(
        &self,
        kind: &str,
        resource_id: &str,
    ) -> Result<Option<ResourceRecord>, CoreError> {
        let record = sqlx::query_as::<_, ResourceRecord>(&format!(
            "SELECT {} FROM resources WHERE kind = ?1 AND resource_id = ?2",
            RESOURCE_COLUMNS
        ))
        .bind(kind)
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_resource_state(
        &self,
        kind: &str,
        resource_id: &str,
        from_state: &str,
        expected_version: i64,
        to_state: &str,
        payload: Option<&str>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE resources
            SET state = ?1,
                update_version = update_version + 1,
                payload = COALESCE(?2, payload),
                updated_at = ?3
            WHERE kind = ?4
              AND resource_id = ?5
              AND state = ?6
              AND update_version = ?7
            "#,
        )
        .bind(to_state)
        .bind(payload)
        .bind(Utc::now())
        .bind(kind)
        .bind(resource_id)
        .bind(from_state)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_resources(
        &self,
        kind: &str,
        state: Option<&str>,
    ) -> Result<Vec<ResourceRecord>, CoreError> {
        let records = sqlx::query_as::<_, ResourceRecord>(&format!(
            r#"
            SELECT {} FROM resources
            WHERE kind = ?1 AND (?2 IS NULL OR state = ?2)
            ORDER BY resource_id
            "#,
            RESOURCE_COLUMNS
        ))
        .bind(kind)
        .bind(state)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn insert_resource_event(&self, event: &ResourceEventRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO resource_events
                (kind, resource_id, from_state, event, to_state, update_version, node_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.kind)
        .bind(&event.resource_id)
        .bind(&event.from_state)
        .bind(&event.event)
        .bind(&event.to_state)
        .bind(event.update_version)
        .bind(&event.node_id)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_resource_events(
        &self,
        kind: &str,
        resource_id: &str,
    ) -> Result<Vec<ResourceEventRecord>, CoreError> {
        let events = sqlx::query_as::<_, ResourceEventRecord>(
            r#"
            SELECT id, kind, resource_id, from_state, event, to_state, update_version, node_id, created_at
            FROM resource_events
            WHERE kind = ?1 AND resource_id = ?2
            ORDER BY id ASC
            "#,
        )
        .bind(kind)
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn register_host(&self, host: &NewHost) -> Result<HostRecord, CoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO hosts (host_id, name, address, cluster, owner_version, created_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5)
            "#,
        )
        .bind(host.host_id)
        .bind(&host.name)
        .bind(&host.address)
        .bind(&host.cluster)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CoreError::Validation {
                    field: "host_id".to_string(),
                    message: format!("host {} already registered", host.host_id),
                }
            } else {
                e.into()
            }
        })?;

        Ok(HostRecord {
            host_id: host.host_id,
            name: host.name.clone(),
            address: host.address.clone(),
            cluster: host.cluster.clone(),
            owner_node: None,
            owner_version: 0,
            claimed_at: None,
            last_ping_at: None,
            created_at: now,
        })
    }

    async fn get_host(&self, host_id: i64) -> Result<Option<HostRecord>, CoreError> {
        let record = sqlx::query_as::<_, HostRecord>(&format!(
            "SELECT {} FROM hosts WHERE host_id = ?",
            HOST_COLUMNS
        ))
        .bind(host_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_hosts(&self) -> Result<Vec<HostRecord>, CoreError> {
        let records = sqlx::query_as::<_, HostRecord>(&format!(
            "SELECT {} FROM hosts ORDER BY host_id",
            HOST_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn claim_hosts(
        &self,
        node_id: &str,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<HostRecord>, CoreError> {
        let candidates: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT h.host_id, h.owner_version
            FROM hosts h
            LEFT JOIN management_nodes n ON n.node_id = h.owner_node
            WHERE h.owner_node IS NULL
               OR (h.owner_node <> ?1
                   AND (n.node_id IS NULL OR n.status <> 'up' OR n.heartbeat_at < ?2))
            ORDER BY h.host_id
            LIMIT ?3
            "#,
        )
        .bind(node_id)
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for (host_id, owner_version) in candidates {
            let now = Utc::now();
            let result = sqlx::query(
                r#"
                UPDATE hosts
                SET owner_node = ?1, owner_version = owner_version + 1, claimed_at = ?2
                WHERE host_id = ?3 AND owner_version = ?4
                  AND NOT EXISTS (
                      SELECT 1 FROM management_nodes n
                      WHERE n.node_id = hosts.owner_node
                        AND n.node_id <> ?1
                        AND n.status = 'up'
                        AND n.heartbeat_at >= ?5
                  )
                "#,
            )
            .bind(node_id)
            .bind(now)
            .bind(host_id)
            .bind(owner_version)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1
                && let Some(host) = self.get_host(host_id).await?
            {
                claimed.push(host);
            }
        }

        Ok(claimed)
    }

    async fn release_host(&self, host_id: i64, node_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE hosts
            SET owner_node = NULL, owner_version = owner_version + 1, claimed_at = NULL
            WHERE host_id = ?1 AND owner_node = ?2
            "#,
        )
        .bind(host_id)
        .bind(node_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_owned_hosts(&self, node_id: &str) -> Result<Vec<HostRecord>, CoreError> {
        let records = sqlx::query_as::<_, HostRecord>(&format!(
            "SELECT {} FROM hosts WHERE owner_node = ? ORDER BY host_id",
            HOST_COLUMNS
        ))
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn touch_host_ping(&self, host_id: i64, at: DateTime<Utc>) -> Result<(), CoreError> {
        sqlx::query("UPDATE hosts SET last_ping_at = ? WHERE host_id = ?")
            .bind(at)
            .bind(host_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_node(
        &self,
        node_id: &str,
        peer_addr: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO management_nodes (node_id, peer_addr, status, heartbeat_at, started_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT (node_id) DO UPDATE
            SET peer_addr = excluded.peer_addr,
                status = excluded.status,
                heartbeat_at = excluded.heartbeat_at,
                started_at = excluded.started_at
            "#,
        )
        .bind(node_id)
        .bind(peer_addr)
        .bind(NODE_UP)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn heartbeat_node(&self, node_id: &str, now: DateTime<Utc>) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE management_nodes SET heartbeat_at = ?1, status = ?2 WHERE node_id = ?3",
        )
        .bind(now)
        .bind(NODE_UP)
        .bind(node_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>, CoreError> {
        let record = sqlx::query_as::<_, NodeRecord>(
            r#"
            SELECT node_id, peer_addr, status, heartbeat_at, started_at
            FROM management_nodes
            WHERE node_id = ?
            "#,
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, CoreError> {
        let records = sqlx::query_as::<_, NodeRecord>(
            r#"
            SELECT node_id, peer_addr, status, heartbeat_at, started_at
            FROM management_nodes
            ORDER BY node_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn mark_expired_nodes_down(
        &self,
        cutoff: DateTime<Utc>,
        except_node: &str,
    ) -> Result<Vec<String>, CoreError> {
        let expired: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT node_id FROM management_nodes
            WHERE status = 'up' AND heartbeat_at < ?1 AND node_id <> ?2
            "#,
        )
        .bind(cutoff)
        .bind(except_node)
        .fetch_all(&self.pool)
        .await?;

        let mut marked = Vec::new();
        for (node_id,) in expired {
            // Re-check the heartbeat so a node that just came back is left alone.
            let result = sqlx::query(
                r#"
                UPDATE management_nodes SET status = ?1
                WHERE node_id = ?2 AND status = 'up' AND heartbeat_at < ?3
                "#,
            )
            .bind(NODE_DOWN)
            .bind(&node_id)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 1 {
                marked.push(node_id);
            }
        }

        Ok(marked)
    }

    async fn mark_node_down(&self, node_id: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE management_nodes SET status = ? WHERE node_id = ?")
            .bind(NODE_DOWN)
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_job(&self, job: &WorkJobRecord) -> Result<(), CoreError> {
        sqlx::query(&format!(
            "INSERT INTO work_jobs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            JOB_COLUMNS
        ))
        .bind(&job.job_id)
        .bind(&job.account_id)
        .bind(&job.resource_kind)
        .bind(&job.resource_id)
        .bind(&job.handler)
        .bind(&job.params)
        .bind(&job.status)
        .bind(&job.result)
        .bind(&job.error)
        .bind(&job.owner_node)
        .bind(job.cancel_requested)
        .bind(job.attempt)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CoreError::ConcurrentOperation {
                    kind: job.resource_kind.clone(),
                    resource_id: job.resource_id.clone(),
                }
            } else {
                e.into()
            }
        })?;

        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<WorkJobRecord>, CoreError> {
        let record = sqlx::query_as::<_, WorkJobRecord>(&format!(
            "SELECT {} FROM work_jobs WHERE job_id = ?",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_jobs_for_resource(
        &self,
        resource_kind: &str,
        resource_id: &str,
    ) -> Result<Vec<WorkJobRecord>, CoreError> {
        let records = sqlx::query_as::<_, WorkJobRecord>(&format!(
            r#"
            SELECT {} FROM work_jobs
            WHERE resource_kind = ?1 AND resource_id = ?2
            ORDER BY created_at DESC, job_id DESC
            "#,
            JOB_COLUMNS
        ))
        .bind(resource_kind)
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn mark_job_running(
        &self,
        job_id: &str,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE work_jobs
            SET status = 'running', started_at = ?1
            WHERE job_id = ?2 AND owner_node = ?3 AND status = 'queued'
            "#,
        )
        .bind(now)
        .bind(job_id)
        .bind(node_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete_job(
        &self,
        job_id: &str,
        status: &str,
        result: Option<&str>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let outcome = sqlx::query(
            r#"
            UPDATE work_jobs
            SET status = ?1, result = ?2, error = ?3, finished_at = ?4
            WHERE job_id = ?5 AND status IN ('queued', 'running')
            "#,
        )
        .bind(status)
        .bind(result)
        .bind(error)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() == 1)
    }

    async fn request_job_cancel(&self, job_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE work_jobs SET cancel_requested = 1
            WHERE job_id = ? AND status IN ('queued', 'running')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_orphaned_jobs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkJobRecord>, CoreError> {
        let records = sqlx::query_as::<_, WorkJobRecord>(
            r#"
            SELECT j.job_id, j.account_id, j.resource_kind, j.resource_id, j.handler, j.params,
                   j.status, j.result, j.error, j.owner_node, j.cancel_requested, j.attempt,
                   j.created_at, j.started_at, j.finished_at
            FROM work_jobs j
            LEFT JOIN management_nodes n ON n.node_id = j.owner_node
            WHERE j.status IN ('queued', 'running')
              AND (n.node_id IS NULL OR n.status <> 'up' OR n.heartbeat_at < ?)
            ORDER BY j.created_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn reassign_job(
        &self,
        job_id: &str,
        from_node: &str,
        to_node: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE work_jobs
            SET status = 'queued', owner_node = ?1, attempt = attempt + 1, started_at = NULL
            WHERE job_id = ?2 AND owner_node = ?3 AND status IN ('queued', 'running')
            "#,
        )
        .bind(to_node)
        .bind(job_id)
        .bind(from_node)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let row: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    async fn test_persistence() -> SqlitePersistence {
        SqlitePersistence::in_memory()
            .await
            .expect("Failed to create in-memory SQLite persistence")
    }

    fn job(resource_id: &str, owner: &str) -> WorkJobRecord {
        WorkJobRecord {
            job_id: Uuid::new_v4().to_string(),
            account_id: "acct-1".to_string(),
            resource_kind: "vm".to_string(),
            resource_id: resource_id.to_string(),
            handler: "start_vm".to_string(),
            params: "{}".to_string(),
            status: "queued".to_string(),
            result: None,
            error: None,
            owner_node: owner.to_string(),
            cancel_requested: false,
            attempt: 1,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    async fn host(p: &SqlitePersistence, host_id: i64) -> HostRecord {
        p.register_host(&NewHost {
            host_id,
            name: format!("kvm-{}", host_id),
            address: format!("10.0.0.{}:8250", host_id),
            cluster: Some("c1".into()),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_resource_cas_bumps_version_once() {
        let p = test_persistence().await;
        p.insert_resource("vm", "vm-1", "Stopped", Some(r#"{"cpu":2}"#))
            .await
            .unwrap();

        assert!(
            p.update_resource_state("vm", "vm-1", "Stopped", 0, "Starting", None)
                .await
                .unwrap()
        );
        // Same expectation again is stale now.
        assert!(
            !p.update_resource_state("vm", "vm-1", "Stopped", 0, "Starting", None)
                .await
                .unwrap()
        );

        let rec = p.get_resource("vm", "vm-1").await.unwrap().unwrap();
        assert_eq!(rec.state, "Starting");
        assert_eq!(rec.update_version, 1);
        assert_eq!(rec.payload.as_deref(), Some(r#"{"cpu":2}"#));
    }

    #[tokio::test]
    async fn test_resource_cas_replaces_payload_when_given() {
        let p = test_persistence().await;
        p.insert_resource("vm", "vm-2", "Running", None).await.unwrap();
        assert!(
            p.update_resource_state("vm", "vm-2", "Running", 0, "Migrating", Some(r#"{"host":4}"#))
                .await
                .unwrap()
        );
        let rec = p.get_resource("vm", "vm-2").await.unwrap().unwrap();
        assert_eq!(rec.payload.as_deref(), Some(r#"{"host":4}"#));
    }

    #[tokio::test]
    async fn test_duplicate_resource_is_validation_error() {
        let p = test_persistence().await;
        p.insert_resource("network", "n-1", "Allocated", None)
            .await
            .unwrap();
        let err = p
            .insert_resource("network", "n-1", "Allocated", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
        // Same id under another kind is a different resource.
        p.insert_resource("volume", "n-1", "Allocated", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_resources_filters_by_state() {
        let p = test_persistence().await;
        p.insert_resource("vm", "a", "Stopped", None).await.unwrap();
        p.insert_resource("vm", "b", "Running", None).await.unwrap();
        p.insert_resource("host", "1", "Up", None).await.unwrap();

        assert_eq!(p.list_resources("vm", None).await.unwrap().len(), 2);
        let running = p.list_resources("vm", Some("Running")).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].resource_id, "b");
    }

    #[tokio::test]
    async fn test_resource_events_are_ordered() {
        let p = test_persistence().await;
        for (i, (from, to)) in [("Stopped", "Starting"), ("Starting", "Running")]
            .iter()
            .enumerate()
        {
            p.insert_resource_event(&ResourceEventRecord {
                id: None,
                kind: "vm".into(),
                resource_id: "vm-1".into(),
                from_state: from.to_string(),
                event: "e".into(),
                to_state: to.to_string(),
                update_version: i as i64 + 1,
                node_id: Some("node-a".into()),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        }
        let events = p.list_resource_events("vm", "vm-1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].to_state, "Starting");
        assert_eq!(events[1].to_state, "Running");
        assert!(events[0].id.unwrap() < events[1].id.unwrap());
    }

    #[tokio::test]
    async fn test_claim_skips_hosts_of_live_nodes() {
        let p = test_persistence().await;
        let now = Utc::now();
        p.upsert_node("node-a", "127.0.0.1:1", now).await.unwrap();
        p.upsert_node("node-b", "127.0.0.1:2", now).await.unwrap();
        host(&p, 1).await;
        host(&p, 2).await;

        let cutoff = now - Duration::seconds(60);
        let claimed_a = p.claim_hosts("node-a", cutoff, 1).await.unwrap();
        assert_eq!(claimed_a.len(), 1);
        assert_eq!(claimed_a[0].owner_node.as_deref(), Some("node-a"));
        assert_eq!(claimed_a[0].owner_version, 1);

        let claimed_b = p.claim_hosts("node-b", cutoff, 10).await.unwrap();
        assert_eq!(claimed_b.len(), 1);
        assert_ne!(claimed_b[0].host_id, claimed_a[0].host_id);

        // Nothing left for anyone while both nodes are live.
        assert!(p.claim_hosts("node-b", cutoff, 10).await.unwrap().is_empty());
        assert!(p.claim_hosts("node-a", cutoff, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_takes_over_from_expired_node() {
        let p = test_persistence().await;
        let long_ago = Utc::now() - Duration::seconds(600);
        p.upsert_node("dead", "127.0.0.1:1", long_ago).await.unwrap();
        p.upsert_node("alive", "127.0.0.1:2", Utc::now()).await.unwrap();
        host(&p, 7).await;

        let cutoff = Utc::now() - Duration::seconds(60);
        assert_eq!(p.claim_hosts("dead", long_ago, 1).await.unwrap().len(), 1);

        let claimed = p.claim_hosts("alive", cutoff, 5).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].owner_node.as_deref(), Some("alive"));
        assert_eq!(claimed[0].owner_version, 2);
    }

    #[tokio::test]
    async fn test_release_only_by_owner() {
        let p = test_persistence().await;
        p.upsert_node("node-a", "127.0.0.1:1", Utc::now())
            .await
            .unwrap();
        host(&p, 3).await;
        p.claim_hosts("node-a", Utc::now() - Duration::seconds(60), 1)
            .await
            .unwrap();

        assert!(!p.release_host(3, "node-b").await.unwrap());
        assert!(p.release_host(3, "node-a").await.unwrap());
        let h = p.get_host(3).await.unwrap().unwrap();
        assert!(h.owner_node.is_none());
        assert_eq!(h.owner_version, 2);
    }

    #[tokio::test]
    async fn test_mark_expired_nodes_down_spares_self_and_fresh() {
        let p = test_persistence().await;
        let old = Utc::now() - Duration::seconds(300);
        p.upsert_node("me", "127.0.0.1:1", old).await.unwrap();
        p.upsert_node("stale", "127.0.0.1:2", old).await.unwrap();
        p.upsert_node("fresh", "127.0.0.1:3", Utc::now()).await.unwrap();

        let cutoff = Utc::now() - Duration::seconds(60);
        let marked = p.mark_expired_nodes_down(cutoff, "me").await.unwrap();
        assert_eq!(marked, vec!["stale".to_string()]);

        // Idempotent.
        assert!(p.mark_expired_nodes_down(cutoff, "me").await.unwrap().is_empty());

        // Heartbeat revives.
        assert!(p.heartbeat_node("stale", Utc::now()).await.unwrap());
        assert_eq!(p.get_node("stale").await.unwrap().unwrap().status, NODE_UP);
    }

    #[tokio::test]
    async fn test_one_active_job_per_resource() {
        let p = test_persistence().await;
        let first = job("vm-1", "node-a");
        p.insert_job(&first).await.unwrap();

        let err = p.insert_job(&job("vm-1", "node-a")).await.unwrap_err();
        assert!(matches!(err, CoreError::ConcurrentOperation { .. }));

        // Other resources are independent.
        p.insert_job(&job("vm-2", "node-a")).await.unwrap();

        assert!(p.mark_job_running(&first.job_id, "node-a", Utc::now()).await.unwrap());
        assert!(
            p.complete_job(&first.job_id, "succeeded", Some("{}"), None, Utc::now())
                .await
                .unwrap()
        );
        // Terminal status is recorded exactly once.
        assert!(
            !p.complete_job(&first.job_id, "failed", None, Some("{}"), Utc::now())
                .await
                .unwrap()
        );

        p.insert_job(&job("vm-1", "node-a")).await.unwrap();
        assert_eq!(p.list_jobs_for_resource("vm", "vm-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_mark_running_requires_owner_and_queued() {
        let p = test_persistence().await;
        let j = job("vm-9", "node-a");
        p.insert_job(&j).await.unwrap();
        assert!(!p.mark_job_running(&j.job_id, "node-b", Utc::now()).await.unwrap());
        assert!(p.mark_job_running(&j.job_id, "node-a", Utc::now()).await.unwrap());
        assert!(!p.mark_job_running(&j.job_id, "node-a", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_orphaned_jobs_and_reassign() {
        let p = test_persistence().await;
        let old = Utc::now() - Duration::seconds(600);
        p.upsert_node("dead", "127.0.0.1:1", old).await.unwrap();
        p.upsert_node("alive", "127.0.0.1:2", Utc::now()).await.unwrap();

        let orphan = job("vm-1", "dead");
        let healthy = job("vm-2", "alive");
        p.insert_job(&orphan).await.unwrap();
        p.insert_job(&healthy).await.unwrap();

        let cutoff = Utc::now() - Duration::seconds(60);
        let orphans = p.list_orphaned_jobs(cutoff).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].job_id, orphan.job_id);

        assert!(p.reassign_job(&orphan.job_id, "dead", "alive").await.unwrap());
        // Second taker loses.
        assert!(!p.reassign_job(&orphan.job_id, "dead", "other").await.unwrap());

        let j = p.get_job(&orphan.job_id).await.unwrap().unwrap();
        assert_eq!(j.owner_node, "alive");
        assert_eq!(j.attempt, 2);
        assert_eq!(j.status, "queued");
        assert!(p.list_orphaned_jobs(cutoff).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_only_active_jobs() {
        let p = test_persistence().await;
        let j = job("vm-5", "node-a");
        p.insert_job(&j).await.unwrap();
        assert!(p.request_job_cancel(&j.job_id).await.unwrap());
        assert!(p.get_job(&j.job_id).await.unwrap().unwrap().cancel_requested);

        p.complete_job(&j.job_id, "failed", None, None, Utc::now())
            .await
            .unwrap();
        assert!(!p.request_job_cancel(&j.job_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_from_path_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cirrus.db");
        let p = SqlitePersistence::from_path(&path).await.unwrap();
        assert!(p.health_check_db().await.unwrap());
        assert!(path.exists());
    }
}
