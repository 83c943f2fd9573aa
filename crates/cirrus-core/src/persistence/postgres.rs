// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence for cirrus-core.
//!
//! Free functions take the pool directly; [`PostgresPersistence`] delegates to
//! them. Host claims use `FOR UPDATE SKIP LOCKED` so concurrent scanners on
//! different nodes never wait on each other.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use crate::error::{CoreError, is_unique_violation};

use super::{
    HostRecord, NODE_DOWN, NODE_UP, NewHost, NodeRecord, Persistence, ResourceEventRecord,
    ResourceRecord, WorkJobRecord,
};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Resource Operations
// ============================================================================

pub async fn insert_resource(
    pool: &PgPool,
    kind: &str,
    resource_id: &str,
    state: &str,
    payload: Option<&str>,
) -> Result<ResourceRecord, CoreError> {
    sqlx::query_as::<_, ResourceRecord>(
        r#"
        INSERT INTO resources (kind, resource_id, state, update_version, payload, created_at, updated_at)
        VALUES ($1, $2, $3, 0, $4, NOW(), NOW())
        RETURNING kind, resource_id, state, update_version, payload, created_at, updated_at
        "#,
    )
    .bind(kind)
    .bind(resource_id)
    .bind(state)
    .bind(payload)
    .fetch_one(pool)
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
    })
}

pub async fn get_resource(
    pool: &PgPool,
    kind: &str,
    resource_id: &str,
) -> Result<Option<ResourceRecord>, CoreError> {
    let record = sqlx::query_as::<_, ResourceRecord>(
        r#"
        SELECT kind, resource_id, state, update_version, payload, created_at, updated_at
        FROM resources
        WHERE kind = $1 AND resource_id = $2
        "#,
    )
    .bind(kind)
    .bind(resource_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn update_resource_state(
    pool: &PgPool,
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
        SET state = $1,
            update_version = update_version + 1,
            payload = COALESCE($2, payload),
            updated_at = NOW()
        WHERE kind = $3
          AND resource_id = $4
          AND state = $5
          AND update_version = $6
        "#,
    )
    .bind(to_state)
    .bind(payload)
    .bind(kind)
    .bind(resource_id)
    .bind(from_state)
    .bind(expected_version)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn list_resources(
    pool: &PgPool,
    kind: &str,
    state: Option<&str>,
) -> Result<Vec<ResourceRecord>, CoreError> {
    let records = sqlx::query_as::<_, ResourceRecord>(
        r#"
        SELECT kind, resource_id, state, update_version, payload, created_at, updated_at
        FROM resources
        WHERE kind = $1 AND ($2::TEXT IS NULL OR state = $2)
        ORDER BY resource_id
        "#,
    )
    .bind(kind)
    .bind(state)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

pub async fn insert_resource_event(
    pool: &PgPool,
    event: &ResourceEventRecord,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO resource_events
            (kind, resource_id, from_state, event, to_state, update_version, node_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
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
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list_resource_events(
    pool: &PgPool,
    kind: &str,
    resource_id: &str,
) -> Result<Vec<ResourceEventRecord>, CoreError> {
    let events = sqlx::query_as::<_, ResourceEventRecord>(
        r#"
        SELECT id, kind, resource_id, from_state, event, to_state, update_version, node_id, created_at
        FROM resource_events
        WHERE kind = $1 AND resource_id = $2
        ORDER BY id ASC
        "#,
    )
    .bind(kind)
    .bind(resource_id)
    .fetch_all(pool)
    .await?;

    Ok(events)
}

// ============================================================================
// Host Operations
// ============================================================================

pub async fn register_host(pool: &PgPool, host: &NewHost) -> Result<HostRecord, CoreError> {
    sqlx::query_as::<_, HostRecord>(
        r#"
        INSERT INTO hosts (host_id, name, address, cluster, owner_version, created_at)
        VALUES ($1, $2, $3, $4, 0, NOW())
        RETURNING host_id, name, address, cluster, owner_node, owner_version,
                  claimed_at, last_ping_at, created_at
        "#,
    )
    .bind(host.host_id)
    .bind(&host.name)
    .bind(&host.address)
    .bind(&host.cluster)
    .fetch_one(pool)
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
    })
}

pub async fn get_host(pool: &PgPool, host_id: i64) -> Result<Option<HostRecord>, CoreError> {
    let record = sqlx::query_as::<_, HostRecord>(
        r#"
        SELECT host_id, name, address, cluster, owner_node, owner_version,
               claimed_at, last_ping_at, created_at
        FROM hosts
        WHERE host_id = $1
        "#,
    )
    .bind(host_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn list_hosts(pool: &PgPool) -> Result<Vec<HostRecord>, CoreError> {
    let records = sqlx::query_as::<_, HostRecord>(
        r#"
        SELECT host_id, name, address, cluster, owner_node, owner_version,
               claimed_at, last_ping_at, created_at
        FROM hosts
        ORDER BY host_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(records)
}

pub async fn claim_hosts(
    pool: &PgPool,
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
           OR (h.owner_node <> $1
               AND (n.node_id IS NULL OR n.status <> 'up' OR n.heartbeat_at < $2))
        ORDER BY h.host_id
        LIMIT $3
        "#,
    )
    .bind(node_id)
    .bind(cutoff)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    let mut claimed = Vec::with_capacity(candidates.len());
    for (host_id, owner_version) in candidates {
        // The version check fails for a row another node claimed since the
        // candidate read; the liveness check covers an owner that came back.
        let record = sqlx::query_as::<_, HostRecord>(
            r#"
            UPDATE hosts h
            SET owner_node = $1, owner_version = h.owner_version + 1, claimed_at = NOW()
            WHERE h.host_id = $2
              AND h.owner_version = $3
              AND NOT EXISTS (
                  SELECT 1 FROM management_nodes n
                  WHERE n.node_id = h.owner_node
                    AND n.node_id <> $1
                    AND n.status = 'up'
                    AND n.heartbeat_at >= $4
              )
            RETURNING host_id, name, address, cluster, owner_node, owner_version,
                      claimed_at, last_ping_at, created_at
            "#,
        )
        .bind(node_id)
        .bind(host_id)
        .bind(owner_version)
        .bind(cutoff)
        .fetch_optional(pool)
        .await?;

        match record {
            Some(host) => claimed.push(host),
            None => debug!(host_id, node_id, "Host claimed elsewhere, skipped"),
        }
    }

    Ok(claimed)
}

pub async fn release_host(pool: &PgPool, host_id: i64, node_id: &str) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE hosts
        SET owner_node = NULL, owner_version = owner_version + 1, claimed_at = NULL
        WHERE host_id = $1 AND owner_node = $2
        "#,
    )
    .bind(host_id)
    .bind(node_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn list_owned_hosts(pool: &PgPool, node_id: &str) -> Result<Vec<HostRecord>, CoreError> {
    let records = sqlx::query_as::<_, HostRecord>(
        r#"
        SELECT host_id, name, address, cluster, owner_node, owner_version,
               claimed_at, last_ping_at, created_at
        FROM hosts
        WHERE owner_node = $1
        ORDER BY host_id
        "#,
    )
    .bind(node_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

pub async fn touch_host_ping(
    pool: &PgPool,
    host_id: i64,
    at: DateTime<Utc>,
) -> Result<(), CoreError> {
    sqlx::query("UPDATE hosts SET last_ping_at = $1 WHERE host_id = $2")
        .bind(at)
        .bind(host_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================================
// Management Node Operations
// ============================================================================

pub async fn upsert_node(
    pool: &PgPool,
    node_id: &str,
    peer_addr: &str,
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO management_nodes (node_id, peer_addr, status, heartbeat_at, started_at)
        VALUES ($1, $2, $3, $4, $4)
        ON CONFLICT (node_id) DO UPDATE
        SET peer_addr = EXCLUDED.peer_addr,
            status = EXCLUDED.status,
            heartbeat_at = EXCLUDED.heartbeat_at,
            started_at = EXCLUDED.started_at
        "#,
    )
    .bind(node_id)
    .bind(peer_addr)
    .bind(NODE_UP)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn heartbeat_node(
    pool: &PgPool,
    node_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        "UPDATE management_nodes SET heartbeat_at = $1, status = $2 WHERE node_id = $3",
    )
    .bind(now)
    .bind(NODE_UP)
    .bind(node_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn get_node(pool: &PgPool, node_id: &str) -> Result<Option<NodeRecord>, CoreError> {
    let record = sqlx::query_as::<_, NodeRecord>(
        r#"
        SELECT node_id, peer_addr, status, heartbeat_at, started_at
        FROM management_nodes
        WHERE node_id = $1
        "#,
    )
    .bind(node_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn list_nodes(pool: &PgPool) -> Result<Vec<NodeRecord>, CoreError> {
    let records = sqlx::query_as::<_, NodeRecord>(
        r#"
        SELECT node_id, peer_addr, status, heartbeat_at, started_at
        FROM management_nodes
        ORDER BY node_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(records)
}

pub async fn mark_expired_nodes_down(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
    except_node: &str,
) -> Result<Vec<String>, CoreError> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        UPDATE management_nodes
        SET status = $1
        WHERE status = 'up' AND heartbeat_at < $2 AND node_id <> $3
        RETURNING node_id
        "#,
    )
    .bind(NODE_DOWN)
    .bind(cutoff)
    .bind(except_node)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn mark_node_down(pool: &PgPool, node_id: &str) -> Result<(), CoreError> {
    sqlx::query("UPDATE management_nodes SET status = $1 WHERE node_id = $2")
        .bind(NODE_DOWN)
        .bind(node_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================================
// Work Job Operations
// ============================================================================

pub async fn insert_job(pool: &PgPool, job: &WorkJobRecord) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO work_jobs
            (job_id, account_id, resource_kind, resource_id, handler, params, status, result,
             error, owner_node, cancel_requested, attempt, created_at, started_at, finished_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
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
    .execute(pool)
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

const JOB_SELECT: &str = r#"
    SELECT job_id, account_id, resource_kind, resource_id, handler, params, status, result,
           error, owner_node, cancel_requested, attempt, created_at, started_at, finished_at
    FROM work_jobs
"#;

pub async fn get_job(pool: &PgPool, job_id: &str) -> Result<Option<WorkJobRecord>, CoreError> {
    let record = sqlx::query_as::<_, WorkJobRecord>(&format!("{} WHERE job_id = $1", JOB_SELECT))
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

pub async fn list_jobs_for_resource(
    pool: &PgPool,
    resource_kind: &str,
    resource_id: &str,
) -> Result<Vec<WorkJobRecord>, CoreError> {
    let records = sqlx::query_as::<_, WorkJobRecord>(&format!(
        "{} WHERE resource_kind = $1 AND resource_id = $2 ORDER BY created_at DESC, job_id DESC",
        JOB_SELECT
    ))
    .bind(resource_kind)
    .bind(resource_id)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

pub async fn mark_job_running(
    pool: &PgPool,
    job_id: &str,
    node_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE work_jobs
        SET status = 'running', started_at = $1
        WHERE job_id = $2 AND owner_node = $3 AND status = 'queued'
        "#,
    )
    .bind(now)
    .bind(job_id)
    .bind(node_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn complete_job(
    pool: &PgPool,
    job_id: &str,
    status: &str,
    result: Option<&str>,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, CoreError> {
    let outcome = sqlx::query(
        r#"
        UPDATE work_jobs
        SET status = $1, result = $2, error = $3, finished_at = $4
        WHERE job_id = $5 AND status IN ('queued', 'running')
        "#,
    )
    .bind(status)
    .bind(result)
    .bind(error)
    .bind(now)
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(outcome.rows_affected() == 1)
}

pub async fn request_job_cancel(pool: &PgPool, job_id: &str) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE work_jobs SET cancel_requested = TRUE
        WHERE job_id = $1 AND status IN ('queued', 'running')
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn list_orphaned_jobs(
    pool: &PgPool,
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
          AND (n.node_id IS NULL OR n.status <> 'up' OR n.heartbeat_at < $1)
        ORDER BY j.created_at
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

pub async fn reassign_job(
    pool: &PgPool,
    job_id: &str,
    from_node: &str,
    to_node: &str,
) -> Result<bool, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE work_jobs
        SET status = 'queued', owner_node = $1, attempt = attempt + 1, started_at = NULL
        WHERE job_id = $2 AND owner_node = $3 AND status IN ('queued', 'running')
        "#,
    )
    .bind(to_node)
    .bind(job_id)
    .bind(from_node)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

// ============================================================================
// Health Check
// ============================================================================

pub async fn health_check(pool: &PgPool) -> Result<bool, CoreError> {
    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(pool).await?;
    Ok(row.0 == 1)
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn insert_resource(
        &self,
        kind: &str,
        resource_id: &str,
        state: &str,
        payload: Option<&str>,
    ) -> Result<ResourceRecord, CoreError> {
        insert_resource(&self.pool, kind, resource_id, state, payload).await
    }

    async fn get_resource(
        &self,
        kind: &str,
        resource_id: &str,
    ) -> Result<Option<ResourceRecord>, CoreError> {
        get_resource(&self.pool, kind, resource_id).await
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
        update_resource_state(
            &self.pool,
            kind,
            resource_id,
            from_state,
            expected_version,
            to_state,
            payload,
        )
        .await
    }

    async fn list_resources(
        &self,
        kind: &str,
        state: Option<&str>,
    ) -> Result<Vec<ResourceRecord>, CoreError> {
        list_resources(&self.pool, kind, state).await
    }

    async fn insert_resource_event(&self, event: &ResourceEventRecord) -> Result<(), CoreError> {
        insert_resource_event(&self.pool, event).await
    }

    async fn list_resource_events(
        &self,
        kind: &str,
        resource_id: &str,
    ) -> Result<Vec<ResourceEventRecord>, CoreError> {
        list_resource_events(&self.pool, kind, resource_id).await
    }

    async fn register_host(&self, host: &NewHost) -> Result<HostRecord, CoreError> {
        register_host(&self.pool, host).await
    }

    async fn get_host(&self, host_id: i64) -> Result<Option<HostRecord>, CoreError> {
        get_host(&self.pool, host_id).await
    }

    async fn list_hosts(&self) -> Result<Vec<HostRecord>, CoreError> {
        list_hosts(&self.pool).await
    }

    async fn claim_hosts(
        &self,
        node_id: &str,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<HostRecord>, CoreError> {
        claim_hosts(&self.pool, node_id, cutoff, limit).await
    }

    async fn release_host(&self, host_id: i64, node_id: &str) -> Result<bool, CoreError> {
        release_host(&self.pool, host_id, node_id).await
    }

    async fn list_owned_hosts(&self, node_id: &str) -> Result<Vec<HostRecord>, CoreError> {
        list_owned_hosts(&self.pool, node_id).await
    }

    async fn touch_host_ping(&self, host_id: i64, at: DateTime<Utc>) -> Result<(), CoreError> {
        touch_host_ping(&self.pool, host_id, at).await
    }

    async fn upsert_node(
        &self,
        node_id: &str,
        peer_addr: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        upsert_node(&self.pool, node_id, peer_addr, now).await
    }

    async fn heartbeat_node(&self, node_id: &str, now: DateTime<Utc>) -> Result<bool, CoreError> {
        heartbeat_node(&self.pool, node_id, now).await
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>, CoreError> {
        get_node(&self.pool, node_id).await
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, CoreError> {
        list_nodes(&self.pool).await
    }

    async fn mark_expired_nodes_down(
        &self,
        cutoff: DateTime<Utc>,
        except_node: &str,
    ) -> Result<Vec<String>, CoreError> {
        mark_expired_nodes_down(&self.pool, cutoff, except_node).await
    }

    async fn mark_node_down(&self, node_id: &str) -> Result<(), CoreError> {
        mark_node_down(&self.pool, node_id).await
    }

    async fn insert_job(&self, job: &WorkJobRecord) -> Result<(), CoreError> {
        insert_job(&self.pool, job).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<WorkJobRecord>, CoreError> {
        get_job(&self.pool, job_id).await
    }

    async fn list_jobs_for_resource(
        &self,
        resource_kind: &str,
        resource_id: &str,
    ) -> Result<Vec<WorkJobRecord>, CoreError> {
        list_jobs_for_resource(&self.pool, resource_kind, resource_id).await
    }

    async fn mark_job_running(
        &self,
        job_id: &str,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        mark_job_running(&self.pool, job_id, node_id, now).await
    }

    async fn complete_job(
        &self,
        job_id: &str,
        status: &str,
        result: Option<&str>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        complete_job(&self.pool, job_id, status, result, error, now).await
    }

    async fn request_job_cancel(&self, job_id: &str) -> Result<bool, CoreError> {
        request_job_cancel(&self.pool, job_id).await
    }

    async fn list_orphaned_jobs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkJobRecord>, CoreError> {
        list_orphaned_jobs(&self.pool, cutoff).await
    }

    async fn reassign_job(
        &self,
        job_id: &str,
        from_node: &str,
        to_node: &str,
    ) -> Result<bool, CoreError> {
        reassign_job(&self.pool, job_id, from_node, to_node).await
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        health_check(&self.pool).await
    }
}
