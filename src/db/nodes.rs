// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Runtime-node persistence.
//!
//! The node probe loop is the only writer of heartbeat/failure columns; the
//! scheduler reads candidates through [`list_online`]. Resource accounting
//! guards `allocated <= total` in SQL so two concurrent placements cannot
//! oversubscribe a node.

use super::DbPool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use tracing::debug;

/// Consecutive probe failures after which a node is marked unhealthy.
pub const UNHEALTHY_FAILURE_THRESHOLD: i32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Draining,
    Maintenance,
    Unhealthy,
}

impl NodeStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(NodeStatus::Online),
            "offline" => Some(NodeStatus::Offline),
            "draining" => Some(NodeStatus::Draining),
            "maintenance" => Some(NodeStatus::Maintenance),
            "unhealthy" => Some(NodeStatus::Unhealthy),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Draining => "draining",
            NodeStatus::Maintenance => "maintenance",
            NodeStatus::Unhealthy => "unhealthy",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NodeRecord {
    pub id: String,
    pub hostname: String,
    pub runtime_type: String,
    pub endpoint: String,
    pub status: String,
    pub total_cpu_millis: i64,
    pub total_memory_mb: i64,
    pub allocated_cpu_millis: i64,
    pub allocated_memory_mb: i64,
    pub running_containers: i32,
    pub max_containers: i32,
    pub cached_images: JsonValue,
    pub labels: JsonValue,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn status_enum(&self) -> NodeStatus {
        NodeStatus::parse(&self.status).unwrap_or(NodeStatus::Offline)
    }

    pub fn is_schedulable(&self) -> bool {
        self.status_enum() == NodeStatus::Online
            && self.consecutive_failures < UNHEALTHY_FAILURE_THRESHOLD
    }

    pub fn has_cached_image(&self, image: &str) -> bool {
        self.cached_images
            .as_array()
            .map(|a| a.iter().any(|v| v.as_str() == Some(image)))
            .unwrap_or(false)
    }

    pub fn free_cpu_millis(&self) -> i64 {
        (self.total_cpu_millis - self.allocated_cpu_millis).max(0)
    }

    pub fn free_memory_mb(&self) -> i64 {
        (self.total_memory_mb - self.allocated_memory_mb).max(0)
    }
}

pub struct NewNode<'a> {
    pub id: &'a str,
    pub hostname: &'a str,
    pub runtime_type: &'a str,
    pub endpoint: &'a str,
    pub total_cpu_millis: i64,
    pub total_memory_mb: i64,
    pub max_containers: i32,
    pub cached_images: &'a JsonValue,
    pub labels: &'a JsonValue,
}

/// Register or refresh a node keyed by hostname.
pub async fn register(pool: &DbPool, n: NewNode<'_>) -> Result<NodeRecord, sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO runtime_nodes
            (id, hostname, runtime_type, endpoint, status, total_cpu_millis,
             total_memory_mb, max_containers, cached_images, labels, last_heartbeat_at)
        VALUES (?, ?, ?, ?, 'online', ?, ?, ?, ?, ?, ?)
        ON DUPLICATE KEY UPDATE
            runtime_type = VALUES(runtime_type),
            endpoint = VALUES(endpoint),
            status = 'online',
            total_cpu_millis = VALUES(total_cpu_millis),
            total_memory_mb = VALUES(total_memory_mb),
            max_containers = VALUES(max_containers),
            cached_images = VALUES(cached_images),
            labels = VALUES(labels),
            last_heartbeat_at = VALUES(last_heartbeat_at),
            consecutive_failures = 0
        "#,
    )
    .bind(n.id)
    .bind(n.hostname)
    .bind(n.runtime_type)
    .bind(n.endpoint)
    .bind(n.total_cpu_millis)
    .bind(n.total_memory_mb)
    .bind(n.max_containers)
    .bind(n.cached_images)
    .bind(n.labels)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    debug!("Registered node {} ({})", n.id, n.hostname);
    get_by_hostname_required(pool, n.hostname).await
}

pub async fn get_by_id(pool: &DbPool, id: &str) -> Result<Option<NodeRecord>, sqlx::Error> {
    sqlx::query_as::<_, NodeRecord>("SELECT * FROM runtime_nodes WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

async fn get_by_hostname_required(pool: &DbPool, hostname: &str) -> Result<NodeRecord, sqlx::Error> {
    sqlx::query_as::<_, NodeRecord>("SELECT * FROM runtime_nodes WHERE hostname = ?")
        .bind(hostname)
        .fetch_one(pool)
        .await
}

pub async fn list(pool: &DbPool) -> Result<Vec<NodeRecord>, sqlx::Error> {
    sqlx::query_as::<_, NodeRecord>("SELECT * FROM runtime_nodes ORDER BY id")
        .fetch_all(pool)
        .await
}

/// Scheduling candidates: online and under the failure threshold.
pub async fn list_online(pool: &DbPool) -> Result<Vec<NodeRecord>, sqlx::Error> {
    sqlx::query_as::<_, NodeRecord>(
        r#"
        SELECT * FROM runtime_nodes
        WHERE status = 'online' AND consecutive_failures < ?
        ORDER BY id
        "#,
    )
    .bind(UNHEALTHY_FAILURE_THRESHOLD)
    .fetch_all(pool)
    .await
}

pub async fn probe_succeeded(pool: &DbPool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE runtime_nodes
        SET last_heartbeat_at = ?,
            consecutive_failures = 0,
            status = IF(status = 'unhealthy', 'online', status)
        WHERE id = ?
        "#,
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Increment the failure counter; crossing the threshold flips the node to
/// unhealthy in the same statement. SET clauses apply left to right, so the
/// status predicate already sees the incremented counter.
pub async fn probe_failed(pool: &DbPool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE runtime_nodes
        SET consecutive_failures = consecutive_failures + 1,
            status = IF(consecutive_failures >= ? AND status = 'online', 'unhealthy', status)
        WHERE id = ?
        "#,
    )
    .bind(UNHEALTHY_FAILURE_THRESHOLD)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Nodes silent past the threshold become unhealthy in one sweep.
pub async fn mark_stale_unhealthy(
    pool: &DbPool,
    cutoff: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE runtime_nodes
        SET status = 'unhealthy'
        WHERE status = 'online'
          AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?)
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn set_status(pool: &DbPool, id: &str, status: NodeStatus) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE runtime_nodes SET status = ? WHERE id = ?")
        .bind(status.to_string())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Reserve resources on a node. Fails (returns false) rather than
/// oversubscribe: the guard keeps allocated <= total and the container count
/// under max_containers.
pub async fn allocate(
    pool: &DbPool,
    id: &str,
    cpu_millis: i64,
    memory_mb: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE runtime_nodes
        SET allocated_cpu_millis = allocated_cpu_millis + ?,
            allocated_memory_mb = allocated_memory_mb + ?,
            running_containers = running_containers + 1
        WHERE id = ?
          AND status = 'online'
          AND allocated_cpu_millis + ? <= total_cpu_millis
          AND allocated_memory_mb + ? <= total_memory_mb
          AND running_containers < max_containers
        "#,
    )
    .bind(cpu_millis)
    .bind(memory_mb)
    .bind(id)
    .bind(cpu_millis)
    .bind(memory_mb)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Release resources. Clamped at zero so repeated releases stay safe.
pub async fn release(
    pool: &DbPool,
    id: &str,
    cpu_millis: i64,
    memory_mb: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE runtime_nodes
        SET allocated_cpu_millis = GREATEST(allocated_cpu_millis - ?, 0),
            allocated_memory_mb = GREATEST(allocated_memory_mb - ?, 0),
            running_containers = GREATEST(running_containers - 1, 0)
        WHERE id = ?
        "#,
    )
    .bind(cpu_millis)
    .bind(memory_mb)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete(pool: &DbPool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM runtime_nodes WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(status: &str, failures: i32) -> NodeRecord {
        NodeRecord {
            id: "node_abc".into(),
            hostname: "worker-1".into(),
            runtime_type: "docker".into(),
            endpoint: "http://10.0.0.1:8080".into(),
            status: status.into(),
            total_cpu_millis: 8000,
            total_memory_mb: 16384,
            allocated_cpu_millis: 2000,
            allocated_memory_mb: 4096,
            running_containers: 2,
            max_containers: 32,
            cached_images: serde_json::json!(["python:3.12-slim"]),
            labels: serde_json::json!({}),
            last_heartbeat_at: Some(Utc::now()),
            consecutive_failures: failures,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_schedulable_requires_online_and_healthy() {
        assert!(node("online", 0).is_schedulable());
        assert!(node("online", 2).is_schedulable());
        assert!(!node("online", 3).is_schedulable());
        assert!(!node("draining", 0).is_schedulable());
        assert!(!node("unhealthy", 0).is_schedulable());
        assert!(!node("maintenance", 0).is_schedulable());
    }

    #[test]
    fn test_cached_image_lookup() {
        let n = node("online", 0);
        assert!(n.has_cached_image("python:3.12-slim"));
        assert!(!n.has_cached_image("node:22-slim"));
    }

    #[test]
    fn test_free_margins() {
        let n = node("online", 0);
        assert_eq!(n.free_cpu_millis(), 6000);
        assert_eq!(n.free_memory_mb(), 12288);
    }
}
