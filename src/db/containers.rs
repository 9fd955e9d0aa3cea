// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Container row persistence (written only by the container-scheduler layer).

use super::DbPool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Exited,
    Deleting,
}

impl ContainerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ContainerStatus::Exited | ContainerStatus::Deleting)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(ContainerStatus::Created),
            "running" => Some(ContainerStatus::Running),
            "paused" => Some(ContainerStatus::Paused),
            "exited" => Some(ContainerStatus::Exited),
            "deleting" => Some(ContainerStatus::Deleting),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Deleting => "deleting",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ContainerRecord {
    pub id: String,
    pub session_id: String,
    pub runtime_type: String,
    pub node_id: Option<String>,
    pub image: String,
    pub status: String,
    pub ip: Option<String>,
    pub executor_port: Option<i32>,
    pub cpu: String,
    pub memory: String,
    pub started_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct NewContainer<'a> {
    pub id: &'a str,
    pub session_id: &'a str,
    pub runtime_type: &'a str,
    pub node_id: Option<&'a str>,
    pub image: &'a str,
    pub cpu: &'a str,
    pub memory: &'a str,
}

pub async fn create(pool: &DbPool, c: NewContainer<'_>) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO containers (id, session_id, runtime_type, node_id, image, status, cpu, memory)
        VALUES (?, ?, ?, ?, ?, 'created', ?, ?)
        "#,
    )
    .bind(c.id)
    .bind(c.session_id)
    .bind(c.runtime_type)
    .bind(c.node_id)
    .bind(c.image)
    .bind(c.cpu)
    .bind(c.memory)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_by_id(pool: &DbPool, id: &str) -> Result<Option<ContainerRecord>, sqlx::Error> {
    sqlx::query_as::<_, ContainerRecord>("SELECT * FROM containers WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn list(
    pool: &DbPool,
    session_id: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<ContainerRecord>, sqlx::Error> {
    sqlx::query_as::<_, ContainerRecord>(
        r#"
        SELECT * FROM containers
        WHERE (? IS NULL OR session_id = ?)
        ORDER BY created_at DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(session_id)
    .bind(session_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

/// The single live container a session may have, if any.
pub async fn get_live_for_session(
    pool: &DbPool,
    session_id: &str,
) -> Result<Option<ContainerRecord>, sqlx::Error> {
    sqlx::query_as::<_, ContainerRecord>(
        r#"
        SELECT * FROM containers
        WHERE session_id = ? AND status IN ('created', 'running', 'paused')
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await
}

pub async fn mark_running(
    pool: &DbPool,
    id: &str,
    ip: Option<&str>,
    executor_port: Option<i32>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE containers
        SET status = 'running', ip = ?, executor_port = ?, started_at = COALESCE(started_at, ?)
        WHERE id = ?
        "#,
    )
    .bind(ip)
    .bind(executor_port)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_exited(pool: &DbPool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE containers
        SET status = 'exited', exited_at = COALESCE(exited_at, ?)
        WHERE id = ? AND status NOT IN ('exited', 'deleting')
        "#,
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_deleting(pool: &DbPool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE containers SET status = 'deleting' WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in [
            ContainerStatus::Created,
            ContainerStatus::Running,
            ContainerStatus::Paused,
            ContainerStatus::Exited,
            ContainerStatus::Deleting,
        ] {
            assert_eq!(ContainerStatus::parse(&s.to_string()), Some(s));
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(ContainerStatus::Exited.is_terminal());
        assert!(ContainerStatus::Deleting.is_terminal());
        assert!(!ContainerStatus::Running.is_terminal());
        assert!(!ContainerStatus::Created.is_terminal());
    }
}
