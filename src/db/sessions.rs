// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Session persistence: CRUD plus version-CAS status transitions.
//!
//! Every mutating statement bumps `version` and matches on the version the
//! caller read; zero rows affected means a concurrent writer won and the
//! caller must re-read, never overwrite.

use super::DbPool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Creating,
    Running,
    Completed,
    Failed,
    Timeout,
    Terminated,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Failed
                | SessionStatus::Timeout
                | SessionStatus::Terminated
        )
    }

    /// The session state machine. Self-transitions are not legal; terminal
    /// states have no successors.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Creating, Running)
                | (Creating, Failed)
                | (Creating, Terminated)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Timeout)
                | (Running, Terminated)
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(SessionStatus::Creating),
            "running" => Some(SessionStatus::Running),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            "timeout" => Some(SessionStatus::Timeout),
            "terminated" => Some(SessionStatus::Terminated),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Creating => "creating",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Timeout => "timeout",
            SessionStatus::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Ephemeral,
    Persistent,
}

impl SessionMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ephemeral" => Some(SessionMode::Ephemeral),
            "persistent" => Some(SessionMode::Persistent),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::Ephemeral => write!(f, "ephemeral"),
            SessionMode::Persistent => write!(f, "persistent"),
        }
    }
}

/// Dependency installation progress, reported by the entrypoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DependencyStatus {
    Pending,
    Installing,
    Completed,
    Failed,
}

impl std::fmt::Display for DependencyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyStatus::Pending => write!(f, "pending"),
            DependencyStatus::Installing => write!(f, "installing"),
            DependencyStatus::Completed => write!(f, "completed"),
            DependencyStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Persistent session row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionRecord {
    pub id: String,
    pub template_id: String,
    pub status: String,
    pub mode: String,
    pub cpu: String,
    pub memory: String,
    pub disk: String,
    pub env: JsonValue,
    pub container_id: Option<String>,
    pub node_id: Option<String>,
    pub workspace_object_path: String,
    pub executor_endpoint: Option<String>,
    pub agent_affinity_id: Option<String>,
    pub dependency_status: String,
    pub requested_packages: JsonValue,
    pub installed_packages: JsonValue,
    pub install_error: Option<String>,
    pub error_detail: Option<String>,
    pub timeout_sec: i32,
    pub version: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn status_enum(&self) -> SessionStatus {
        SessionStatus::parse(&self.status).unwrap_or(SessionStatus::Failed)
    }

    pub fn mode_enum(&self) -> SessionMode {
        SessionMode::parse(&self.mode).unwrap_or(SessionMode::Ephemeral)
    }

    pub fn is_terminal(&self) -> bool {
        self.status_enum().is_terminal()
    }
}

/// Fields needed to insert a new session row.
pub struct NewSession<'a> {
    pub id: &'a str,
    pub template_id: &'a str,
    pub mode: SessionMode,
    pub cpu: &'a str,
    pub memory: &'a str,
    pub disk: &'a str,
    pub env: &'a JsonValue,
    pub workspace_object_path: &'a str,
    pub agent_affinity_id: Option<&'a str>,
    pub requested_packages: &'a JsonValue,
    pub timeout_sec: i32,
    pub expires_at: DateTime<Utc>,
}

pub async fn create(pool: &DbPool, s: NewSession<'_>) -> Result<SessionRecord, sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO sessions
            (id, template_id, status, mode, cpu, memory, disk, env,
             workspace_object_path, agent_affinity_id, requested_packages,
             installed_packages, timeout_sec, expires_at, last_activity_at)
        VALUES (?, ?, 'creating', ?, ?, ?, ?, ?, ?, ?, ?, JSON_ARRAY(), ?, ?, ?)
        "#,
    )
    .bind(s.id)
    .bind(s.template_id)
    .bind(s.mode.to_string())
    .bind(s.cpu)
    .bind(s.memory)
    .bind(s.disk)
    .bind(s.env)
    .bind(s.workspace_object_path)
    .bind(s.agent_affinity_id)
    .bind(s.requested_packages)
    .bind(s.timeout_sec)
    .bind(s.expires_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    debug!("Created session {} from template {}", s.id, s.template_id);
    get_required(pool, s.id).await
}

pub async fn get_by_id(pool: &DbPool, id: &str) -> Result<Option<SessionRecord>, sqlx::Error> {
    sqlx::query_as::<_, SessionRecord>("SELECT * FROM sessions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_required(pool: &DbPool, id: &str) -> Result<SessionRecord, sqlx::Error> {
    sqlx::query_as::<_, SessionRecord>("SELECT * FROM sessions WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
}

/// List sessions with optional status/template filters, newest first.
pub async fn list(
    pool: &DbPool,
    status: Option<&str>,
    template_id: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<SessionRecord>, sqlx::Error> {
    sqlx::query_as::<_, SessionRecord>(
        r#"
        SELECT * FROM sessions
        WHERE (? IS NULL OR status = ?)
          AND (? IS NULL OR template_id = ?)
        ORDER BY created_at DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(status)
    .bind(status)
    .bind(template_id)
    .bind(template_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

/// Sessions the reconciler cares about: anything non-terminal.
pub async fn list_active(pool: &DbPool) -> Result<Vec<SessionRecord>, sqlx::Error> {
    sqlx::query_as::<_, SessionRecord>(
        "SELECT * FROM sessions WHERE status IN ('creating', 'running')",
    )
    .fetch_all(pool)
    .await
}

pub async fn list_expired(pool: &DbPool, now: DateTime<Utc>) -> Result<Vec<SessionRecord>, sqlx::Error> {
    sqlx::query_as::<_, SessionRecord>(
        "SELECT * FROM sessions WHERE status = 'running' AND expires_at < ?",
    )
    .bind(now)
    .fetch_all(pool)
    .await
}

pub async fn list_idle(
    pool: &DbPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<SessionRecord>, sqlx::Error> {
    sqlx::query_as::<_, SessionRecord>(
        "SELECT * FROM sessions WHERE status = 'running' AND last_activity_at < ?",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
}

/// Running sessions created before the max-lifetime cutoff.
pub async fn list_exceeding_lifetime(
    pool: &DbPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<SessionRecord>, sqlx::Error> {
    sqlx::query_as::<_, SessionRecord>(
        "SELECT * FROM sessions WHERE status = 'running' AND created_at < ?",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
}

/// Sessions stuck in `creating` past the ready-callback deadline.
pub async fn list_stuck_creating(
    pool: &DbPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<SessionRecord>, sqlx::Error> {
    sqlx::query_as::<_, SessionRecord>(
        "SELECT * FROM sessions WHERE status = 'creating' AND created_at < ?",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
}

pub async fn count_referencing_template(
    pool: &DbPool,
    template_id: &str,
) -> Result<i64, sqlx::Error> {
    let count: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM sessions
        WHERE template_id = ?
          AND status NOT IN ('completed', 'failed', 'timeout', 'terminated')
        "#,
    )
    .bind(template_id)
    .fetch_one(pool)
    .await?;
    Ok(count.0)
}

/// Transition creating -> running on the container-ready callback. A ready
/// executor implies the entrypoint's install phase finished, so the
/// dependency columns settle here too. MySQL applies SET clauses left to
/// right, which is why installed_packages reads dependency_status first.
pub async fn cas_mark_running(
    pool: &DbPool,
    id: &str,
    version: i64,
    executor_endpoint: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE sessions
        SET status = 'running',
            executor_endpoint = ?,
            installed_packages = IF(
                dependency_status IN ('pending', 'installing'),
                requested_packages, installed_packages
            ),
            dependency_status = IF(
                dependency_status IN ('pending', 'installing'),
                'completed', dependency_status
            ),
            started_at = ?,
            last_activity_at = ?,
            version = version + 1
        WHERE id = ? AND version = ? AND status = 'creating'
        "#,
    )
    .bind(executor_endpoint)
    .bind(Utc::now())
    .bind(Utc::now())
    .bind(id)
    .bind(version)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Transition to a terminal failure state with detail.
pub async fn cas_mark_failed(
    pool: &DbPool,
    id: &str,
    version: i64,
    status: SessionStatus,
    error_detail: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE sessions
        SET status = ?, error_detail = ?, terminated_at = ?, version = version + 1
        WHERE id = ? AND version = ?
        "#,
    )
    .bind(status.to_string())
    .bind(error_detail)
    .bind(Utc::now())
    .bind(id)
    .bind(version)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Record the placement decision made at create time (or re-scheduling).
pub async fn cas_set_placement(
    pool: &DbPool,
    id: &str,
    version: i64,
    node_id: Option<&str>,
    container_id: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE sessions
        SET node_id = ?, container_id = ?, version = version + 1
        WHERE id = ? AND version = ?
        "#,
    )
    .bind(node_id)
    .bind(container_id)
    .bind(id)
    .bind(version)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Re-enter `creating` for a persistent session being migrated to a new node.
pub async fn cas_requeue_for_migration(
    pool: &DbPool,
    id: &str,
    version: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE sessions
        SET status = 'creating',
            container_id = NULL,
            node_id = NULL,
            executor_endpoint = NULL,
            version = version + 1
        WHERE id = ? AND version = ? AND status = 'running'
        "#,
    )
    .bind(id)
    .bind(version)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_dependency_status(
    pool: &DbPool,
    id: &str,
    status: DependencyStatus,
    installed: Option<&JsonValue>,
    install_error: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE sessions
        SET dependency_status = ?,
            installed_packages = COALESCE(?, installed_packages),
            install_error = ?
        WHERE id = ?
        "#,
    )
    .bind(status.to_string())
    .bind(installed)
    .bind(install_error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Bump the activity clock. Monotonic, so no CAS needed.
pub async fn touch(pool: &DbPool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE sessions SET last_activity_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Detach sessions from a node being deleted; containers must be gone first.
pub async fn detach_node(pool: &DbPool, node_id: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE sessions SET node_id = NULL WHERE node_id = ?")
        .bind(node_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in [
            SessionStatus::Creating,
            SessionStatus::Running,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Timeout,
            SessionStatus::Terminated,
        ] {
            assert_eq!(SessionStatus::parse(&s.to_string()), Some(s));
        }
        assert_eq!(SessionStatus::parse("bogus"), None);
    }

    #[test]
    fn test_state_machine_legal_paths() {
        use SessionStatus::*;
        assert!(Creating.can_transition_to(Running));
        assert!(Creating.can_transition_to(Failed));
        assert!(Creating.can_transition_to(Terminated));
        assert!(Running.can_transition_to(Terminated));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Timeout));
    }

    #[test]
    fn test_state_machine_illegal_paths() {
        use SessionStatus::*;
        assert!(!Creating.can_transition_to(Timeout));
        assert!(!Creating.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Creating));
        assert!(!Terminated.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Timeout.can_transition_to(Terminated));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_terminal_states() {
        use SessionStatus::*;
        assert!(!Creating.is_terminal());
        assert!(!Running.is_terminal());
        for s in [Completed, Failed, Timeout, Terminated] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn test_transition_matrix_is_exact() {
        use SessionStatus::*;
        let all = [Creating, Running, Completed, Failed, Timeout, Terminated];
        let legal = [
            (Creating, Running),
            (Creating, Failed),
            (Creating, Terminated),
            (Running, Completed),
            (Running, Failed),
            (Running, Timeout),
            (Running, Terminated),
        ];
        for from in all {
            for to in all {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "transition {} -> {} should be {}",
                    from,
                    to,
                    expected
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_successors() {
        use SessionStatus::*;
        for from in [Completed, Failed, Timeout, Terminated] {
            for to in [Creating, Running, Completed, Failed, Timeout, Terminated] {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(SessionMode::parse("ephemeral"), Some(SessionMode::Ephemeral));
        assert_eq!(SessionMode::parse("persistent"), Some(SessionMode::Persistent));
        assert_eq!(SessionMode::parse("forever"), None);
    }
}
