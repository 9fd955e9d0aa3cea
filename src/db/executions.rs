// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Execution persistence.
//!
//! Terminal-result ingestion is idempotent through the persisted
//! `idempotency_key` column (unique index), so replays survive control-plane
//! restarts. Status transitions are guarded updates: the WHERE clause names
//! the states the transition is legal from, and zero rows affected means a
//! concurrent writer already moved the row.

use super::DbPool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use tracing::debug;

/// Truncation cap applied to stdout/stderr before persistence.
pub const MAX_STREAM_BYTES: usize = 1024 * 1024;
pub const TRUNCATION_MARKER: &str = "\n...[truncated]";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Crashed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Timeout
                | ExecutionStatus::Crashed
        )
    }

    /// Only crashes are retriable; user-code failures and timeouts are not.
    pub fn is_retriable(self) -> bool {
        self == ExecutionStatus::Crashed
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "timeout" => Some(ExecutionStatus::Timeout),
            "crashed" => Some(ExecutionStatus::Crashed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Crashed => "crashed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRecord {
    pub id: String,
    pub session_id: String,
    pub status: String,
    pub code: String,
    pub language: String,
    pub event: JsonValue,
    pub timeout_sec: i32,
    pub return_value: Option<JsonValue>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<i64>,
    pub cpu_time_ms: Option<i64>,
    pub peak_memory_mb: Option<i64>,
    pub retry_count: i32,
    pub parent_execution_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub error_detail: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn status_enum(&self) -> ExecutionStatus {
        ExecutionStatus::parse(&self.status).unwrap_or(ExecutionStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        self.status_enum().is_terminal()
    }
}

/// Truncate a stream to the persistence cap, appending the marker when cut.
/// The cut lands on a char boundary so the result stays valid UTF-8.
pub fn truncate_stream(s: &str) -> String {
    if s.len() <= MAX_STREAM_BYTES {
        return s.to_string();
    }
    let mut end = MAX_STREAM_BYTES;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = s[..end].to_string();
    out.push_str(TRUNCATION_MARKER);
    out
}

pub struct NewExecution<'a> {
    pub id: &'a str,
    pub session_id: &'a str,
    pub code: &'a str,
    pub language: &'a str,
    pub event: &'a JsonValue,
    pub timeout_sec: i32,
    pub retry_count: i32,
    pub parent_execution_id: Option<&'a str>,
}

pub async fn create(pool: &DbPool, e: NewExecution<'_>) -> Result<ExecutionRecord, sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO executions
            (id, session_id, status, code, language, event, timeout_sec,
             retry_count, parent_execution_id)
        VALUES (?, ?, 'pending', ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(e.id)
    .bind(e.session_id)
    .bind(e.code)
    .bind(e.language)
    .bind(e.event)
    .bind(e.timeout_sec)
    .bind(e.retry_count)
    .bind(e.parent_execution_id)
    .execute(pool)
    .await?;

    debug!("Created execution {} in session {}", e.id, e.session_id);
    get_required(pool, e.id).await
}

pub async fn get_by_id(pool: &DbPool, id: &str) -> Result<Option<ExecutionRecord>, sqlx::Error> {
    sqlx::query_as::<_, ExecutionRecord>("SELECT * FROM executions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_required(pool: &DbPool, id: &str) -> Result<ExecutionRecord, sqlx::Error> {
    sqlx::query_as::<_, ExecutionRecord>("SELECT * FROM executions WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
}

pub async fn list_for_session(
    pool: &DbPool,
    session_id: &str,
    status: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<ExecutionRecord>, sqlx::Error> {
    sqlx::query_as::<_, ExecutionRecord>(
        r#"
        SELECT * FROM executions
        WHERE session_id = ?
          AND (? IS NULL OR status = ?)
        ORDER BY created_at DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(session_id)
    .bind(status)
    .bind(status)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

/// Mark dispatch: the executor accepted the POST. The heartbeat clock starts
/// here, so rows awaiting dispatch are invisible to the sweeper.
pub async fn mark_dispatched(pool: &DbPool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE executions
        SET last_heartbeat_at = ?
        WHERE id = ? AND status = 'pending'
        "#,
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// pending -> running, reported by the executor's status callback.
pub async fn mark_running(pool: &DbPool, id: &str) -> Result<bool, sqlx::Error> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        UPDATE executions
        SET status = 'running', started_at = ?, last_heartbeat_at = ?
        WHERE id = ? AND status = 'pending'
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Move a live execution to a terminal state outside the result path
/// (timeout/crashed status callbacks, sweeper, cancellation).
pub async fn mark_terminal(
    pool: &DbPool,
    id: &str,
    status: ExecutionStatus,
    error_detail: Option<&str>,
) -> Result<bool, sqlx::Error> {
    debug_assert!(status.is_terminal());
    let result = sqlx::query(
        r#"
        UPDATE executions
        SET status = ?, error_detail = COALESCE(?, error_detail), completed_at = ?
        WHERE id = ? AND status IN ('pending', 'running')
        "#,
    )
    .bind(status.to_string())
    .bind(error_detail)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn heartbeat(pool: &DbPool, id: &str, at: DateTime<Utc>) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE executions
        SET last_heartbeat_at = GREATEST(COALESCE(last_heartbeat_at, ?), ?)
        WHERE id = ? AND status IN ('pending', 'running')
        "#,
    )
    .bind(at)
    .bind(at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Terminal result payload from the executor callback.
pub struct TerminalResult<'a> {
    pub status: ExecutionStatus,
    pub return_value: Option<&'a JsonValue>,
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<i64>,
    pub cpu_time_ms: Option<i64>,
    pub peak_memory_mb: Option<i64>,
    pub error_detail: Option<&'a str>,
}

/// Outcome of an idempotent result write.
#[derive(Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First arrival; the row was written.
    Inserted,
    /// Replay with a matching terminal status; stored row unchanged.
    Replayed,
    /// Replay whose terminal status disagrees with the stored row.
    Mismatch,
}

/// Idempotent terminal-result write keyed on `idempotency_key`.
///
/// The first arrival wins the guarded update; later arrivals compare against
/// the stored row. The unique index makes the race between two first
/// arrivals safe: the loser's update matches zero rows.
pub async fn ingest_result(
    pool: &DbPool,
    id: &str,
    idempotency_key: &str,
    r: TerminalResult<'_>,
) -> Result<IngestOutcome, sqlx::Error> {
    debug_assert!(r.status.is_terminal());
    let result = sqlx::query(
        r#"
        UPDATE executions
        SET status = ?,
            return_value = ?,
            stdout = ?,
            stderr = ?,
            exit_code = ?,
            duration_ms = ?,
            cpu_time_ms = ?,
            peak_memory_mb = ?,
            error_detail = ?,
            idempotency_key = ?,
            completed_at = ?
        WHERE id = ? AND idempotency_key IS NULL AND status IN ('pending', 'running')
        "#,
    )
    .bind(r.status.to_string())
    .bind(r.return_value)
    .bind(truncate_stream(r.stdout))
    .bind(truncate_stream(r.stderr))
    .bind(r.exit_code)
    .bind(r.duration_ms)
    .bind(r.cpu_time_ms)
    .bind(r.peak_memory_mb)
    .bind(r.error_detail)
    .bind(idempotency_key)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(IngestOutcome::Inserted);
    }

    let stored = get_required(pool, id).await?;
    if stored.idempotency_key.as_deref() == Some(idempotency_key)
        && stored.status == r.status.to_string()
    {
        Ok(IngestOutcome::Replayed)
    } else {
        Ok(IngestOutcome::Mismatch)
    }
}

/// A crashed execution whose retry budget is spent settles as failed with
/// solution text pointing at the retry ceiling.
pub async fn mark_retries_exhausted(pool: &DbPool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE executions
        SET status = 'failed',
            error_detail = CONCAT(
                COALESCE(CONCAT(error_detail, '; '), ''),
                'max retries reached (3 attempts total); submit a new execution'
            )
        WHERE id = ? AND status = 'crashed'
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Executions whose heartbeat went stale while live. Rows that were never
/// dispatched (NULL heartbeat) are excluded; reconciliation re-dispatches
/// those once their session is running again.
pub async fn list_stale(
    pool: &DbPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<ExecutionRecord>, sqlx::Error> {
    sqlx::query_as::<_, ExecutionRecord>(
        r#"
        SELECT * FROM executions
        WHERE status IN ('pending', 'running')
          AND last_heartbeat_at IS NOT NULL
          AND last_heartbeat_at < ?
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
}

/// Pending rows never dispatched, for a session that just became ready.
pub async fn list_awaiting_dispatch(
    pool: &DbPool,
    session_id: &str,
) -> Result<Vec<ExecutionRecord>, sqlx::Error> {
    sqlx::query_as::<_, ExecutionRecord>(
        r#"
        SELECT * FROM executions
        WHERE session_id = ? AND status = 'pending' AND last_heartbeat_at IS NULL
        ORDER BY created_at ASC
        "#,
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
}

/// Live executions for a session, used when deciding eviction handling.
pub async fn list_inflight_for_session(
    pool: &DbPool,
    session_id: &str,
) -> Result<Vec<ExecutionRecord>, sqlx::Error> {
    sqlx::query_as::<_, ExecutionRecord>(
        "SELECT * FROM executions WHERE session_id = ? AND status IN ('pending', 'running')",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Timeout,
            ExecutionStatus::Crashed,
        ] {
            assert_eq!(ExecutionStatus::parse(&s.to_string()), Some(s));
        }
    }

    #[test]
    fn test_only_crashes_retry() {
        assert!(ExecutionStatus::Crashed.is_retriable());
        assert!(!ExecutionStatus::Failed.is_retriable());
        assert!(!ExecutionStatus::Timeout.is_retriable());
        assert!(!ExecutionStatus::Completed.is_retriable());
    }

    #[test]
    fn test_truncate_short_stream_untouched() {
        assert_eq!(truncate_stream("hello"), "hello");
    }

    #[test]
    fn test_truncate_long_stream() {
        let long = "x".repeat(MAX_STREAM_BYTES + 100);
        let out = truncate_stream(&long);
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert_eq!(out.len(), MAX_STREAM_BYTES + TRUNCATION_MARKER.len());
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        // Fill up to just under the cap, then straddle it with multi-byte chars.
        let mut s = "a".repeat(MAX_STREAM_BYTES - 2);
        s.push_str("ééé");
        let out = truncate_stream(&s);
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert!(out.len() <= MAX_STREAM_BYTES + TRUNCATION_MARKER.len());
    }
}
