//! NOXRUN Execution Engine
//!
//! Sole owner of execution mutations: submit/dispatch, callback ingestion,
//! heartbeat tracking, crash detection and the retry pipeline. Delivery is
//! at-least-once; `execution_id` is the caller's deduplication key and the
//! result callback is exactly-once on the happy path via the persisted
//! idempotency key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cache::TemplateCache;
use crate::config::Config;
use crate::db::executions::{
    ExecutionRecord, ExecutionStatus, IngestOutcome, NewExecution, TerminalResult,
};
use crate::db::sessions::SessionStatus;
use crate::db::{self, DbPool};
use crate::error::ApiError;
use crate::ids;
use crate::metrics::Metrics;
use crate::security;

/// Hard ceiling on a single execution's timeout.
const MAX_EXECUTION_TIMEOUT_SECS: i64 = 3600;

/// Total attempts including the original submission.
pub const MAX_ATTEMPTS: i32 = 3;

/// Local dispatch retries for transient connect/5xx failures.
const DISPATCH_ATTEMPTS: u32 = 3;

/// Exponential backoff before retry attempt `n` (1-based): min(2^(n-1), 10) s.
pub fn retry_backoff_secs(attempt: i32) -> u64 {
    let shifted = 1u64.checked_shl((attempt - 1).max(0) as u32).unwrap_or(u64::MAX);
    shifted.min(10)
}

#[derive(Debug, Deserialize)]
pub struct SubmitParams {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub event: JsonValue,
    pub timeout: Option<i64>,
}

/// Body POSTed to the in-container executor.
#[derive(Debug, Serialize)]
struct DispatchBody<'a> {
    execution_id: &'a str,
    code: &'a str,
    language: &'a str,
    event: &'a JsonValue,
    timeout: i32,
}

/// Metrics block of the result callback.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionMetrics {
    pub duration_ms: Option<i64>,
    pub cpu_time_ms: Option<i64>,
    pub peak_memory_mb: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ResultPayload {
    pub status: String,
    #[serde(default)]
    pub return_value: Option<JsonValue>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub metrics: ExecutionMetrics,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactPayload {
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub path: String,
    pub size_bytes: Option<i64>,
    pub mime_type: Option<String>,
    pub checksum: Option<String>,
}

/// Artifact kinds the executor may report.
pub const ARTIFACT_TYPES: &[&str] = &["file", "stdout", "stderr", "return_value"];

pub fn is_artifact_type(kind: &str) -> bool {
    ARTIFACT_TYPES.contains(&kind)
}

#[derive(Clone)]
pub struct ExecutionEngine {
    db: DbPool,
    http: reqwest::Client,
    template_cache: Arc<TemplateCache>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
}

impl ExecutionEngine {
    pub fn new(
        db: DbPool,
        template_cache: Arc<TemplateCache>,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
    ) -> Self {
        // Every outbound call carries bounded timeouts.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { db, http, template_cache, config, metrics }
    }

    pub fn db(&self) -> &DbPool {
        &self.db
    }

    // ---- Submit ----------------------------------------------------------

    pub async fn submit(
        &self,
        session_id: &str,
        params: SubmitParams,
    ) -> Result<ExecutionRecord, ApiError> {
        let session = db::sessions::get_by_id(&self.db, session_id)
            .await?
            .ok_or_else(|| ApiError::not_found("session", session_id))?;

        if session.status_enum() != SessionStatus::Running {
            return Err(ApiError::state_conflict(
                format!("session {} is {}, not running", session_id, session.status),
                "Wait for the session to reach running, or create a new session.",
            ));
        }

        let template = match self.template_cache.get(&session.template_id) {
            Some(cached) => cached,
            None => {
                let record = db::templates::get_required(&self.db, &session.template_id).await?;
                self.template_cache.put(session.template_id.clone(), record.clone());
                record
            }
        };
        if !params.language.eq_ignore_ascii_case(&template.runtime_type) {
            return Err(ApiError::invalid_parameter(format!(
                "language '{}' is not compatible with the session runtime '{}'",
                params.language, template.runtime_type
            )));
        }
        if params.code.is_empty() {
            return Err(ApiError::invalid_parameter("code must not be empty"));
        }

        let remaining = (session.expires_at - Utc::now()).num_seconds();
        let ceiling = MAX_EXECUTION_TIMEOUT_SECS.min(remaining);
        let timeout = params.timeout.unwrap_or(ceiling.min(300));
        if timeout <= 0 || timeout > ceiling {
            return Err(ApiError::invalid_parameter(format!(
                "timeout must be in 1..={} seconds (bounded by the session's remaining budget)",
                ceiling.max(0)
            )));
        }

        let execution_id = ids::new_execution_id();
        let record = db::executions::create(
            &self.db,
            NewExecution {
                id: &execution_id,
                session_id,
                code: &params.code,
                language: &params.language,
                event: &params.event,
                timeout_sec: timeout as i32,
                retry_count: 0,
                parent_execution_id: None,
            },
        )
        .await?;

        db::sessions::touch(&self.db, session_id).await.ok();
        self.metrics.executions_submitted.inc();
        info!("Execution {} submitted to session {}", execution_id, session_id);

        if let Some(endpoint) = session.executor_endpoint.clone() {
            let engine = self.clone();
            let dispatched = record.clone();
            tokio::spawn(async move {
                engine.dispatch(&dispatched, &endpoint).await;
            });
        }

        Ok(record)
    }

    /// POST the execution to the session's executor with bounded local
    /// retries on transient failures; a persistent failure fails the row.
    pub async fn dispatch(&self, execution: &ExecutionRecord, endpoint: &str) {
        let url = format!("{}/execute", endpoint.trim_end_matches('/'));
        let body = DispatchBody {
            execution_id: &execution.id,
            code: &execution.code,
            language: &execution.language,
            event: &execution.event,
            timeout: execution.timeout_sec,
        };

        let mut last_error = String::new();
        for attempt in 1..=DISPATCH_ATTEMPTS {
            match self.http.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    db::executions::mark_dispatched(&self.db, &execution.id).await.ok();
                    debug!("Execution {} dispatched to {}", execution.id, url);
                    return;
                }
                Ok(resp) if resp.status().is_server_error() => {
                    last_error = format!("executor returned {}", resp.status());
                }
                Ok(resp) => {
                    // 4xx is not transient; the executor rejected the body.
                    last_error = format!("executor rejected submit: {}", resp.status());
                    break;
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
            tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
        }

        warn!("Dispatch of {} failed permanently: {}", execution.id, last_error);
        self.metrics.executions_failed.inc();
        let detail = format!("executor submit failed: {}", last_error);
        let _ = db::executions::mark_terminal(
            &self.db,
            &execution.id,
            ExecutionStatus::Failed,
            Some(&detail),
        )
        .await;
    }

    /// Dispatch rows that were created while the session had no live
    /// container (retries waiting for migration, restart recovery).
    pub async fn dispatch_waiting(&self, session_id: &str) -> Result<(), ApiError> {
        let session = db::sessions::get_required(&self.db, session_id).await?;
        let Some(endpoint) = session.executor_endpoint.clone() else {
            return Ok(());
        };
        let waiting = db::executions::list_awaiting_dispatch(&self.db, session_id).await?;
        for execution in waiting {
            self.dispatch(&execution, &endpoint).await;
        }
        Ok(())
    }

    // ---- Reads -----------------------------------------------------------

    pub async fn get(&self, id: &str) -> Result<ExecutionRecord, ApiError> {
        if !ids::is_execution_id(id) {
            return Err(ApiError::invalid_parameter(format!("'{}' is not an execution id", id)));
        }
        db::executions::get_by_id(&self.db, id)
            .await?
            .ok_or_else(|| ApiError::not_found("execution", id))
    }

    pub async fn list_for_session(
        &self,
        session_id: &str,
        status: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExecutionRecord>, ApiError> {
        if let Some(s) = status {
            if ExecutionStatus::parse(s).is_none() {
                return Err(ApiError::invalid_parameter(format!("unknown status '{}'", s)));
            }
        }
        Ok(db::executions::list_for_session(&self.db, session_id, status, limit, offset).await?)
    }

    // ---- Callback ingress ------------------------------------------------

    /// Idempotent terminal-result ingestion. Returns the outcome plus the
    /// stored row (which replays must echo bit-identically).
    pub async fn ingest_result(
        &self,
        execution_id: &str,
        idempotency_key: &str,
        payload: ResultPayload,
    ) -> Result<(IngestOutcome, ExecutionRecord), ApiError> {
        let execution = self.get(execution_id).await?;

        let canonical = ids::result_idempotency_key(execution_id);
        if idempotency_key != canonical {
            return Err(ApiError::invalid_parameter(format!(
                "Idempotency-Key must be '{}'",
                canonical
            )));
        }

        let status = ExecutionStatus::parse(&payload.status)
            .filter(|s| s.is_terminal())
            .ok_or_else(|| {
                ApiError::invalid_parameter(format!(
                    "'{}' is not a terminal execution status",
                    payload.status
                ))
            })?;

        let outcome = db::executions::ingest_result(
            &self.db,
            execution_id,
            &canonical,
            TerminalResult {
                status,
                return_value: payload.return_value.as_ref(),
                stdout: &payload.stdout,
                stderr: &payload.stderr,
                exit_code: payload.exit_code,
                duration_ms: payload.metrics.duration_ms,
                cpu_time_ms: payload.metrics.cpu_time_ms,
                peak_memory_mb: payload.metrics.peak_memory_mb,
                error_detail: payload.error.as_deref(),
            },
        )
        .await?;

        match outcome {
            IngestOutcome::Inserted => {
                db::sessions::touch(&self.db, &execution.session_id).await.ok();
                if let Some(ms) = payload.metrics.duration_ms {
                    self.metrics.execution_duration_ms.observe(ms.max(0) as u64);
                }
                match status {
                    ExecutionStatus::Completed => self.metrics.executions_completed.inc(),
                    _ => self.metrics.executions_failed.inc(),
                }
                if !payload.artifacts.is_empty() {
                    self.append_artifacts(execution_id, &payload.artifacts).await?;
                }
            }
            IngestOutcome::Replayed => {
                self.metrics.callbacks_deduplicated.inc();
                debug!("Replayed result callback for {}", execution_id);
            }
            IngestOutcome::Mismatch => {
                return Err(ApiError::state_conflict(
                    format!("execution {} already has a different terminal result", execution_id),
                    "Fetch the stored result; do not resend a conflicting body.",
                ));
            }
        }

        let stored = db::executions::get_required(&self.db, execution_id).await?;
        Ok((outcome, stored))
    }

    /// Non-terminal status callbacks: running, timeout, crashed.
    pub async fn status_callback(
        &self,
        execution_id: &str,
        status: &str,
        detail: Option<&str>,
    ) -> Result<ExecutionRecord, ApiError> {
        let execution = self.get(execution_id).await?;

        match ExecutionStatus::parse(status) {
            Some(ExecutionStatus::Running) => {
                db::executions::mark_running(&self.db, execution_id).await?;
                db::sessions::touch(&self.db, &execution.session_id).await.ok();
            }
            Some(ExecutionStatus::Timeout) => {
                db::executions::mark_terminal(&self.db, execution_id, ExecutionStatus::Timeout, detail)
                    .await?;
                self.metrics.executions_failed.inc();
            }
            Some(ExecutionStatus::Crashed) => {
                if db::executions::mark_terminal(
                    &self.db,
                    execution_id,
                    ExecutionStatus::Crashed,
                    detail,
                )
                .await?
                {
                    self.handle_crash(&db::executions::get_required(&self.db, execution_id).await?)
                        .await?;
                }
            }
            _ => {
                return Err(ApiError::invalid_parameter(format!(
                    "'{}' is not a valid status transition",
                    status
                )))
            }
        }

        Ok(db::executions::get_required(&self.db, execution_id).await?)
    }

    pub async fn heartbeat(
        &self,
        execution_id: &str,
        timestamp: Option<DateTime<Utc>>,
        progress: Option<&JsonValue>,
    ) -> Result<(), ApiError> {
        let at = timestamp.unwrap_or_else(Utc::now);
        let live = db::executions::heartbeat(&self.db, execution_id, at).await?;
        if !live {
            // Heartbeats for finished rows are harmless replays.
            debug!("Heartbeat for non-live execution {}", execution_id);
        }
        if let Some(p) = progress {
            debug!("Execution {} progress: {}", execution_id, p);
        }
        Ok(())
    }

    /// Append artifact rows (append-only; replays add nothing new because
    /// the executor sends the list exactly once per terminal result).
    pub async fn append_artifacts(
        &self,
        execution_id: &str,
        items: &[ArtifactPayload],
    ) -> Result<u64, ApiError> {
        let execution = self.get(execution_id).await?;
        let session = db::sessions::get_required(&self.db, &execution.session_id).await?;

        let mut appended = 0u64;
        for item in items {
            if !is_artifact_type(&item.artifact_type) {
                return Err(ApiError::invalid_parameter(format!(
                    "unknown artifact type '{}'",
                    item.artifact_type
                )));
            }
            if security::validate_workspace_path(&item.path).is_err() {
                warn!("Skipping artifact with unsafe path: {}", item.path);
                continue;
            }
            let object_path = format!(
                "{}/{}",
                session.workspace_object_path.trim_end_matches('/'),
                item.path
            );
            db::artifacts::append(
                &self.db,
                db::artifacts::NewArtifact {
                    id: &ids::new_artifact_id(),
                    execution_id,
                    artifact_type: &item.artifact_type,
                    path: &item.path,
                    object_path: &object_path,
                    size_bytes: item.size_bytes.unwrap_or(0),
                    mime_type: item.mime_type.as_deref(),
                    checksum: item.checksum.as_deref(),
                },
            )
            .await?;
            appended += 1;
        }
        Ok(appended)
    }

    /// Explicit cancellation; cancelled executions never retry.
    pub async fn cancel(&self, execution_id: &str) -> Result<ExecutionRecord, ApiError> {
        let execution = self.get(execution_id).await?;
        if execution.is_terminal() {
            return Ok(execution);
        }
        db::executions::mark_terminal(
            &self.db,
            execution_id,
            ExecutionStatus::Failed,
            Some("cancelled by caller"),
        )
        .await?;
        self.metrics.executions_failed.inc();
        Ok(db::executions::get_required(&self.db, execution_id).await?)
    }

    // ---- Crash handling & retry pipeline ---------------------------------

    /// Heartbeat sweep: mark stale live executions crashed and feed them to
    /// the retry policy.
    pub async fn sweep_stale_heartbeats(&self) -> Result<u64, ApiError> {
        let cutoff = Utc::now()
            - chrono::Duration::seconds(self.config.lifecycle.heartbeat_timeout_secs as i64);
        let stale = db::executions::list_stale(&self.db, cutoff).await?;
        let mut crashed = 0u64;

        for execution in stale {
            let detail = format!(
                "no heartbeat since {} (timeout {}s)",
                execution
                    .last_heartbeat_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string()),
                self.config.lifecycle.heartbeat_timeout_secs
            );
            if db::executions::mark_terminal(
                &self.db,
                &execution.id,
                ExecutionStatus::Crashed,
                Some(&detail),
            )
            .await?
            {
                crashed += 1;
                let current = db::executions::get_required(&self.db, &execution.id).await?;
                self.handle_crash(&current).await?;
            }
        }

        if crashed > 0 {
            info!("Heartbeat sweeper crashed {} stalled executions", crashed);
        }
        Ok(crashed)
    }

    /// Retry policy: at most [`MAX_ATTEMPTS`] total, exponential backoff,
    /// new row linked via parent_execution_id.
    pub async fn handle_crash(&self, execution: &ExecutionRecord) -> Result<(), ApiError> {
        self.metrics.executions_crashed.inc();

        if execution.retry_count >= MAX_ATTEMPTS - 1 {
            db::executions::mark_retries_exhausted(&self.db, &execution.id).await?;
            info!("Execution {} exhausted its retry budget", execution.id);
            return Ok(());
        }

        let retry_count = execution.retry_count + 1;
        let retry_id = ids::new_execution_id();
        db::executions::create(
            &self.db,
            NewExecution {
                id: &retry_id,
                session_id: &execution.session_id,
                code: &execution.code,
                language: &execution.language,
                event: &execution.event,
                timeout_sec: execution.timeout_sec,
                retry_count,
                parent_execution_id: Some(&execution.id),
            },
        )
        .await?;
        self.metrics.executions_retried.inc();

        let backoff = retry_backoff_secs(retry_count);
        info!(
            "Retrying execution {} as {} (attempt {}, backoff {}s)",
            execution.id,
            retry_id,
            retry_count + 1,
            backoff
        );

        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            if let Err(e) = engine.dispatch_retry(&retry_id).await {
                error!("Retry dispatch for {} failed: {}", retry_id, e);
            }
        });

        Ok(())
    }

    async fn dispatch_retry(&self, retry_id: &str) -> Result<(), ApiError> {
        let execution = db::executions::get_required(&self.db, retry_id).await?;
        if execution.status_enum() != ExecutionStatus::Pending {
            return Ok(());
        }
        let session = db::sessions::get_required(&self.db, &execution.session_id).await?;

        // A migrating session has no endpoint yet; the row stays pending
        // with a NULL heartbeat and dispatches on the next container_ready.
        if session.status_enum() != SessionStatus::Running {
            debug!(
                "Retry {} waiting: session {} is {}",
                retry_id, session.id, session.status
            );
            return Ok(());
        }
        if let Some(endpoint) = session.executor_endpoint {
            self.dispatch(&execution, &endpoint).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(retry_backoff_secs(1), 1);
        assert_eq!(retry_backoff_secs(2), 2);
        assert_eq!(retry_backoff_secs(3), 4);
        assert_eq!(retry_backoff_secs(4), 8);
        assert_eq!(retry_backoff_secs(5), 10);
        assert_eq!(retry_backoff_secs(20), 10);
    }

    #[test]
    fn test_attempt_budget() {
        // retry_count 0 and 1 may spawn a retry; retry_count 2 may not.
        assert_eq!(MAX_ATTEMPTS, 3);
        assert!(0 < MAX_ATTEMPTS - 1);
        assert!(1 < MAX_ATTEMPTS - 1);
        assert!(2 >= MAX_ATTEMPTS - 1);
    }

    #[test]
    fn test_artifact_types() {
        for kind in ["file", "stdout", "stderr", "return_value"] {
            assert!(is_artifact_type(kind));
        }
        assert!(!is_artifact_type("directory"));
        assert!(!is_artifact_type(""));
        assert!(!is_artifact_type("File"));
    }

    #[test]
    fn test_result_payload_defaults() {
        let payload: ResultPayload = serde_json::from_value(serde_json::json!({
            "status": "completed",
            "return_value": {"n": 42},
            "exit_code": 0
        }))
        .unwrap();
        assert_eq!(payload.status, "completed");
        assert_eq!(payload.stdout, "");
        assert!(payload.artifacts.is_empty());
        assert!(payload.metrics.duration_ms.is_none());
    }

    #[test]
    fn test_dispatch_body_shape() {
        let event = serde_json::json!({"x": 10, "y": 32});
        let body = DispatchBody {
            execution_id: "exec_20250101_abcd1234",
            code: "def handler(event): return 1",
            language: "python",
            event: &event,
            timeout: 300,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["execution_id"], "exec_20250101_abcd1234");
        assert_eq!(json["timeout"], 300);
        assert_eq!(json["event"]["x"], 10);
    }
}
