// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Request/response bodies for both API surfaces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::db::artifacts::ArtifactRecord;
use crate::db::containers::ContainerRecord;
use crate::db::executions::ExecutionRecord;
use crate::db::sessions::SessionRecord;
use crate::db::templates::TemplateRecord;

// ---- Pagination ----------------------------------------------------------

pub const MAX_PAGE_LIMIT: i64 = 200;
pub const DEFAULT_PAGE_LIMIT: i64 = 50;

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub status: Option<String>,
    pub template_id: Option<String>,
    pub session_id: Option<String>,
}

impl PageParams {
    /// Clamp to the documented window: limit in [1, 200], default 50.
    pub fn clamped(&self) -> (i64, i64) {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

// ---- Sessions ------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ResourcesDto {
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub disk: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub template_id: String,
    pub resources: Option<ResourcesDto>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub timeout: Option<i64>,
    pub mode: Option<String>,
    pub agent_id: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DependencyInstallDto {
    pub status: String,
    pub requested: JsonValue,
    pub installed: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub template_id: String,
    pub status: String,
    pub mode: String,
    pub resources: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub workspace_object_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_affinity_id: Option<String>,
    pub dependency_install: DependencyInstallDto,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<SessionRecord> for SessionResponse {
    fn from(s: SessionRecord) -> Self {
        let resources = HashMap::from([
            ("cpu".to_string(), s.cpu.clone()),
            ("memory".to_string(), s.memory.clone()),
            ("disk".to_string(), s.disk.clone()),
        ]);
        Self {
            session_id: s.id,
            template_id: s.template_id,
            status: s.status,
            mode: s.mode,
            resources,
            container_id: s.container_id,
            node_id: s.node_id,
            workspace_object_path: s.workspace_object_path,
            agent_affinity_id: s.agent_affinity_id,
            dependency_install: DependencyInstallDto {
                status: s.dependency_status,
                requested: s.requested_packages,
                installed: s.installed_packages,
                error: s.install_error,
            },
            error_detail: s.error_detail,
            created_at: s.created_at,
            started_at: s.started_at,
            terminated_at: s.terminated_at,
            last_activity_at: s.last_activity_at,
            expires_at: s.expires_at,
        }
    }
}

// ---- Executions ----------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub execution_id: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ExecutionStatusResponse {
    pub execution_id: String,
    pub session_id: String,
    pub status: String,
    pub retry_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&ExecutionRecord> for ExecutionStatusResponse {
    fn from(e: &ExecutionRecord) -> Self {
        Self {
            execution_id: e.id.clone(),
            session_id: e.session_id.clone(),
            status: e.status.clone(),
            retry_count: e.retry_count,
            parent_execution_id: e.parent_execution_id.clone(),
            started_at: e.started_at,
            completed_at: e.completed_at,
            created_at: e.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExecutionMetricsDto {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_memory_mb: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ArtifactDto {
    pub artifact_id: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub path: String,
    pub object_path: String,
    pub size_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl From<ArtifactRecord> for ArtifactDto {
    fn from(a: ArtifactRecord) -> Self {
        Self {
            artifact_id: a.id,
            artifact_type: a.artifact_type,
            path: a.path,
            object_path: a.object_path,
            size_bytes: a.size_bytes,
            mime_type: a.mime_type,
            checksum: a.checksum,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExecutionResultResponse {
    pub execution_id: String,
    pub session_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub metrics: ExecutionMetricsDto,
    pub retry_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub artifacts: Vec<ArtifactDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionResultResponse {
    pub fn from_record(e: ExecutionRecord, artifacts: Vec<ArtifactRecord>) -> Self {
        Self {
            execution_id: e.id,
            session_id: e.session_id,
            status: e.status,
            return_value: e.return_value,
            stdout: e.stdout,
            stderr: e.stderr,
            exit_code: e.exit_code,
            metrics: ExecutionMetricsDto {
                duration_ms: e.duration_ms,
                cpu_time_ms: e.cpu_time_ms,
                peak_memory_mb: e.peak_memory_mb,
            },
            retry_count: e.retry_count,
            error_detail: e.error_detail,
            artifacts: artifacts.into_iter().map(ArtifactDto::from).collect(),
            started_at: e.started_at,
            completed_at: e.completed_at,
        }
    }
}

// ---- Templates -----------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
    pub image: String,
    pub runtime_type: String,
    pub default_cpu: Option<String>,
    pub default_memory: Option<String>,
    pub default_disk: Option<String>,
    pub default_timeout_sec: Option<i32>,
    #[serde(default)]
    pub preinstalled_packages: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTemplateRequest {
    pub image: Option<String>,
    pub default_cpu: Option<String>,
    pub default_memory: Option<String>,
    pub default_disk: Option<String>,
    pub default_timeout_sec: Option<i32>,
    pub preinstalled_packages: Option<Vec<String>>,
    pub active: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct TemplateResponse {
    pub template_id: String,
    pub name: String,
    pub image: String,
    pub runtime_type: String,
    pub default_cpu: String,
    pub default_memory: String,
    pub default_disk: String,
    pub default_timeout_sec: i32,
    pub preinstalled_packages: JsonValue,
    pub run_as_user: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<TemplateRecord> for TemplateResponse {
    fn from(t: TemplateRecord) -> Self {
        Self {
            template_id: t.id,
            name: t.name,
            image: t.image,
            runtime_type: t.runtime_type,
            default_cpu: t.default_cpu,
            default_memory: t.default_memory,
            default_disk: t.default_disk,
            default_timeout_sec: t.default_timeout_sec,
            preinstalled_packages: t.preinstalled_packages,
            run_as_user: t.run_as_user,
            active: t.active,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

// ---- Containers ----------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ContainerResponse {
    pub container_id: String,
    pub session_id: String,
    pub runtime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub image: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_port: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<ContainerRecord> for ContainerResponse {
    fn from(c: ContainerRecord) -> Self {
        Self {
            container_id: c.id,
            session_id: c.session_id,
            runtime_type: c.runtime_type,
            node_id: c.node_id,
            image: c.image,
            status: c.status,
            ip: c.ip,
            executor_port: c.executor_port,
            started_at: c.started_at,
            exited_at: c.exited_at,
            created_at: c.created_at,
        }
    }
}

// ---- Internal callbacks --------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ContainerReadyRequest {
    pub executor_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ContainerExitedRequest {
    pub exit_code: i64,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusCallbackRequest {
    pub status: String,
    pub detail: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub timestamp: Option<DateTime<Utc>>,
    pub progress: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
pub struct ArtifactsRequest {
    pub artifacts: Vec<crate::executions::ArtifactPayload>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterNodeRequest {
    pub hostname: String,
    pub runtime_type: String,
    pub endpoint: String,
    pub total_cpu_millis: i64,
    pub total_memory_mb: i64,
    pub max_containers: Option<i32>,
    #[serde(default)]
    pub cached_images: Vec<String>,
    #[serde(default)]
    pub labels: JsonValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_clamping() {
        let p = PageParams::default();
        assert_eq!(p.clamped(), (50, 0));

        let p = PageParams { limit: Some(1000), offset: Some(-5), ..Default::default() };
        assert_eq!(p.clamped(), (200, 0));

        let p = PageParams { limit: Some(0), offset: Some(20), ..Default::default() };
        assert_eq!(p.clamped(), (1, 20));
    }

    #[test]
    fn test_session_response_mapping() {
        let record = SessionRecord {
            id: "sess_abcdefgh12345678".into(),
            template_id: "tmpl_py".into(),
            status: "running".into(),
            mode: "ephemeral".into(),
            cpu: "1".into(),
            memory: "512Mi".into(),
            disk: "1Gi".into(),
            env: serde_json::json!({}),
            container_id: Some("ctr-1".into()),
            node_id: None,
            workspace_object_path: "s3://b/sessions/sess_abcdefgh12345678/".into(),
            executor_endpoint: Some("http://10.0.0.5:8000".into()),
            agent_affinity_id: None,
            dependency_status: "completed".into(),
            requested_packages: serde_json::json!([]),
            installed_packages: serde_json::json!([]),
            install_error: None,
            error_detail: None,
            timeout_sec: 300,
            version: 2,
            started_at: Some(Utc::now()),
            terminated_at: None,
            last_activity_at: Utc::now(),
            expires_at: Utc::now(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let dto: SessionResponse = record.into();
        assert_eq!(dto.session_id, "sess_abcdefgh12345678");
        assert_eq!(dto.status, "running");
        assert_eq!(dto.resources["memory"], "512Mi");
        assert_eq!(dto.dependency_install.status, "completed");

        // The executor endpoint is internal topology; it must not leak.
        let json = serde_json::to_value(&dto).unwrap();
        assert!(json.get("executor_endpoint").is_none());
        assert!(json.get("version").is_none());
    }

    #[test]
    fn test_result_response_carries_artifacts() {
        let execution = ExecutionRecord {
            id: "exec_20250101_abcd1234".into(),
            session_id: "sess_abcdefgh12345678".into(),
            status: "completed".into(),
            code: "def handler(event): return 1".into(),
            language: "python".into(),
            event: serde_json::json!({}),
            timeout_sec: 60,
            return_value: Some(serde_json::json!({"n": 42})),
            stdout: Some("".into()),
            stderr: Some("".into()),
            exit_code: Some(0),
            duration_ms: Some(12),
            cpu_time_ms: Some(8),
            peak_memory_mb: Some(64),
            retry_count: 0,
            parent_execution_id: None,
            idempotency_key: Some("exec_20250101_abcd1234_result".into()),
            error_detail: None,
            last_heartbeat_at: None,
            started_at: Some(Utc::now()),
            completed_at: Some(Utc::now()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let artifacts = vec![ArtifactRecord {
            id: "art_abc123def456".into(),
            execution_id: execution.id.clone(),
            artifact_type: "file".into(),
            path: "out.bin".into(),
            object_path: "s3://b/sessions/sess_abcdefgh12345678/out.bin".into(),
            size_bytes: 1024,
            mime_type: None,
            checksum: None,
            created_at: Utc::now(),
        }];

        let dto = ExecutionResultResponse::from_record(execution, artifacts);
        assert_eq!(dto.return_value, Some(serde_json::json!({"n": 42})));
        assert_eq!(dto.metrics.duration_ms, Some(12));
        assert_eq!(dto.artifacts.len(), 1);
        assert_eq!(dto.artifacts[0].path, "out.bin");

        // The code body stays out of result payloads.
        let json = serde_json::to_value(&dto).unwrap();
        assert!(json.get("code").is_none());
        assert!(json.get("idempotency_key").is_none());
    }

    #[test]
    fn test_create_session_request_defaults() {
        let req: CreateSessionRequest = serde_json::from_value(serde_json::json!({
            "template_id": "tmpl_abc",
            "timeout": 300,
            "resources": {"cpu": "1", "memory": "512Mi", "disk": "1Gi"}
        }))
        .unwrap();
        assert_eq!(req.template_id, "tmpl_abc");
        assert!(req.env.is_empty());
        assert!(req.dependencies.is_empty());
        assert_eq!(req.resources.unwrap().cpu.as_deref(), Some("1"));
    }
}
