// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Container Scheduler abstraction.
//!
//! The session manager sees only [`ContainerScheduler`]; the Docker and
//! Kubernetes adapters implement it. The backend is chosen once at process
//! start from configuration and passed in explicitly; there is no global.

pub mod docker;
pub mod entrypoint;
pub mod kubernetes;

pub use docker::DockerScheduler;
pub use kubernetes::KubernetesScheduler;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::db::containers::ContainerStatus;

/// Label keys stamped on every container/pod this control plane creates.
pub const LABEL_MANAGED: &str = "noxrun.managed";
pub const LABEL_SESSION: &str = "noxrun.session-id";
pub const LABEL_DEPENDENCIES: &str = "noxrun.dependencies";

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container runtime unreachable: {0}")]
    Unreachable(String),

    #[error("container creation failed: {0}")]
    CreateFailed(String),

    #[error("image pull failed: {0}")]
    ImagePullFailed(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("runtime API error: {0}")]
    Api(String),
}

impl From<RuntimeError> for crate::error::ApiError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::NotFound(id) => crate::error::ApiError::not_found("container", &id),
            RuntimeError::Unreachable(detail) => {
                crate::error::ApiError::backend_unavailable("container runtime", detail)
            }
            other => crate::error::ApiError::internal(other.to_string()),
        }
    }
}

/// Everything an adapter needs to materialize a session container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub session_id: String,
    pub image: String,
    pub cpu_millis: i64,
    pub memory_mb: i64,
    pub disk_gb: i64,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    /// `s3://bucket/prefix/sessions/{id}/`
    pub workspace_url: String,
    pub network_mode: String,
    /// Sandbox user the executor runs as, always `1000:1000`.
    pub user: String,
    pub mount_workspace: bool,
    pub dependencies: Vec<String>,
    pub executor_port: u16,
}

impl ContainerConfig {
    /// Labels common to both adapters, including the dependency manifest.
    pub fn runtime_labels(&self) -> HashMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_SESSION.to_string(), self.session_id.clone());
        if !self.dependencies.is_empty() {
            labels.insert(
                LABEL_DEPENDENCIES.to_string(),
                serde_json::to_string(&self.dependencies).unwrap_or_default(),
            );
        }
        labels
    }
}

/// Point-in-time view of a container, normalized across backends.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub status: ContainerStatus,
    pub ip: Option<String>,
    pub exit_code: Option<i64>,
}

#[async_trait]
pub trait ContainerScheduler: Send + Sync {
    /// Create and start a container; returns the runtime-native id.
    async fn create_container(&self, config: &ContainerConfig) -> Result<String, RuntimeError>;

    /// Stop and remove. Must be idempotent: a missing container is success.
    async fn destroy_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn container_status(&self, container_id: &str) -> Result<ContainerInfo, RuntimeError>;

    async fn container_logs(
        &self,
        container_id: &str,
        tail: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<String, RuntimeError>;

    async fn is_container_running(&self, container_id: &str) -> Result<bool, RuntimeError>;

    /// All containers carrying this control plane's labels, as
    /// (container_id, session_id) pairs. Used by the orphan sweep.
    async fn list_managed(&self) -> Result<Vec<(String, String)>, RuntimeError>;

    /// Backend liveness for the health rollup.
    async fn ping(&self) -> bool;

    fn runtime_type(&self) -> &'static str;
}

/// Parse a CPU quantity ("1", "0.5", "500m") into millicores.
pub fn parse_cpu_millis(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Some(m) = s.strip_suffix('m') {
        return m.parse::<i64>().ok().filter(|v| *v > 0);
    }
    let cores: f64 = s.parse().ok()?;
    if cores <= 0.0 || !cores.is_finite() {
        return None;
    }
    Some((cores * 1000.0).round() as i64)
}

/// Parse a memory quantity ("512Mi", "1Gi", "256M", "1073741824") into MiB.
pub fn parse_memory_mb(s: &str) -> Option<i64> {
    let s = s.trim();
    let (num, multiplier_to_bytes): (&str, i64) = if let Some(n) = s.strip_suffix("Ki") {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix("Mi") {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("Gi") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1000)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1000 * 1000)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1000 * 1000 * 1000)
    } else {
        (s, 1)
    };
    let value: f64 = num.parse().ok()?;
    if value <= 0.0 || !value.is_finite() {
        return None;
    }
    let bytes = value * multiplier_to_bytes as f64;
    Some((bytes / (1024.0 * 1024.0)).round().max(1.0) as i64)
}

/// Parse a disk quantity into whole GiB (same grammar as memory).
pub fn parse_disk_gb(s: &str) -> Option<i64> {
    parse_memory_mb(s).map(|mb| (mb as f64 / 1024.0).ceil().max(1.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu() {
        assert_eq!(parse_cpu_millis("1"), Some(1000));
        assert_eq!(parse_cpu_millis("0.5"), Some(500));
        assert_eq!(parse_cpu_millis("500m"), Some(500));
        assert_eq!(parse_cpu_millis("2"), Some(2000));
        assert_eq!(parse_cpu_millis("0"), None);
        assert_eq!(parse_cpu_millis("-1"), None);
        assert_eq!(parse_cpu_millis("lots"), None);
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory_mb("512Mi"), Some(512));
        assert_eq!(parse_memory_mb("1Gi"), Some(1024));
        assert_eq!(parse_memory_mb("1024Ki"), Some(1));
        assert_eq!(parse_memory_mb("256M"), Some(244));
        assert_eq!(parse_memory_mb("1073741824"), Some(1024));
        assert_eq!(parse_memory_mb("0"), None);
        assert_eq!(parse_memory_mb("much"), None);
    }

    #[test]
    fn test_parse_disk() {
        assert_eq!(parse_disk_gb("1Gi"), Some(1));
        assert_eq!(parse_disk_gb("10Gi"), Some(10));
        assert_eq!(parse_disk_gb("512Mi"), Some(1));
    }

    #[test]
    fn test_runtime_labels_include_session_and_dependencies() {
        let config = ContainerConfig {
            session_id: "sess_abcdefgh12345678".into(),
            image: "python:3.12-slim".into(),
            cpu_millis: 1000,
            memory_mb: 512,
            disk_gb: 1,
            env: HashMap::new(),
            labels: HashMap::new(),
            workspace_url: "s3://bucket/sessions/sess_abcdefgh12345678/".into(),
            network_mode: "bridge".into(),
            user: "1000:1000".into(),
            mount_workspace: true,
            dependencies: vec!["pandas".into()],
            executor_port: 8000,
        };
        let labels = config.runtime_labels();
        assert_eq!(labels.get(LABEL_MANAGED).map(String::as_str), Some("true"));
        assert_eq!(
            labels.get(LABEL_SESSION).map(String::as_str),
            Some("sess_abcdefgh12345678")
        );
        assert!(labels.get(LABEL_DEPENDENCIES).unwrap().contains("pandas"));
    }
}
