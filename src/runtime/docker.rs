// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Docker adapter for the container scheduler, speaking to the daemon API
//! through bollard.
//!
//! Hardening baseline for every sandbox container: all capabilities dropped,
//! no-new-privileges, the runtime's default seccomp profile, tmpfs /tmp,
//! a pids ceiling, and memory-swap pinned to the memory limit so there is no
//! swap headroom. Workspace-mounted containers additionally get SYS_ADMIN
//! and /dev/fuse for the entrypoint's mount phase only.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, DeviceMapping, HostConfig};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{entrypoint, ContainerConfig, ContainerInfo, ContainerScheduler, RuntimeError};
use crate::db::containers::ContainerStatus;

pub struct DockerScheduler {
    docker: Docker,
    pids_limit: i64,
    stop_timeout_secs: i64,
    pip_index_url: String,
}

impl DockerScheduler {
    pub async fn connect(
        socket_path: Option<&str>,
        pids_limit: i64,
        stop_timeout_secs: u64,
        pip_index_url: &str,
    ) -> Result<Self, RuntimeError> {
        let docker = match socket_path {
            Some(path) if !path.starts_with("tcp://") && !path.starts_with("http") => {
                Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
                    .map_err(|e| RuntimeError::Unreachable(e.to_string()))?
            }
            _ => Docker::connect_with_local_defaults()
                .map_err(|e| RuntimeError::Unreachable(e.to_string()))?,
        };

        let version = docker
            .version()
            .await
            .map_err(|e| RuntimeError::Unreachable(format!("Docker daemon not responding: {}", e)))?;
        info!(
            "Docker connected (version: {})",
            version.version.unwrap_or_else(|| "unknown".to_string())
        );

        Ok(Self {
            docker,
            pids_limit,
            stop_timeout_secs: stop_timeout_secs as i64,
            pip_index_url: pip_index_url.to_string(),
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!("Image {} not present locally, pulling...", image);
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(update) => {
                    if let Some(status) = update.status {
                        debug!("Pull progress for {}: {}", image, status);
                    }
                }
                Err(e) => {
                    return Err(RuntimeError::ImagePullFailed(format!("{}: {}", image, e)));
                }
            }
        }
        info!("Pulled image {}", image);
        Ok(())
    }

    fn host_config(&self, config: &ContainerConfig) -> HostConfig {
        build_host_config(self.pids_limit, config)
    }
}

/// Hardened HostConfig for a sandbox container, separated from the client
/// so the baseline stays testable.
fn build_host_config(pids_limit: i64, config: &ContainerConfig) -> HostConfig {
    let memory_bytes = config.memory_mb * 1024 * 1024;

    let mut cap_add = None;
    let mut devices = None;
    if config.mount_workspace {
        // The entrypoint's FUSE mount; dropped again before user code runs.
        cap_add = Some(vec!["SYS_ADMIN".to_string()]);
        devices = Some(vec![DeviceMapping {
            path_on_host: Some("/dev/fuse".to_string()),
            path_in_container: Some("/dev/fuse".to_string()),
            cgroup_permissions: Some("rwm".to_string()),
        }]);
    }

    let mut tmpfs = HashMap::new();
    tmpfs.insert("/tmp".to_string(), "rw,noexec,nosuid,size=268435456".to_string());

    HostConfig {
        memory: Some(memory_bytes),
        memory_swap: Some(memory_bytes),
        cpu_period: Some(100_000),
        cpu_quota: Some(config.cpu_millis * 100),
        pids_limit: Some(pids_limit),
        cap_drop: Some(vec!["ALL".to_string()]),
        cap_add,
        devices,
        security_opt: Some(vec!["no-new-privileges:true".to_string()]),
        tmpfs: Some(tmpfs),
        network_mode: Some(config.network_mode.clone()),
        readonly_rootfs: Some(false),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerScheduler for DockerScheduler {
    async fn create_container(&self, config: &ContainerConfig) -> Result<String, RuntimeError> {
        self.ensure_image(&config.image).await?;

        let env: Vec<String> = config.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        // Workspace-mounted containers boot as root through the entrypoint
        // script and drop to the sandbox user themselves; plain containers
        // start straight in the executor as the sandbox user.
        let (user, entrypoint_cmd) = if config.mount_workspace {
            let script = entrypoint::build_script(config, &self.pip_index_url).ok_or_else(|| {
                RuntimeError::CreateFailed(format!(
                    "invalid workspace url: {}",
                    config.workspace_url
                ))
            })?;
            ("0:0".to_string(), vec!["/bin/sh".to_string(), "-c".to_string(), script])
        } else {
            (
                config.user.clone(),
                vec![
                    entrypoint::EXECUTOR_BIN.to_string(),
                    "--port".to_string(),
                    config.executor_port.to_string(),
                ],
            )
        };

        let container_name = format!("noxrun-{}", config.session_id);
        let create_config = Config {
            image: Some(config.image.clone()),
            entrypoint: Some(entrypoint_cmd),
            env: Some(env),
            user: Some(user),
            working_dir: Some("/workspace".to_string()),
            labels: Some(config.runtime_labels()),
            host_config: Some(self.host_config(config)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        debug!("Creating container {} for session {}", container_name, config.session_id);
        let response = self
            .docker
            .create_container(Some(options), create_config)
            .await
            .map_err(|e| RuntimeError::CreateFailed(e.to_string()))?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::CreateFailed(format!("start failed: {}", e)))?;

        info!("Container {} started for session {}", response.id, config.session_id);
        Ok(response.id)
    }

    async fn destroy_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        let stop_result = self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: self.stop_timeout_secs }))
            .await;

        match stop_result {
            Ok(_) => debug!("Container {} stopped", container_id),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                debug!("Container {} already gone", container_id);
                return Ok(());
            }
            Err(e) => {
                warn!("Graceful stop failed for {}, forcing: {}", container_id, e);
                let _ = self.docker.kill_container::<String>(container_id, None).await;
            }
        }

        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions { force: true, ..Default::default() }),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Ok(())
            }
            Err(e) => Err(RuntimeError::Api(e.to_string())),
        }
    }

    async fn container_status(&self, container_id: &str) -> Result<ContainerInfo, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                    RuntimeError::NotFound(container_id.to_string())
                }
                other => RuntimeError::Api(other.to_string()),
            })?;

        let state = inspect.state.as_ref();
        let status = match state.and_then(|s| s.status) {
            Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
            Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
            Some(ContainerStateStatusEnum::PAUSED) => ContainerStatus::Paused,
            Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Running,
            Some(ContainerStateStatusEnum::REMOVING) => ContainerStatus::Deleting,
            _ => ContainerStatus::Exited,
        };

        Ok(ContainerInfo {
            id: container_id.to_string(),
            status,
            ip: inspect
                .network_settings
                .and_then(|n| n.ip_address)
                .filter(|ip| !ip.is_empty()),
            exit_code: state.and_then(|s| s.exit_code),
        })
    }

    async fn container_logs(
        &self,
        container_id: &str,
        tail: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<String, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            since: since.map(|t| t.timestamp()).unwrap_or(0),
            ..Default::default()
        };

        let mut stream = self.docker.logs(container_id, Some(options));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    out.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Err(RuntimeError::NotFound(container_id.to_string())),
                Err(e) => return Err(RuntimeError::Api(e.to_string())),
            }
        }
        Ok(out)
    }

    async fn is_container_running(&self, container_id: &str) -> Result<bool, RuntimeError> {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(inspect
                .state
                .and_then(|s| s.running)
                .unwrap_or(false)),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Ok(false)
            }
            Err(e) => Err(RuntimeError::Api(e.to_string())),
        }
    }

    async fn list_managed(&self) -> Result<Vec<(String, String)>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label", vec![format!("{}=true", super::LABEL_MANAGED)]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: filters
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                ..Default::default()
            }))
            .await
            .map_err(|e| RuntimeError::Api(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let session = c.labels.as_ref()?.get(super::LABEL_SESSION)?.clone();
                Some((id, session))
            })
            .collect())
    }

    async fn ping(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    fn runtime_type(&self) -> &'static str {
        "docker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(mount: bool) -> ContainerConfig {
        ContainerConfig {
            session_id: "sess_abcdefgh12345678".into(),
            image: "python:3.12-slim".into(),
            cpu_millis: 1000,
            memory_mb: 512,
            disk_gb: 1,
            env: HashMap::new(),
            labels: HashMap::new(),
            workspace_url: "s3://workspaces/sessions/sess_abcdefgh12345678/".into(),
            network_mode: "bridge".into(),
            user: "1000:1000".into(),
            mount_workspace: mount,
            dependencies: vec![],
            executor_port: 8000,
        }
    }

    #[test]
    fn test_hardening_baseline() {
        let hc = build_host_config(256, &test_config(false));
        assert_eq!(hc.cap_drop, Some(vec!["ALL".to_string()]));
        assert!(hc.cap_add.is_none());
        assert!(hc.devices.is_none());
        assert_eq!(hc.security_opt, Some(vec!["no-new-privileges:true".to_string()]));
        assert_eq!(hc.pids_limit, Some(256));
        assert_eq!(hc.readonly_rootfs, Some(false));
        let tmpfs = hc.tmpfs.unwrap();
        assert!(tmpfs["/tmp"].contains("noexec"));
    }

    #[test]
    fn test_memory_swap_equals_memory() {
        let hc = build_host_config(256, &test_config(false));
        assert_eq!(hc.memory, Some(512 * 1024 * 1024));
        assert_eq!(hc.memory, hc.memory_swap);
    }

    #[test]
    fn test_cpu_quota_scales_with_millis() {
        let mut config = test_config(false);
        config.cpu_millis = 1500;
        let hc = build_host_config(256, &config);
        assert_eq!(hc.cpu_period, Some(100_000));
        assert_eq!(hc.cpu_quota, Some(150_000));
    }

    #[test]
    fn test_mount_grants_fuse_for_startup_only() {
        let hc = build_host_config(256, &test_config(true));
        assert_eq!(hc.cap_add, Some(vec!["SYS_ADMIN".to_string()]));
        let devices = hc.devices.unwrap();
        assert_eq!(devices[0].path_in_container.as_deref(), Some("/dev/fuse"));
        // The drop list still leads with ALL; only the mount cap returns.
        assert_eq!(hc.cap_drop, Some(vec!["ALL".to_string()]));
    }
}
