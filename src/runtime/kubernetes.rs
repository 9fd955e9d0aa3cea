// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Kubernetes adapter for the container scheduler.
//!
//! Sessions become single-container pods whose security context mirrors the
//! Docker hardening: non-root 1000:1000, no privilege escalation, all
//! capabilities dropped, RuntimeDefault seccomp, no host namespaces, and
//! cluster DNS withheld. The workspace mount reuses the same root entrypoint
//! script as the Docker adapter rather than a sidecar, so pods stay
//! single-container.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar, HostPathVolumeSource, Pod, PodDNSConfig,
    PodSpec, ResourceRequirements, SeccompProfile, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, LogParams, ObjectMeta, PostParams};
use kube::config::KubeConfigOptions;
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::{entrypoint, ContainerConfig, ContainerInfo, ContainerScheduler, RuntimeError};
use crate::db::containers::ContainerStatus;

pub struct KubernetesScheduler {
    client: Client,
    namespace: String,
    pip_index_url: String,
}

impl KubernetesScheduler {
    /// Configuration is tried in order: in-cluster ServiceAccount, then the
    /// local kubeconfig, then the client's own inference.
    pub async fn connect(namespace: &str, pip_index_url: &str) -> Result<Self, RuntimeError> {
        let config = match kube::Config::incluster() {
            Ok(c) => {
                info!("Kubernetes config loaded from in-cluster ServiceAccount");
                c
            }
            Err(_) => match kube::Config::from_kubeconfig(&KubeConfigOptions::default()).await {
                Ok(c) => {
                    info!("Kubernetes config loaded from kubeconfig");
                    c
                }
                Err(_) => kube::Config::infer()
                    .await
                    .map_err(|e| RuntimeError::Unreachable(e.to_string()))?,
            },
        };

        let client = Client::try_from(config)
            .map_err(|e| RuntimeError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            namespace: namespace.to_string(),
            pip_index_url: pip_index_url.to_string(),
        })
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Pod names are DNS labels; session ids only need the underscore swap.
    pub fn pod_name(session_id: &str) -> String {
        format!("noxrun-{}", session_id.replace('_', "-"))
    }

    /// Build the pod spec for a session container.
    pub fn build_pod(&self, config: &ContainerConfig) -> Result<Pod, RuntimeError> {
        build_pod_spec(&self.namespace, &self.pip_index_url, config)
    }

    fn is_not_found(err: &kube::Error) -> bool {
        matches!(err, kube::Error::Api(ae) if ae.code == 404)
    }

    async fn get_pod(&self, pod_name: &str) -> Result<Option<Pod>, RuntimeError> {
        match self.pods().get(pod_name).await {
            Ok(pod) => Ok(Some(pod)),
            Err(e) if Self::is_not_found(&e) => Ok(None),
            Err(e) => Err(RuntimeError::Api(e.to_string())),
        }
    }
}

/// Pod construction, separated from the client so specs are testable.
fn build_pod_spec(
    namespace: &str,
    pip_index_url: &str,
    config: &ContainerConfig,
) -> Result<Pod, RuntimeError> {
    let pod_name = KubernetesScheduler::pod_name(&config.session_id);
    let (uid, gid) = config
        .user
        .split_once(':')
        .and_then(|(u, g)| Some((u.parse::<i64>().ok()?, g.parse::<i64>().ok()?)))
        .unwrap_or((1000, 1000));

    let mut limits: BTreeMap<String, Quantity> = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity(format!("{}m", config.cpu_millis)));
    limits.insert("memory".to_string(), Quantity(format!("{}Mi", config.memory_mb)));
    limits.insert(
        "ephemeral-storage".to_string(),
        Quantity(format!("{}Gi", config.disk_gb)),
    );

    let env: Vec<EnvVar> = config
        .env
        .iter()
        .map(|(k, v)| EnvVar {
            name: k.clone(),
            value: Some(v.clone()),
            ..Default::default()
        })
        .collect();

    let mut volumes = Vec::new();
    let mut volume_mounts = Vec::new();

    let (command, security_context) = if config.mount_workspace {
        let script = entrypoint::build_script(config, pip_index_url).ok_or_else(|| {
            RuntimeError::CreateFailed(format!(
                "invalid workspace url: {}",
                config.workspace_url
            ))
        })?;

        // The entrypoint needs /dev/fuse and SYS_ADMIN until it drops
        // to the sandbox user; everything else stays locked down.
        volumes.push(Volume {
            name: "dev-fuse".to_string(),
            host_path: Some(HostPathVolumeSource {
                path: "/dev/fuse".to_string(),
                type_: Some("CharDevice".to_string()),
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: "dev-fuse".to_string(),
            mount_path: "/dev/fuse".to_string(),
            ..Default::default()
        });

        (
            vec!["/bin/sh".to_string(), "-c".to_string(), script],
            SecurityContext {
                run_as_user: Some(0),
                run_as_group: Some(0),
                allow_privilege_escalation: Some(false),
                privileged: Some(false),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    add: Some(vec!["SYS_ADMIN".to_string()]),
                }),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    } else {
        (
            vec![
                entrypoint::EXECUTOR_BIN.to_string(),
                "--port".to_string(),
                config.executor_port.to_string(),
            ],
            SecurityContext {
                run_as_user: Some(uid),
                run_as_group: Some(gid),
                run_as_non_root: Some(true),
                allow_privilege_escalation: Some(false),
                privileged: Some(false),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    add: None,
                }),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    };

    // Kubernetes label values cannot hold JSON; the dependency manifest
    // rides in an annotation instead.
    let mut labels = BTreeMap::new();
    labels.insert(super::LABEL_MANAGED.to_string(), "true".to_string());
    labels.insert(super::LABEL_SESSION.to_string(), config.session_id.clone());
    let mut annotations = BTreeMap::new();
    if !config.dependencies.is_empty() {
        annotations.insert(
            super::LABEL_DEPENDENCIES.to_string(),
            serde_json::to_string(&config.dependencies).unwrap_or_default(),
        );
    }

    let container = Container {
        name: "sandbox".to_string(),
        image: Some(config.image.clone()),
        command: Some(command),
        env: Some(env),
        ports: Some(vec![ContainerPort {
            container_port: config.executor_port as i32,
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(limits.clone()),
            limits: Some(limits),
            ..Default::default()
        }),
        security_context: Some(security_context),
        volume_mounts: if volume_mounts.is_empty() { None } else { Some(volume_mounts) },
        working_dir: Some("/workspace".to_string()),
        ..Default::default()
    };

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(pod_name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: if annotations.is_empty() { None } else { Some(annotations) },
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("Never".to_string()),
            host_network: Some(false),
            host_pid: Some(false),
            host_ipc: Some(false),
            automount_service_account_token: Some(false),
            // Cluster DNS is withheld; the loopback resolver blackholes
            // service discovery from inside the sandbox.
            dns_policy: Some("None".to_string()),
            dns_config: Some(PodDNSConfig {
                nameservers: Some(vec!["127.0.0.1".to_string()]),
                ..Default::default()
            }),
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[async_trait]
impl ContainerScheduler for KubernetesScheduler {
    async fn create_container(&self, config: &ContainerConfig) -> Result<String, RuntimeError> {
        let pod = self.build_pod(config)?;
        let pod_name = Self::pod_name(&config.session_id);

        debug!(
            "Creating pod {} in namespace {} for session {}",
            pod_name, self.namespace, config.session_id
        );

        self.pods()
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|e| RuntimeError::CreateFailed(format!("pod creation failed: {}", e)))?;

        info!("Pod {} created for session {}", pod_name, config.session_id);
        Ok(pod_name)
    }

    async fn destroy_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        match self.pods().delete(container_id, &DeleteParams::default()).await {
            Ok(_) => {
                debug!("Pod {} deleted", container_id);
                Ok(())
            }
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(RuntimeError::Api(e.to_string())),
        }
    }

    async fn container_status(&self, container_id: &str) -> Result<ContainerInfo, RuntimeError> {
        let pod = self
            .get_pod(container_id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;

        let status = pod.status.as_ref();
        let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or("Unknown");
        let mapped = match phase {
            "Pending" => ContainerStatus::Created,
            "Running" => ContainerStatus::Running,
            _ => ContainerStatus::Exited,
        };

        let exit_code = status
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|cs| cs.first())
            .and_then(|c| c.state.as_ref())
            .and_then(|s| s.terminated.as_ref())
            .map(|t| t.exit_code as i64);

        Ok(ContainerInfo {
            id: container_id.to_string(),
            status: mapped,
            ip: status.and_then(|s| s.pod_ip.clone()),
            exit_code,
        })
    }

    async fn container_logs(
        &self,
        container_id: &str,
        tail: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<String, RuntimeError> {
        let params = LogParams {
            tail_lines: Some(tail),
            since_seconds: since.map(|t| (Utc::now() - t).num_seconds().max(1)),
            ..Default::default()
        };

        match self.pods().logs(container_id, &params).await {
            Ok(logs) => Ok(logs),
            Err(e) if Self::is_not_found(&e) => {
                Err(RuntimeError::NotFound(container_id.to_string()))
            }
            Err(e) => Err(RuntimeError::Api(e.to_string())),
        }
    }

    async fn is_container_running(&self, container_id: &str) -> Result<bool, RuntimeError> {
        let Some(pod) = self.get_pod(container_id).await? else {
            return Ok(false);
        };
        Ok(pod
            .status
            .and_then(|s| s.phase)
            .map(|p| p == "Running")
            .unwrap_or(false))
    }

    async fn list_managed(&self) -> Result<Vec<(String, String)>, RuntimeError> {
        let params = ListParams::default().labels(&format!("{}=true", super::LABEL_MANAGED));
        let pod_list = self
            .pods()
            .list(&params)
            .await
            .map_err(|e| RuntimeError::Api(e.to_string()))?;

        Ok(pod_list
            .into_iter()
            .filter_map(|pod| {
                let name = pod.metadata.name.clone()?;
                let session = pod
                    .metadata
                    .labels
                    .as_ref()?
                    .get(super::LABEL_SESSION)?
                    .clone();
                Some((name, session))
            })
            .collect())
    }

    async fn ping(&self) -> bool {
        match self.client.apiserver_version().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Kubernetes API probe failed: {}", e);
                false
            }
        }
    }

    fn runtime_type(&self) -> &'static str {
        "kubernetes"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_config(mount: bool) -> ContainerConfig {
        ContainerConfig {
            session_id: "sess_abcdefgh12345678".into(),
            image: "python:3.12-slim".into(),
            cpu_millis: 1500,
            memory_mb: 512,
            disk_gb: 2,
            env: HashMap::from([("LANG".to_string(), "C.UTF-8".to_string())]),
            labels: HashMap::new(),
            workspace_url: "s3://workspaces/sessions/sess_abcdefgh12345678/".into(),
            network_mode: "bridge".into(),
            user: "1000:1000".into(),
            mount_workspace: mount,
            dependencies: if mount { vec!["pandas".into()] } else { vec![] },
            executor_port: 8000,
        }
    }

    #[test]
    fn test_pod_name_is_dns_safe() {
        let name = KubernetesScheduler::pod_name("sess_abcdefgh12345678");
        assert_eq!(name, "noxrun-sess-abcdefgh12345678");
        assert!(!name.contains('_'));
    }

    #[test]
    fn test_not_found_detection() {
        let err = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "not found".into(),
            reason: "NotFound".into(),
            code: 404,
        });
        assert!(KubernetesScheduler::is_not_found(&err));

        let err = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "forbidden".into(),
            reason: "Forbidden".into(),
            code: 403,
        });
        assert!(!KubernetesScheduler::is_not_found(&err));
    }

    #[test]
    fn test_pod_spec_hardening_without_mount() {
        let pod = build_pod_spec("noxrun", "https://pypi.org/simple", &test_config(false)).unwrap();
        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.host_network, Some(false));
        assert_eq!(spec.host_pid, Some(false));
        assert_eq!(spec.host_ipc, Some(false));
        assert_eq!(spec.dns_policy.as_deref(), Some("None"));
        assert_eq!(spec.automount_service_account_token, Some(false));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));

        let sc = spec.containers[0].security_context.as_ref().unwrap();
        assert_eq!(sc.run_as_user, Some(1000));
        assert_eq!(sc.run_as_group, Some(1000));
        assert_eq!(sc.run_as_non_root, Some(true));
        assert_eq!(sc.allow_privilege_escalation, Some(false));
        let caps = sc.capabilities.as_ref().unwrap();
        assert_eq!(caps.drop.as_ref().unwrap(), &vec!["ALL".to_string()]);
        assert!(caps.add.is_none());
        assert_eq!(
            sc.seccomp_profile.as_ref().unwrap().type_,
            "RuntimeDefault"
        );
    }

    #[test]
    fn test_pod_spec_mount_grants_fuse_for_startup_only() {
        let pod = build_pod_spec("noxrun", "https://pypi.org/simple", &test_config(true)).unwrap();
        let spec = pod.spec.as_ref().unwrap();

        // The entrypoint script needs root + SYS_ADMIN; the drop happens in
        // the script before the executor starts.
        let sc = spec.containers[0].security_context.as_ref().unwrap();
        assert_eq!(sc.run_as_user, Some(0));
        assert_eq!(
            sc.capabilities.as_ref().unwrap().add.as_ref().unwrap(),
            &vec!["SYS_ADMIN".to_string()]
        );

        let volumes = spec.volumes.as_ref().unwrap();
        assert!(volumes.iter().any(|v| v.name == "dev-fuse"));
        let command = spec.containers[0].command.as_ref().unwrap();
        assert!(command[2].contains("setpriv --reuid=1000"));
    }

    #[test]
    fn test_pod_spec_resources_map_one_to_one() {
        let pod = build_pod_spec("noxrun", "https://pypi.org/simple", &test_config(false)).unwrap();
        let resources = pod.spec.as_ref().unwrap().containers[0]
            .resources
            .as_ref()
            .unwrap();
        let limits = resources.limits.as_ref().unwrap();
        assert_eq!(limits["cpu"].0, "1500m");
        assert_eq!(limits["memory"].0, "512Mi");
        assert_eq!(limits["ephemeral-storage"].0, "2Gi");
        assert_eq!(resources.requests, resources.limits);
    }

    #[test]
    fn test_pod_spec_dependency_manifest_in_annotation() {
        let pod = build_pod_spec("noxrun", "https://pypi.org/simple", &test_config(true)).unwrap();
        let annotations = pod.metadata.annotations.as_ref().unwrap();
        assert!(annotations[super::super::LABEL_DEPENDENCIES].contains("pandas"));
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[super::super::LABEL_SESSION], "sess_abcdefgh12345678");
    }
}
