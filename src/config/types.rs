// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Configuration type definitions
//! All configuration structs and enums used throughout the control plane.

use std::net::SocketAddr;
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    pub scheduler: SchedulerConfig,
    pub lifecycle: LifecycleConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub security: SecurityConfig,
    pub observability: ObservabilityConfig,
}

/// Server binding configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub listen_addr: SocketAddr,
    pub environment: Environment,
    pub graceful_shutdown_timeout_secs: u64,
    /// Public base URL handed to containers so the executor can call back.
    pub callback_base_url: String,
}

/// Environment type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Staging,
    Development,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "staging" | "stage" => Ok(Environment::Staging),
            "development" | "dev" | "" => Ok(Environment::Development),
            _ => Err(format!("Unknown environment: {}", s)),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Production => write!(f, "production"),
            Environment::Staging => write!(f, "staging"),
            Environment::Development => write!(f, "development"),
        }
    }
}

/// Which container backend materializes sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Docker,
    Kubernetes,
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" | "" => Ok(RuntimeKind::Docker),
            "kubernetes" | "k8s" => Ok(RuntimeKind::Kubernetes),
            _ => Err(format!("Unknown runtime kind: {}", s)),
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeKind::Docker => write!(f, "docker"),
            RuntimeKind::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// Container runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub kind: RuntimeKind,
    pub docker_socket: Option<String>,
    pub kubernetes_namespace: String,
    pub executor_port: u16,
    pub pids_limit: i64,
    pub stop_timeout_secs: u64,
    /// Fixed pip index the entrypoint installs from.
    pub pip_index_url: String,
    /// Requested dependencies may shadow template preinstalls when set.
    pub allow_version_conflicts: bool,
}

/// Scheduler / warm pool configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub warm_pool_enabled: bool,
    /// Fallback warm-pool target for templates without an explicit entry.
    pub warm_pool_default_target: usize,
    /// Comma list of template=target overrides, e.g. "python-datasci=20,python-basic=10".
    pub warm_pool_targets: Vec<(String, usize)>,
    pub replenish_interval_secs: u64,
    pub warm_weight: i64,
    pub affinity_weight: i64,
    pub load_weight: i64,
    pub affinity_agent_bonus: i64,
}

/// Background loop cadences and thresholds. A value of -1 disables the
/// idle or lifetime check it belongs to.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub cleanup_interval_secs: u64,
    pub idle_timeout_secs: i64,
    pub max_lifetime_secs: i64,
    pub heartbeat_timeout_secs: u64,
    pub heartbeat_sweep_interval_secs: u64,
    pub creating_deadline_secs: u64,
    pub node_probe_interval_secs: u64,
    pub node_offline_threshold_secs: u64,
    pub reconcile_interval_secs: u64,
    pub retention_days: u64,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Object store configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    /// Root prefix for workspaces; sessions live at {prefix}/sessions/{id}/.
    pub prefix: String,
    pub presign_ttl_secs: u64,
    pub force_path_style: bool,
}

/// Security / auth configuration
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Bearer token for the external /api/v1 surface.
    pub api_token: String,
    /// Shared-secret bearer token for the /internal callback surface.
    pub internal_token: String,
    pub max_upload_bytes: usize,
    pub inline_download_limit_bytes: usize,
    pub trusted_proxies: Vec<String>,
}

/// Observability configuration
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub json_logs: bool,
    pub metrics_enabled: bool,
}
