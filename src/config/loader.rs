// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Configuration loading from environment variables

use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use super::error::ConfigError;
use super::types::*;

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            if e.not_found() {
                info!("No .env file found, using environment variables only");
            } else {
                warn!("Error loading .env file: {}", e);
            }
        }

        let host = env_or("NOXRUN_HOST", "0.0.0.0");
        let port = env_parse("NOXRUN_PORT", 8080u16)?;
        let listen_addr =
            format!("{}:{}", host, port)
                .parse()
                .map_err(|e| ConfigError::InvalidValue {
                    key: "NOXRUN_HOST/PORT".to_string(),
                    value: format!("{}:{}", host, port),
                    reason: format!("Invalid socket address: {}", e),
                })?;

        let environment = env_parse("NOXRUN_ENVIRONMENT", Environment::Development)?;

        Ok(Config {
            server: ServerConfig {
                host: host.clone(),
                port,
                listen_addr,
                environment,
                graceful_shutdown_timeout_secs: env_parse("NOXRUN_SHUTDOWN_TIMEOUT", 30u64)?,
                callback_base_url: env_or(
                    "NOXRUN_CALLBACK_BASE_URL",
                    &format!("http://{}:{}", host, port),
                ),
            },
            runtime: RuntimeConfig {
                kind: env_parse("NOXRUN_RUNTIME", RuntimeKind::Docker)?,
                docker_socket: env::var("DOCKER_HOST")
                    .ok()
                    .or_else(|| env::var("NOXRUN_DOCKER_SOCKET").ok()),
                kubernetes_namespace: env_or("NOXRUN_K8S_NAMESPACE", "noxrun"),
                executor_port: env_parse("NOXRUN_EXECUTOR_PORT", 8000u16)?,
                pids_limit: env_parse("NOXRUN_PIDS_LIMIT", 256i64)?,
                stop_timeout_secs: env_parse("NOXRUN_STOP_TIMEOUT", 10u64)?,
                pip_index_url: env_or("NOXRUN_PIP_INDEX_URL", "https://pypi.org/simple"),
                allow_version_conflicts: env_parse("NOXRUN_ALLOW_VERSION_CONFLICTS", false)?,
            },
            scheduler: SchedulerConfig {
                warm_pool_enabled: env_parse("NOXRUN_WARM_POOL_ENABLED", true)?,
                warm_pool_default_target: env_parse("NOXRUN_WARM_POOL_DEFAULT_TARGET", 5usize)?,
                warm_pool_targets: env_target_list("NOXRUN_WARM_POOL_TARGETS"),
                replenish_interval_secs: env_parse("NOXRUN_WARM_POOL_REPLENISH_INTERVAL", 15u64)?,
                warm_weight: env_parse("NOXRUN_SCHED_WARM_WEIGHT", 100i64)?,
                affinity_weight: env_parse("NOXRUN_SCHED_AFFINITY_WEIGHT", 50i64)?,
                load_weight: env_parse("NOXRUN_SCHED_LOAD_WEIGHT", 30i64)?,
                affinity_agent_bonus: env_parse("NOXRUN_SCHED_AGENT_BONUS", 25i64)?,
            },
            lifecycle: LifecycleConfig {
                cleanup_interval_secs: env_parse("NOXRUN_CLEANUP_INTERVAL", 60u64)?,
                idle_timeout_secs: env_parse("NOXRUN_SESSION_IDLE_TIMEOUT", 1800i64)?,
                max_lifetime_secs: env_parse("NOXRUN_SESSION_MAX_LIFETIME", 21600i64)?,
                heartbeat_timeout_secs: env_parse("NOXRUN_HEARTBEAT_TIMEOUT", 15u64)?,
                heartbeat_sweep_interval_secs: env_parse("NOXRUN_HEARTBEAT_SWEEP_INTERVAL", 5u64)?,
                creating_deadline_secs: env_parse("NOXRUN_CREATING_DEADLINE", 120u64)?,
                node_probe_interval_secs: env_parse("NOXRUN_NODE_PROBE_INTERVAL", 15u64)?,
                node_offline_threshold_secs: env_parse("NOXRUN_NODE_OFFLINE_THRESHOLD", 60u64)?,
                reconcile_interval_secs: env_parse("NOXRUN_RECONCILE_INTERVAL", 120u64)?,
                retention_days: env_parse("NOXRUN_RETENTION_DAYS", 7u64)?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .or_else(|_| env::var("NOXRUN_DATABASE_URL"))
                    .map_err(|_| ConfigError::MissingRequired {
                        key: "DATABASE_URL".to_string(),
                    })?,
                max_connections: env_parse("NOXRUN_DB_MAX_CONNECTIONS", 20u32)?,
                min_connections: env_parse("NOXRUN_DB_MIN_CONNECTIONS", 2u32)?,
                connect_timeout_secs: env_parse("NOXRUN_DB_CONNECT_TIMEOUT", 10u64)?,
                idle_timeout_secs: env_parse("NOXRUN_DB_IDLE_TIMEOUT", 600u64)?,
            },
            storage: StorageConfig {
                endpoint: env::var("NOXRUN_S3_ENDPOINT").ok(),
                region: env_or("NOXRUN_S3_REGION", "us-east-1"),
                bucket: env_or("NOXRUN_S3_BUCKET", "noxrun-workspaces"),
                access_key: env_or("NOXRUN_S3_ACCESS_KEY", ""),
                secret_key: env_or("NOXRUN_S3_SECRET_KEY", ""),
                prefix: env_or("NOXRUN_S3_PREFIX", ""),
                presign_ttl_secs: env_parse("NOXRUN_PRESIGN_TTL", 3600u64)?,
                force_path_style: env_parse("NOXRUN_S3_PATH_STYLE", true)?,
            },
            security: SecurityConfig {
                api_token: env::var("NOXRUN_API_TOKEN").map_err(|_| {
                    ConfigError::MissingRequired { key: "NOXRUN_API_TOKEN".to_string() }
                })?,
                internal_token: env::var("NOXRUN_INTERNAL_TOKEN").map_err(|_| {
                    ConfigError::MissingRequired { key: "NOXRUN_INTERNAL_TOKEN".to_string() }
                })?,
                max_upload_bytes: env_parse("NOXRUN_MAX_UPLOAD_BYTES", 100 * 1024 * 1024usize)?,
                inline_download_limit_bytes: env_parse(
                    "NOXRUN_INLINE_DOWNLOAD_LIMIT",
                    10 * 1024 * 1024usize,
                )?,
                trusted_proxies: env_list(
                    "NOXRUN_TRUSTED_PROXIES",
                    vec!["127.0.0.1".to_string(), "::1".to_string()],
                ),
            },
            observability: ObservabilityConfig {
                log_level: env_or("NOXRUN_LOG_LEVEL", "info"),
                json_logs: env_parse("NOXRUN_JSON_LOGS", false)?,
                metrics_enabled: env_parse("NOXRUN_METRICS_ENABLED", true)?,
            },
        })
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.lifecycle.heartbeat_timeout_secs)
    }

    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.storage.presign_ttl_secs)
    }

    pub fn is_production(&self) -> bool {
        self.server.environment == Environment::Production
    }

    pub fn is_development(&self) -> bool {
        self.server.environment == Environment::Development
    }
}

pub fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value.parse().map_err(|e| ConfigError::ParseError {
            key: key.to_string(),
            message: format!("{}", e),
        }),
        Err(_) => Ok(default),
    }
}

pub fn env_list(key: &str, default: Vec<String>) -> Vec<String> {
    match env::var(key) {
        Ok(value) => value
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default,
    }
}

/// Parse "name=count,name=count" override lists; malformed entries are skipped
/// with a warning rather than failing startup.
fn env_target_list(key: &str) -> Vec<(String, usize)> {
    let Ok(value) = env::var(key) else {
        return Vec::new();
    };
    value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let name = parts.next()?.trim();
            let count = parts.next()?.trim().parse().ok();
            match count {
                Some(c) if !name.is_empty() => Some((name.to_string(), c)),
                _ => {
                    warn!("Ignoring malformed warm-pool target entry: {}", pair);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_default() {
        assert_eq!(env_or("NOXRUN_TEST_UNSET_KEY_XYZ", "fallback"), "fallback");
    }

    #[test]
    fn test_env_parse_default() {
        let v: u16 = env_parse("NOXRUN_TEST_UNSET_PORT_XYZ", 8080u16).unwrap();
        assert_eq!(v, 8080);
    }

    #[test]
    fn test_env_list_default() {
        let v = env_list("NOXRUN_TEST_UNSET_LIST_XYZ", vec!["a".to_string()]);
        assert_eq!(v, vec!["a".to_string()]);
    }
}
