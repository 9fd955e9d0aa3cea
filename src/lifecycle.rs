//! NOXRUN Background Loops
//!
//! Long-running tasks for session reaping, heartbeat sweeping, node
//! probing, warm-pool replenishment and retention cleanup. Each loop owns
//! its own timer and exits cooperatively when the shutdown watch channel
//! flips; none of them hold locks across I/O.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{self, DbPool};
use crate::executions::ExecutionEngine;
use crate::ids;
use crate::metrics::Metrics;
use crate::runtime::{ContainerConfig, ContainerScheduler};
use crate::scheduler::{pick_load_balanced, PlacementRequest};
use crate::sessions::SessionManager;
use crate::warm_pool::{WarmContainer, WarmPool};

/// Warm containers spawned per template per replenish tick.
const MAX_WARM_SPAWNS_PER_TICK: usize = 2;

pub struct LifecycleManager {
    db: DbPool,
    sessions: Arc<SessionManager>,
    engine: Arc<ExecutionEngine>,
    runtime: Arc<dyn ContainerScheduler>,
    pool: Arc<WarmPool>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    probe_client: reqwest::Client,
}

impl LifecycleManager {
    pub fn new(
        db: DbPool,
        sessions: Arc<SessionManager>,
        engine: Arc<ExecutionEngine>,
        runtime: Arc<dyn ContainerScheduler>,
        pool: Arc<WarmPool>,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let probe_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { db, sessions, engine, runtime, pool, config, metrics, probe_client }
    }

    /// Spawn every loop; each holds a clone of the shutdown receiver.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!("Starting lifecycle background tasks");

        let reaper = self.clone();
        let reaper_shutdown = shutdown.clone();
        tokio::spawn(async move {
            reaper.run_reaper_loop(reaper_shutdown).await;
        });

        let sweeper = self.clone();
        let sweeper_shutdown = shutdown.clone();
        tokio::spawn(async move {
            sweeper.run_heartbeat_sweep_loop(sweeper_shutdown).await;
        });

        let prober = self.clone();
        let prober_shutdown = shutdown.clone();
        tokio::spawn(async move {
            prober.run_node_probe_loop(prober_shutdown).await;
        });

        if self.pool.enabled() {
            let replenisher = self.clone();
            tokio::spawn(async move {
                replenisher.run_replenisher_loop(shutdown).await;
            });
        }
    }

    /// Idle/lifetime reaper plus the creating-deadline sweep and retention
    /// cleanup, every ~60 s.
    async fn run_reaper_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.config.lifecycle.cleanup_interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_tick().await {
                        error!("Reaper tick failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Reaper loop stopping");
                    return;
                }
            }
        }
    }

    async fn reap_tick(&self) -> Result<(), crate::error::ApiError> {
        let now = Utc::now();

        // Hard lifetime: expires_at is written at create time.
        for session in db::sessions::list_expired(&self.db, now).await? {
            let id = session.id.clone();
            if let Err(e) = self.sessions.reap(session, "session lifetime expired").await {
                warn!("Failed to reap expired session {}: {}", id, e);
            }
        }

        // Idle threshold; -1 disables.
        let idle = self.config.lifecycle.idle_timeout_secs;
        if idle >= 0 {
            let cutoff = now - ChronoDuration::seconds(idle);
            for session in db::sessions::list_idle(&self.db, cutoff).await? {
                let id = session.id.clone();
                if let Err(e) = self.sessions.reap(session, "idle timeout").await {
                    warn!("Failed to reap idle session {}: {}", id, e);
                }
            }
        }

        // Max lifetime independent of expires_at; -1 disables.
        let lifetime = self.config.lifecycle.max_lifetime_secs;
        if lifetime >= 0 {
            let cutoff = now - ChronoDuration::seconds(lifetime);
            for session in db::sessions::list_exceeding_lifetime(&self.db, cutoff).await? {
                let id = session.id.clone();
                if let Err(e) = self.sessions.reap(session, "max lifetime reached").await {
                    warn!("Failed to reap long-lived session {}: {}", id, e);
                }
            }
        }

        // Sessions whose container never called back.
        let creating_cutoff =
            now - ChronoDuration::seconds(self.config.lifecycle.creating_deadline_secs as i64);
        for session in db::sessions::list_stuck_creating(&self.db, creating_cutoff).await? {
            if let Err(e) = self.sessions.fail_stuck_creating(session).await {
                warn!("Failed to fail stuck-creating session: {}", e);
            }
        }

        let active = db::sessions::list_active(&self.db).await?;
        self.metrics.active_sessions.set(active.len() as i64);
        self.sessions.evict_expired_cache();

        if let Err(e) = db::cleanup::run_all(&self.db, self.config.lifecycle.retention_days).await {
            error!("Retention cleanup failed: {}", e);
        }
        Ok(())
    }

    /// Heartbeat timeout sweeper: stalled executions crash and retry.
    async fn run_heartbeat_sweep_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            interval(Duration::from_secs(self.config.lifecycle.heartbeat_sweep_interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.engine.sweep_stale_heartbeats().await {
                        error!("Heartbeat sweep failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Heartbeat sweeper stopping");
                    return;
                }
            }
        }
    }

    /// Node health probe: GET {endpoint}/health, three strikes to unhealthy.
    async fn run_node_probe_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            interval(Duration::from_secs(self.config.lifecycle.node_probe_interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.probe_tick().await {
                        error!("Node probe tick failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Node probe loop stopping");
                    return;
                }
            }
        }
    }

    async fn probe_tick(&self) -> Result<(), crate::error::ApiError> {
        let nodes = db::nodes::list(&self.db).await?;
        let mut online = 0i64;

        for node in &nodes {
            let status = node.status_enum();
            if matches!(
                status,
                db::nodes::NodeStatus::Offline | db::nodes::NodeStatus::Maintenance
            ) {
                continue;
            }

            let url = format!("{}/health", node.endpoint.trim_end_matches('/'));
            match self.probe_client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    db::nodes::probe_succeeded(&self.db, &node.id).await?;
                    online += 1;
                }
                Ok(resp) => {
                    debug!("Node {} probe returned {}", node.id, resp.status());
                    db::nodes::probe_failed(&self.db, &node.id).await?;
                }
                Err(e) => {
                    debug!("Node {} probe failed: {}", node.id, e);
                    db::nodes::probe_failed(&self.db, &node.id).await?;
                }
            }
        }

        // Silence past the threshold is also sufficient.
        let cutoff = Utc::now()
            - ChronoDuration::seconds(self.config.lifecycle.node_offline_threshold_secs as i64);
        let flipped = db::nodes::mark_stale_unhealthy(&self.db, cutoff).await?;
        if flipped > 0 {
            warn!("{} nodes went unhealthy on heartbeat silence", flipped);
        }

        self.metrics.online_nodes.set(online);
        Ok(())
    }

    /// Warm-pool replenisher: top template buckets up to target, drain
    /// surplus and deactivated templates.
    async fn run_replenisher_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            interval(Duration::from_secs(self.config.scheduler.replenish_interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.replenish_tick().await {
                        error!("Warm-pool replenish tick failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("Warm-pool replenisher stopping");
                    return;
                }
            }
        }
    }

    async fn replenish_tick(&self) -> Result<(), crate::error::ApiError> {
        let templates = db::templates::list(&self.db, false).await?;

        for template in &templates {
            if !template.active {
                for dead in self.pool.drain(&template.id) {
                    self.destroy_warm(dead).await;
                }
                continue;
            }

            let target = self.pool.target_for(&template.name);
            for extra in self.pool.surplus(&template.id, target) {
                self.destroy_warm(extra).await;
            }

            let deficit = self.pool.deficit(&template.id, &template.name);
            for _ in 0..deficit.min(MAX_WARM_SPAWNS_PER_TICK) {
                if let Err(e) = self.spawn_warm(template).await {
                    debug!("Warm spawn for {} skipped: {}", template.name, e);
                    break;
                }
            }
        }
        Ok(())
    }

    async fn destroy_warm(&self, warm: WarmContainer) {
        debug!("Destroying surplus warm container {}", warm.container_id);
        if let Err(e) = self.runtime.destroy_container(&warm.container_id).await {
            warn!("Failed to destroy warm container {}: {}", warm.container_id, e);
        }
        if let Some(node_id) = warm.node_id {
            let _ = db::nodes::release(&self.db, &node_id, warm.cpu_millis, warm.memory_mb).await;
        }
    }

    /// Pre-instantiate one container for a template against a fresh
    /// pre-generated session id; it waits in the pool until claimed.
    async fn spawn_warm(
        &self,
        template: &db::templates::TemplateRecord,
    ) -> Result<(), crate::error::ApiError> {
        let cpu_millis = crate::runtime::parse_cpu_millis(&template.default_cpu).unwrap_or(1000);
        let memory_mb = crate::runtime::parse_memory_mb(&template.default_memory).unwrap_or(512);

        let request = PlacementRequest {
            template_id: template.id.clone(),
            template_name: template.name.clone(),
            image: template.image.clone(),
            cpu_millis,
            memory_mb,
            persistent: false,
            agent_affinity_id: None,
            has_extra_dependencies: false,
        };

        let nodes = db::nodes::list_online(&self.db).await?;
        let Some(node) = pick_load_balanced(&nodes, &request, &self.config.scheduler) else {
            return Err(crate::error::ApiError::capacity_exhausted(
                "no capacity for warm containers",
            ));
        };
        if !db::nodes::allocate(&self.db, &node.node_id, cpu_millis, memory_mb).await? {
            return Err(crate::error::ApiError::capacity_exhausted(
                "warm allocation lost its race",
            ));
        }

        let presession_id = ids::new_session_id();
        let mut env = std::collections::HashMap::new();
        env.insert("NOXRUN_S3_ACCESS_KEY".to_string(), self.config.storage.access_key.clone());
        env.insert("NOXRUN_S3_SECRET_KEY".to_string(), self.config.storage.secret_key.clone());
        if let Some(endpoint) = &self.config.storage.endpoint {
            env.insert("NOXRUN_S3_ENDPOINT".to_string(), endpoint.clone());
        }
        env.insert(
            "NOXRUN_CALLBACK_URL".to_string(),
            self.config.server.callback_base_url.clone(),
        );
        env.insert(
            "NOXRUN_CALLBACK_TOKEN".to_string(),
            self.config.security.internal_token.clone(),
        );
        env.insert("NOXRUN_SESSION_ID".to_string(), presession_id.clone());

        let container_config = ContainerConfig {
            session_id: presession_id.clone(),
            image: template.image.clone(),
            cpu_millis,
            memory_mb,
            disk_gb: crate::runtime::parse_disk_gb(&template.default_disk).unwrap_or(1),
            env,
            labels: std::collections::HashMap::new(),
            workspace_url: self.sessions.store().workspace_url(&presession_id),
            network_mode: "bridge".to_string(),
            user: template.run_as_user.clone(),
            mount_workspace: true,
            dependencies: vec![],
            executor_port: self.config.runtime.executor_port,
        };

        match self.runtime.create_container(&container_config).await {
            Ok(container_id) => {
                info!(
                    "Warm container {} ready to stock for template {}",
                    container_id, template.name
                );
                self.pool.stock(
                    &template.id,
                    WarmContainer {
                        session_id: presession_id,
                        container_id,
                        node_id: Some(node.node_id),
                        cpu_millis,
                        memory_mb,
                        executor_url: None,
                    },
                );
                Ok(())
            }
            Err(e) => {
                let _ = db::nodes::release(&self.db, &node.node_id, cpu_millis, memory_mb).await;
                Err(e.into())
            }
        }
    }
}
