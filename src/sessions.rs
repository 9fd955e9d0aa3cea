//! NOXRUN Session Lifecycle Manager
//!
//! Sole owner of session mutations. Every transition goes through the state
//! machine on [`SessionStatus`] and is persisted with a version CAS; a CAS
//! loss re-reads current state and re-evaluates instead of overwriting.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cache::TemplateCache;
use crate::config::Config;
use crate::db::sessions::{
    DependencyStatus, NewSession, SessionMode, SessionRecord, SessionStatus,
};
use crate::db::templates::TemplateRecord;
use crate::db::{self, DbPool};
use crate::error::ApiError;
use crate::ids;
use crate::metrics::Metrics;
use crate::runtime::{self, ContainerConfig, ContainerScheduler};
use crate::scheduler::{Placement, PlacementRequest, Scheduler};
use crate::security;
use crate::storage::ObjectStore;

/// Upper bound on a session's requested lifetime (6 h).
const MAX_SESSION_TIMEOUT_SECS: i64 = 21_600;

/// How many times a CAS transition is retried against concurrent writers.
const CAS_ATTEMPTS: usize = 3;

/// How many placement attempts before giving up on allocation races.
const PLACEMENT_ATTEMPTS: usize = 3;

/// Log tail captured into the error detail when a container dies early.
const FAILURE_LOG_TAIL: i64 = 40;

pub struct CreateSessionParams {
    pub template_id: String,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub disk: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout_sec: Option<i64>,
    pub mode: SessionMode,
    pub agent_id: Option<String>,
    pub dependencies: Vec<String>,
}

pub struct SessionManager {
    db: DbPool,
    runtime: Arc<dyn ContainerScheduler>,
    scheduler: Arc<Scheduler>,
    store: ObjectStore,
    template_cache: Arc<TemplateCache>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
}

impl SessionManager {
    pub fn new(
        db: DbPool,
        runtime: Arc<dyn ContainerScheduler>,
        scheduler: Arc<Scheduler>,
        store: ObjectStore,
        template_cache: Arc<TemplateCache>,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { db, runtime, scheduler, store, template_cache, config, metrics }
    }

    /// Template read through the short-TTL cache; a database blip serves
    /// the last known value rather than failing the read path.
    async fn template(&self, id: &str) -> Result<Option<TemplateRecord>, ApiError> {
        if let Some(cached) = self.template_cache.get(&id.to_string()) {
            return Ok(Some(cached));
        }
        match db::templates::get_by_id(&self.db, id).await {
            Ok(Some(record)) => {
                self.template_cache.put(id.to_string(), record.clone());
                Ok(Some(record))
            }
            Ok(None) => {
                self.template_cache.invalidate(&id.to_string());
                Ok(None)
            }
            Err(e) => match self.template_cache.get_stale(&id.to_string()) {
                Some(stale) => {
                    warn!("Serving stale template {} during database error: {}", id, e);
                    Ok(Some(stale))
                }
                None => Err(e.into()),
            },
        }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Periodic cache hygiene, driven by the reaper loop.
    pub fn evict_expired_cache(&self) {
        self.template_cache.evict_expired();
    }

    // ---- Create ----------------------------------------------------------

    pub async fn create(&self, params: CreateSessionParams) -> Result<SessionRecord, ApiError> {
        let template = self
            .template(&params.template_id)
            .await?
            .ok_or_else(|| ApiError::not_found("template", &params.template_id))?;
        if !template.active {
            return Err(ApiError::invalid_parameter(format!(
                "template '{}' is deprecated and not accepting new sessions",
                template.name
            )));
        }

        let (cpu, memory, disk) = validate_resources(&template, &params)?;
        security::validate_env_map(&params.env)
            .map_err(|r| ApiError::invalid_parameter(r.reason))?;

        for pkg in &params.dependencies {
            security::validate_package_name(pkg)
                .map_err(|r| ApiError::invalid_parameter(r.reason))?;
        }
        check_dependency_conflicts(
            &template,
            &params.dependencies,
            self.config.runtime.allow_version_conflicts,
        )?;

        if params.mode == SessionMode::Persistent && params.agent_id.is_none() {
            return Err(ApiError::invalid_parameter(
                "persistent mode requires agent_id",
            ));
        }

        let timeout_sec = params.timeout_sec.unwrap_or(template.default_timeout_sec as i64);
        if timeout_sec <= 0 || timeout_sec > MAX_SESSION_TIMEOUT_SECS {
            return Err(ApiError::invalid_parameter(format!(
                "timeout must be in 1..={} seconds",
                MAX_SESSION_TIMEOUT_SECS
            )));
        }

        let cpu_millis = runtime::parse_cpu_millis(&cpu)
            .ok_or_else(|| ApiError::invalid_parameter(format!("invalid cpu quantity '{}'", cpu)))?;
        let memory_mb = runtime::parse_memory_mb(&memory).ok_or_else(|| {
            ApiError::invalid_parameter(format!("invalid memory quantity '{}'", memory))
        })?;
        runtime::parse_disk_gb(&disk)
            .ok_or_else(|| ApiError::invalid_parameter(format!("invalid disk quantity '{}'", disk)))?;

        let request = PlacementRequest {
            template_id: template.id.clone(),
            template_name: template.name.clone(),
            image: template.image.clone(),
            cpu_millis,
            memory_mb,
            persistent: params.mode == SessionMode::Persistent,
            agent_affinity_id: params.agent_id.clone(),
            has_extra_dependencies: !params.dependencies.is_empty(),
        };

        let started = std::time::Instant::now();
        let mut last_err = None;
        for _ in 0..PLACEMENT_ATTEMPTS {
            let placement = match self.scheduler.place(&self.db, &request).await {
                Ok(p) => p,
                Err(e) => {
                    if e.code == crate::error::ErrorCode::TooManyRequests {
                        self.metrics.placements_exhausted.inc();
                    }
                    return Err(e);
                }
            };

            match self
                .materialize(
                    &template,
                    &params,
                    placement,
                    timeout_sec,
                    (cpu.as_str(), memory.as_str(), disk.as_str()),
                )
                .await
            {
                Ok(record) => {
                    self.metrics.sessions_created.inc();
                    self.metrics
                        .scheduling_latency_ms
                        .observe(started.elapsed().as_millis() as u64);
                    return Ok(record);
                }
                // Allocation races re-enter the placement loop.
                Err(MaterializeError::AllocationRace) => continue,
                Err(MaterializeError::Api(e)) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            self.metrics.placements_exhausted.inc();
            ApiError::capacity_exhausted("placement kept losing allocation races")
        }))
    }

    async fn materialize(
        &self,
        template: &TemplateRecord,
        params: &CreateSessionParams,
        placement: Placement,
        timeout_sec: i64,
        resources: (&str, &str, &str),
    ) -> Result<SessionRecord, MaterializeError> {
        let (cpu, memory, disk) = resources;
        let env_json = serde_json::to_value(&params.env)
            .map_err(|e| MaterializeError::Api(ApiError::internal(e.to_string())))?;
        let packages_json = serde_json::json!(params.dependencies);
        let expires_at = Utc::now() + ChronoDuration::seconds(timeout_sec);

        match placement {
            Placement::Warm(warm) => {
                // The warm container already mounted the workspace for its
                // pre-generated id; the session adopts that id wholesale.
                let session_id = warm.session_id.clone();
                let record = db::sessions::create(
                    &self.db,
                    NewSession {
                        id: &session_id,
                        template_id: &template.id,
                        mode: params.mode,
                        cpu,
                        memory,
                        disk,
                        env: &env_json,
                        workspace_object_path: &self.store.workspace_url(&session_id),
                        agent_affinity_id: params.agent_id.as_deref(),
                        requested_packages: &packages_json,
                        timeout_sec: timeout_sec as i32,
                        expires_at,
                    },
                )
                .await
                .map_err(|e| MaterializeError::Api(e.into()))?;

                db::sessions::cas_set_placement(
                    &self.db,
                    &session_id,
                    record.version,
                    warm.node_id.as_deref(),
                    Some(&warm.container_id),
                )
                .await
                .map_err(|e| MaterializeError::Api(e.into()))?;

                // Warm containers get their row only once claimed; until
                // then the pool itself is their registry.
                db::containers::create(
                    &self.db,
                    db::containers::NewContainer {
                        id: &warm.container_id,
                        session_id: &session_id,
                        runtime_type: self.runtime.runtime_type(),
                        node_id: warm.node_id.as_deref(),
                        image: &template.image,
                        cpu,
                        memory,
                    },
                )
                .await
                .map_err(|e| MaterializeError::Api(e.into()))?;

                self.metrics.placements_warm.inc();
                info!(
                    "Session {} claimed warm container {} (template {})",
                    session_id, warm.container_id, template.name
                );

                // If the warm executor already reported ready, finish the
                // creating -> running hop immediately.
                if let Some(url) = warm.executor_url {
                    self.on_container_ready(&session_id, &url).await.map_err(MaterializeError::Api)?;
                }

                db::sessions::get_required(&self.db, &session_id)
                    .await
                    .map_err(|e| MaterializeError::Api(e.into()))
            }
            Placement::Node(node) => {
                let allocated = db::nodes::allocate(
                    &self.db,
                    &node.node_id,
                    runtime::parse_cpu_millis(cpu).unwrap_or(1000),
                    runtime::parse_memory_mb(memory).unwrap_or(512),
                )
                .await
                .map_err(|e| MaterializeError::Api(e.into()))?;
                if !allocated {
                    debug!("Lost allocation race on node {}", node.node_id);
                    return Err(MaterializeError::AllocationRace);
                }

                let session_id = ids::new_session_id();
                let record = db::sessions::create(
                    &self.db,
                    NewSession {
                        id: &session_id,
                        template_id: &template.id,
                        mode: params.mode,
                        cpu,
                        memory,
                        disk,
                        env: &env_json,
                        workspace_object_path: &self.store.workspace_url(&session_id),
                        agent_affinity_id: params.agent_id.as_deref(),
                        requested_packages: &packages_json,
                        timeout_sec: timeout_sec as i32,
                        expires_at,
                    },
                )
                .await
                .map_err(|e| MaterializeError::Api(e.into()))?;

                db::sessions::cas_set_placement(
                    &self.db,
                    &session_id,
                    record.version,
                    Some(&node.node_id),
                    None,
                )
                .await
                .map_err(|e| MaterializeError::Api(e.into()))?;

                match node.tier {
                    crate::scheduler::PlacementTier::Affinity => {
                        self.metrics.placements_affinity.inc()
                    }
                    crate::scheduler::PlacementTier::LoadBalance => {
                        self.metrics.placements_load.inc()
                    }
                }

                // Container creation happens off the request path; the
                // session stays `creating` until the ready callback.
                self.spawn_container_task(record.clone(), template.clone(), Some(node.node_id));

                db::sessions::get_required(&self.db, &session_id)
                    .await
                    .map_err(|e| MaterializeError::Api(e.into()))
            }
        }
    }

    /// Build the container config for a session and launch it in the
    /// background; failures transition the session to failed.
    pub fn spawn_container_task(
        &self,
        session: SessionRecord,
        template: TemplateRecord,
        node_id: Option<String>,
    ) {
        let db = self.db.clone();
        let runtime = self.runtime.clone();
        let store = self.store.clone();
        let config = self.config.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let result = launch_container(&db, runtime.as_ref(), &store, &config, &session, &template, node_id.as_deref()).await;
            if let Err(e) = result {
                error!("Container launch failed for session {}: {}", session.id, e);
                metrics.sessions_failed.inc();
                let _ = fail_with_current_version(&db, &session.id, SessionStatus::Failed, &format!("container launch failed: {}", e)).await;
            }
        });
    }

    // ---- Reads -----------------------------------------------------------

    pub async fn get(&self, id: &str) -> Result<SessionRecord, ApiError> {
        if !ids::is_session_id(id) {
            return Err(ApiError::invalid_parameter(format!("'{}' is not a session id", id)));
        }
        db::sessions::get_by_id(&self.db, id)
            .await?
            .ok_or_else(|| ApiError::not_found("session", id))
    }

    pub async fn list(
        &self,
        status: Option<&str>,
        template_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SessionRecord>, ApiError> {
        if let Some(s) = status {
            if SessionStatus::parse(s).is_none() {
                return Err(ApiError::invalid_parameter(format!("unknown status '{}'", s)));
            }
        }
        Ok(db::sessions::list(&self.db, status, template_id, limit, offset).await?)
    }

    pub async fn touch(&self, id: &str) {
        if let Err(e) = db::sessions::touch(&self.db, id).await {
            debug!("Activity touch failed for {}: {}", id, e);
        }
    }

    // ---- Terminate & reap ------------------------------------------------

    /// Idempotent terminate: a session already terminal returns as-is.
    pub async fn terminate(&self, id: &str) -> Result<SessionRecord, ApiError> {
        let session = self.get(id).await?;
        if session.is_terminal() {
            return Ok(session);
        }
        self.shutdown(session, SessionStatus::Terminated, "terminated by request").await?;
        self.metrics.sessions_terminated.inc();
        Ok(db::sessions::get_required(&self.db, id).await?)
    }

    /// Reaper path: expiry or idleness moves running sessions to `timeout`.
    pub async fn reap(&self, session: SessionRecord, reason: &str) -> Result<(), ApiError> {
        if session.status_enum() != SessionStatus::Running {
            return Ok(());
        }
        info!("Reaping session {} ({})", session.id, reason);
        self.shutdown(session, SessionStatus::Timeout, reason).await?;
        self.metrics.sessions_reaped.inc();
        Ok(())
    }

    /// Tear down the container and workspace, then CAS to the target
    /// terminal status (re-reading on conflicts).
    async fn shutdown(
        &self,
        session: SessionRecord,
        target: SessionStatus,
        detail: &str,
    ) -> Result<(), ApiError> {
        if let Some(container_id) = &session.container_id {
            db::containers::mark_deleting(&self.db, container_id).await.ok();
            if let Err(e) = self.runtime.destroy_container(container_id).await {
                warn!("Failed to destroy container {}: {}", container_id, e);
            }
            db::containers::mark_exited(&self.db, container_id).await.ok();
        }

        // Workspace prefixes are removed on terminate/timeout; the storage
        // lifecycle policy covers the 24 h retention window for the rest.
        if matches!(target, SessionStatus::Terminated | SessionStatus::Timeout) {
            let prefix = self.store.workspace_prefix(&session.id);
            if let Err(e) = self.store.delete_prefix(&prefix).await {
                warn!("Workspace cleanup failed for {}: {}", session.id, e);
            }
        }

        let mut current = session;
        for _ in 0..CAS_ATTEMPTS {
            if current.is_terminal() {
                return Ok(());
            }
            if !current.status_enum().can_transition_to(target) {
                return Err(ApiError::state_conflict(
                    format!("session {} cannot move {} -> {}", current.id, current.status, target),
                    "Re-read the session and decide from its current status.",
                ));
            }
            if db::sessions::cas_mark_failed(&self.db, &current.id, current.version, target, detail)
                .await?
            {
                release_node_resources(&self.db, &current).await;
                return Ok(());
            }
            current = db::sessions::get_required(&self.db, &current.id).await?;
        }
        Err(ApiError::internal(format!(
            "session {} transition kept losing CAS races",
            current.id
        )))
    }

    // ---- Internal callbacks ----------------------------------------------

    /// `container_ready` callback: creating -> running.
    pub async fn on_container_ready(
        &self,
        session_id: &str,
        executor_url: &str,
    ) -> Result<(), ApiError> {
        let Some(session) = db::sessions::get_by_id(&self.db, session_id).await? else {
            // No row: a warm container announcing itself.
            if self.scheduler.warm_pool().note_ready(session_id, executor_url) {
                debug!("Warm container for {} is ready", session_id);
                return Ok(());
            }
            return Err(ApiError::not_found("session", session_id));
        };

        let mut current = session;
        for _ in 0..CAS_ATTEMPTS {
            match current.status_enum() {
                SessionStatus::Creating => {
                    if db::sessions::cas_mark_running(&self.db, session_id, current.version, executor_url).await? {
                        info!("Session {} is running at {}", session_id, executor_url);
                        if let Some(container_id) = &current.container_id {
                            db::containers::mark_running(&self.db, container_id, None, None).await.ok();
                        }
                        return Ok(());
                    }
                    current = db::sessions::get_required(&self.db, session_id).await?;
                }
                // Replayed callback after the transition already happened.
                SessionStatus::Running => return Ok(()),
                other => {
                    return Err(ApiError::state_conflict(
                        format!("session {} is {}, cannot become running", session_id, other),
                        "The session reached a terminal state before the container came up.",
                    ))
                }
            }
        }
        Err(ApiError::internal("container_ready kept losing CAS races"))
    }

    /// `container_exited` callback.
    pub async fn on_container_exited(
        &self,
        session_id: &str,
        exit_code: i64,
        reason: Option<&str>,
    ) -> Result<(), ApiError> {
        let Some(session) = db::sessions::get_by_id(&self.db, session_id).await? else {
            // An unclaimed warm container died; drop it from the pool.
            if let Some(warm) = self.scheduler.warm_pool().evict(session_id) {
                warn!(
                    "Warm container {} exited before being claimed (code {})",
                    warm.container_id, exit_code
                );
                let _ = self.runtime.destroy_container(&warm.container_id).await;
                if let Some(node_id) = warm.node_id {
                    let _ =
                        db::nodes::release(&self.db, &node_id, warm.cpu_millis, warm.memory_mb)
                            .await;
                }
                return Ok(());
            }
            return Err(ApiError::not_found("session", session_id));
        };
        if let Some(container_id) = &session.container_id {
            db::containers::mark_exited(&self.db, container_id).await.ok();
        }
        if session.is_terminal() {
            return Ok(());
        }

        let tail = match &session.container_id {
            Some(cid) => self
                .runtime
                .container_logs(cid, FAILURE_LOG_TAIL, None)
                .await
                .unwrap_or_default(),
            None => String::new(),
        };

        match session.status_enum() {
            SessionStatus::Creating => {
                // Dependency installation exits with a distinct code.
                if exit_code == crate::runtime::entrypoint::INSTALL_FAILED_EXIT as i64 {
                    db::sessions::set_dependency_status(
                        &self.db,
                        session_id,
                        DependencyStatus::Failed,
                        None,
                        Some(&tail),
                    )
                    .await?;
                }
                let detail = format!(
                    "container exited during startup (code {}, {}): {}",
                    exit_code,
                    reason.unwrap_or("unknown"),
                    tail
                );
                self.metrics.sessions_failed.inc();
                fail_with_current_version(&self.db, session_id, SessionStatus::Failed, &detail).await?;
            }
            SessionStatus::Running => {
                let (target, detail) = if exit_code == 0 {
                    (SessionStatus::Completed, "executor exited cleanly".to_string())
                } else {
                    self.metrics.sessions_failed.inc();
                    (
                        SessionStatus::Failed,
                        format!(
                            "executor exited with code {} ({}): {}",
                            exit_code,
                            reason.unwrap_or("unknown"),
                            tail
                        ),
                    )
                };
                fail_with_current_version(&self.db, session_id, target, &detail).await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Migrate a persistent session whose container was evicted: back to
    /// `creating`, workspace path reused, fresh node placement. Crashed
    /// executions re-dispatch after the replacement's ready callback.
    pub async fn migrate(&self, session: SessionRecord) -> Result<(), ApiError> {
        if session.status_enum() != SessionStatus::Running {
            return Ok(());
        }
        info!("Migrating persistent session {} off its lost container", session.id);

        if let Some(container_id) = &session.container_id {
            db::containers::mark_exited(&self.db, container_id).await.ok();
        }

        if !db::sessions::cas_requeue_for_migration(&self.db, &session.id, session.version).await? {
            // A fresh request-path write won; reconciliation backs off.
            return Ok(());
        }
        // The requeue nulled node_id on the row; the pre-requeue record
        // still knows which node to credit.
        release_node_resources(&self.db, &session).await;

        let template = db::templates::get_required(&self.db, &session.template_id).await?;
        let request = PlacementRequest {
            template_id: template.id.clone(),
            template_name: template.name.clone(),
            image: template.image.clone(),
            cpu_millis: runtime::parse_cpu_millis(&session.cpu).unwrap_or(1000),
            memory_mb: runtime::parse_memory_mb(&session.memory).unwrap_or(512),
            persistent: true,
            agent_affinity_id: session.agent_affinity_id.clone(),
            // The warm tier is ineligible: adopting a warm container would
            // change the session id and orphan the workspace.
            has_extra_dependencies: true,
        };

        let nodes = db::nodes::list_online(&self.db).await?;
        let picked = crate::scheduler::pick_affinity(&nodes, &request, &self.config.scheduler)
            .or_else(|| {
                crate::scheduler::pick_load_balanced(&nodes, &request, &self.config.scheduler)
            });

        let Some(node) = picked else {
            warn!("No node available to migrate session {}", session.id);
            self.metrics.sessions_failed.inc();
            fail_with_current_version(
                &self.db,
                &session.id,
                SessionStatus::Failed,
                "no schedulable node for migration after eviction",
            )
            .await?;
            return Ok(());
        };

        if !db::nodes::allocate(&self.db, &node.node_id, request.cpu_millis, request.memory_mb).await? {
            self.metrics.sessions_failed.inc();
            fail_with_current_version(
                &self.db,
                &session.id,
                SessionStatus::Failed,
                "migration target lost its capacity",
            )
            .await?;
            return Ok(());
        }

        let current = db::sessions::get_required(&self.db, &session.id).await?;
        self.metrics.sessions_migrated.inc();
        self.spawn_container_task(current, template, Some(node.node_id));
        Ok(())
    }

    /// Sessions stuck in `creating` past the deadline fail with the log
    /// tail captured from the container scheduler.
    pub async fn fail_stuck_creating(&self, session: SessionRecord) -> Result<(), ApiError> {
        if session.status_enum() != SessionStatus::Creating {
            return Ok(());
        }
        warn!(
            "Session {} produced no ready callback within {}s",
            session.id, self.config.lifecycle.creating_deadline_secs
        );

        let tail = match &session.container_id {
            Some(cid) => self
                .runtime
                .container_logs(cid, FAILURE_LOG_TAIL, None)
                .await
                .unwrap_or_default(),
            None => String::new(),
        };
        if let Some(cid) = &session.container_id {
            let _ = self.runtime.destroy_container(cid).await;
            db::containers::mark_exited(&self.db, cid).await.ok();
        }
        self.metrics.sessions_failed.inc();

        let detail = format!("container never became ready: {}", tail);
        fail_with_current_version(&self.db, &session.id, SessionStatus::Failed, &detail).await?;
        Ok(())
    }
}

enum MaterializeError {
    AllocationRace,
    Api(ApiError),
}

/// CAS helper that re-reads on conflict; used where the caller has no
/// version in hand (background failure paths). Returns true when this call
/// performed the transition, so exactly one caller releases the session's
/// node resources.
pub(crate) async fn fail_with_current_version(
    db: &DbPool,
    session_id: &str,
    target: SessionStatus,
    detail: &str,
) -> Result<bool, ApiError> {
    for _ in 0..CAS_ATTEMPTS {
        let Some(current) = db::sessions::get_by_id(db, session_id).await? else {
            return Ok(false);
        };
        if current.is_terminal() || !current.status_enum().can_transition_to(target) {
            return Ok(false);
        }
        if db::sessions::cas_mark_failed(db, session_id, current.version, target, detail).await? {
            release_node_resources(db, &current).await;
            return Ok(true);
        }
    }
    Err(ApiError::internal(format!(
        "session {} failure transition kept losing CAS races",
        session_id
    )))
}

/// Give a session's reserved node capacity back. Only ever called by the
/// writer that won the terminal/migration transition.
pub(crate) async fn release_node_resources(db: &DbPool, session: &SessionRecord) {
    if let Some(node_id) = &session.node_id {
        let cpu = runtime::parse_cpu_millis(&session.cpu).unwrap_or(0);
        let mem = runtime::parse_memory_mb(&session.memory).unwrap_or(0);
        if let Err(e) = db::nodes::release(db, node_id, cpu, mem).await {
            warn!("Resource release failed on node {}: {}", node_id, e);
        }
    }
}

/// Launch the session's container on the chosen backend.
async fn launch_container(
    db: &DbPool,
    runtime: &dyn ContainerScheduler,
    store: &ObjectStore,
    config: &Config,
    session: &SessionRecord,
    template: &TemplateRecord,
    node_id: Option<&str>,
) -> Result<(), ApiError> {
    let mut env: HashMap<String, String> = serde_json::from_value(session.env.clone()).unwrap_or_default();

    // The entrypoint needs store credentials for the FUSE mount and the
    // executor needs to know where to call back.
    env.insert("NOXRUN_S3_ACCESS_KEY".into(), config.storage.access_key.clone());
    env.insert("NOXRUN_S3_SECRET_KEY".into(), config.storage.secret_key.clone());
    if let Some(endpoint) = &config.storage.endpoint {
        env.insert("NOXRUN_S3_ENDPOINT".into(), endpoint.clone());
    }
    env.insert("NOXRUN_CALLBACK_URL".into(), config.server.callback_base_url.clone());
    env.insert("NOXRUN_CALLBACK_TOKEN".into(), config.security.internal_token.clone());
    env.insert("NOXRUN_SESSION_ID".into(), session.id.clone());

    let dependencies: Vec<String> = session
        .requested_packages
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();

    let container_config = ContainerConfig {
        session_id: session.id.clone(),
        image: template.image.clone(),
        cpu_millis: runtime::parse_cpu_millis(&session.cpu).unwrap_or(1000),
        memory_mb: runtime::parse_memory_mb(&session.memory).unwrap_or(512),
        disk_gb: runtime::parse_disk_gb(&session.disk).unwrap_or(1),
        env,
        labels: HashMap::new(),
        workspace_url: session.workspace_object_path.clone(),
        network_mode: "bridge".to_string(),
        user: template.run_as_user.clone(),
        mount_workspace: true,
        dependencies: dependencies.clone(),
        executor_port: config.runtime.executor_port,
    };

    // At most one non-terminal container per session: a duplicate launch
    // (double callback, reconciler overlap) is a no-op when the existing
    // container is still alive.
    if let Some(existing) = db::containers::get_live_for_session(db, &session.id).await? {
        if runtime.is_container_running(&existing.id).await.unwrap_or(false) {
            debug!("Session {} already has live container {}", session.id, existing.id);
            return Ok(());
        }
        db::containers::mark_exited(db, &existing.id).await?;
    }

    if !dependencies.is_empty() {
        db::sessions::set_dependency_status(db, &session.id, DependencyStatus::Installing, None, None)
            .await?;
    }

    let container_id = runtime.create_container(&container_config).await?;

    db::containers::create(
        db,
        db::containers::NewContainer {
            id: &container_id,
            session_id: &session.id,
            runtime_type: runtime.runtime_type(),
            node_id,
            image: &template.image,
            cpu: &session.cpu,
            memory: &session.memory,
        },
    )
    .await?;

    // Record the container id; the ready callback does the status hop.
    let current = db::sessions::get_required(db, &session.id).await?;
    db::sessions::cas_set_placement(db, &session.id, current.version, node_id, Some(&container_id))
        .await?;

    Ok(())
}

fn validate_resources(
    template: &TemplateRecord,
    params: &CreateSessionParams,
) -> Result<(String, String, String), ApiError> {
    let cpu = params.cpu.clone().unwrap_or_else(|| template.default_cpu.clone());
    let memory = params.memory.clone().unwrap_or_else(|| template.default_memory.clone());
    let disk = params.disk.clone().unwrap_or_else(|| template.default_disk.clone());

    // The template's defaults double as per-session ceilings.
    let within = |req: Option<i64>, cap: Option<i64>, what: &str| -> Result<(), ApiError> {
        match (req, cap) {
            (Some(r), Some(c)) if r <= c => Ok(()),
            (Some(_), Some(c)) => Err(ApiError::invalid_parameter(format!(
                "requested {} exceeds the template ceiling ({})",
                what, c
            ))),
            _ => Err(ApiError::invalid_parameter(format!("invalid {} quantity", what))),
        }
    };

    within(
        runtime::parse_cpu_millis(&cpu),
        runtime::parse_cpu_millis(&template.default_cpu),
        "cpu",
    )?;
    within(
        runtime::parse_memory_mb(&memory),
        runtime::parse_memory_mb(&template.default_memory),
        "memory",
    )?;
    within(
        runtime::parse_disk_gb(&disk),
        runtime::parse_disk_gb(&template.default_disk),
        "disk",
    )?;

    Ok((cpu, memory, disk))
}

/// Requested packages clashing with template preinstalls are rejected
/// unless version conflicts are explicitly allowed (requested then wins via
/// install-dir precedence on PYTHONPATH).
fn check_dependency_conflicts(
    template: &TemplateRecord,
    requested: &[String],
    allow_version_conflicts: bool,
) -> Result<(), ApiError> {
    if allow_version_conflicts {
        return Ok(());
    }
    let preinstalled = template.preinstalled_names();
    let clashes: Vec<&str> = requested
        .iter()
        .map(|r| security::package_base_name(r))
        .filter(|name| preinstalled.contains(&name.to_ascii_lowercase()))
        .collect();
    if clashes.is_empty() {
        Ok(())
    } else {
        Err(ApiError::invalid_parameter(format!(
            "requested packages clash with template preinstalls: {}",
            clashes.join(", ")
        ))
        .with_solution(
            "Drop the clashing packages or set allow_version_conflicts on the deployment.",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn template() -> TemplateRecord {
        TemplateRecord {
            id: "tmpl_py".into(),
            name: "python-basic".into(),
            image: "python:3.12-slim".into(),
            runtime_type: "python".into(),
            default_cpu: "2".into(),
            default_memory: "1Gi".into(),
            default_disk: "2Gi".into(),
            default_timeout_sec: 1800,
            preinstalled_packages: serde_json::json!(["numpy==1.26.4", "requests"]),
            run_as_user: "1000:1000".into(),
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn params() -> CreateSessionParams {
        CreateSessionParams {
            template_id: "tmpl_py".into(),
            cpu: None,
            memory: None,
            disk: None,
            env: HashMap::new(),
            timeout_sec: Some(300),
            mode: SessionMode::Ephemeral,
            agent_id: None,
            dependencies: vec![],
        }
    }

    #[test]
    fn test_resources_default_from_template() {
        let (cpu, memory, disk) = validate_resources(&template(), &params()).unwrap();
        assert_eq!(cpu, "2");
        assert_eq!(memory, "1Gi");
        assert_eq!(disk, "2Gi");
    }

    #[test]
    fn test_resources_within_ceiling() {
        let mut p = params();
        p.cpu = Some("500m".into());
        p.memory = Some("512Mi".into());
        assert!(validate_resources(&template(), &p).is_ok());

        p.cpu = Some("4".into());
        let err = validate_resources(&template(), &p).unwrap_err();
        assert!(err.description.contains("cpu"));
    }

    #[test]
    fn test_resources_reject_garbage() {
        let mut p = params();
        p.memory = Some("plenty".into());
        assert!(validate_resources(&template(), &p).is_err());
    }

    #[test]
    fn test_dependency_conflicts_rejected_by_default() {
        let requested = vec!["numpy==2.0.0".to_string()];
        let err = check_dependency_conflicts(&template(), &requested, false).unwrap_err();
        assert!(err.description.contains("numpy"));
        assert!(err.solution.contains("allow_version_conflicts"));
    }

    #[test]
    fn test_dependency_conflicts_allowed_with_flag() {
        let requested = vec!["numpy==2.0.0".to_string()];
        assert!(check_dependency_conflicts(&template(), &requested, true).is_ok());
    }

    #[test]
    fn test_non_clashing_dependencies_pass() {
        let requested = vec!["pandas".to_string()];
        assert!(check_dependency_conflicts(&template(), &requested, false).is_ok());
    }
}
