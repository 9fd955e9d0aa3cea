// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! State sync: align persisted session/execution/node state with what the
//! container runtime can actually see.
//!
//! Runs once at startup and then periodically. Every write is CAS-guarded,
//! so reconciliation always loses to fresh request-path writes and is safe
//! to run concurrently with them.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::executions::ExecutionStatus;
use crate::db::sessions::{SessionMode, SessionStatus};
use crate::db::{self, DbPool};
use crate::error::ApiError;
use crate::executions::ExecutionEngine;
use crate::metrics::Metrics;
use crate::runtime::ContainerScheduler;
use crate::sessions::{fail_with_current_version, SessionManager};
use crate::warm_pool::WarmPool;

pub struct Reconciler {
    db: DbPool,
    sessions: Arc<SessionManager>,
    engine: Arc<ExecutionEngine>,
    runtime: Arc<dyn ContainerScheduler>,
    pool: Arc<WarmPool>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    pub fn new(
        db: DbPool,
        sessions: Arc<SessionManager>,
        engine: Arc<ExecutionEngine>,
        runtime: Arc<dyn ContainerScheduler>,
        pool: Arc<WarmPool>,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { db, sessions, engine, runtime, pool, config, metrics }
    }

    /// Startup pass plus the periodic loop.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            info!("Running startup reconciliation");
            if let Err(e) = self.reconcile_once().await {
                error!("Startup reconciliation failed: {}", e);
            }

            let mut ticker = interval(std::time::Duration::from_secs(
                self.config.lifecycle.reconcile_interval_secs,
            ));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.reconcile_once().await {
                            error!("Reconciliation pass failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Reconciler stopping");
                        return;
                    }
                }
            }
        });
    }

    pub async fn reconcile_once(&self) -> Result<(), ApiError> {
        self.reconcile_sessions().await?;
        self.reconcile_executions().await?;
        self.reconcile_nodes().await?;
        self.sweep_orphan_containers().await?;
        Ok(())
    }

    /// §1: every creating/running session must map to a live container.
    async fn reconcile_sessions(&self) -> Result<(), ApiError> {
        let active = db::sessions::list_active(&self.db).await?;

        for session in active {
            let Some(container_id) = session.container_id.clone() else {
                // Placement still in flight; the creating-deadline sweep
                // owns this case.
                continue;
            };

            let running = match self.runtime.is_container_running(&container_id).await {
                Ok(r) => r,
                Err(e) => {
                    // Runtime unreachable: decide nothing on missing data.
                    debug!("Skipping session {} this pass: {}", session.id, e);
                    continue;
                }
            };
            if running {
                continue;
            }

            info!(
                "Session {} lost container {} ({})",
                session.id, container_id, session.status
            );

            // Executions that were in flight on the lost container crash
            // now and enter the retry pipeline.
            let heartbeat_cutoff = Utc::now()
                - ChronoDuration::seconds(self.config.lifecycle.heartbeat_timeout_secs as i64);
            for execution in
                db::executions::list_inflight_for_session(&self.db, &session.id).await?
            {
                let stale = execution
                    .last_heartbeat_at
                    .map(|t| t < heartbeat_cutoff)
                    .unwrap_or(false);
                if stale
                    && db::executions::mark_terminal(
                        &self.db,
                        &execution.id,
                        ExecutionStatus::Crashed,
                        Some("container lost while execution was in flight"),
                    )
                    .await?
                {
                    let current = db::executions::get_required(&self.db, &execution.id).await?;
                    self.engine.handle_crash(&current).await?;
                }
            }

            db::containers::mark_exited(&self.db, &container_id).await.ok();

            match (session.status_enum(), session.mode_enum()) {
                (SessionStatus::Running, SessionMode::Persistent) => {
                    // Workspace is externally persistent; move the session.
                    self.sessions.migrate(session).await?;
                }
                (SessionStatus::Running, SessionMode::Ephemeral)
                | (SessionStatus::Creating, _) => {
                    self.metrics.sessions_failed.inc();
                    fail_with_current_version(
                        &self.db,
                        &session.id,
                        SessionStatus::Failed,
                        "container disappeared; session state could not be recovered",
                    )
                    .await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// §2: stale-heartbeat executions crash and retry.
    async fn reconcile_executions(&self) -> Result<(), ApiError> {
        self.engine.sweep_stale_heartbeats().await?;
        Ok(())
    }

    /// §3: silent nodes become unhealthy and leave the candidate set.
    async fn reconcile_nodes(&self) -> Result<(), ApiError> {
        let cutoff = Utc::now()
            - ChronoDuration::seconds(self.config.lifecycle.node_offline_threshold_secs as i64);
        let flipped = db::nodes::mark_stale_unhealthy(&self.db, cutoff).await?;
        if flipped > 0 {
            warn!("Reconciliation marked {} silent nodes unhealthy", flipped);
        }
        Ok(())
    }

    /// Containers carrying our labels with no live session behind them are
    /// torn down (control-plane crash between create and persist, or rows
    /// already cleaned up).
    async fn sweep_orphan_containers(&self) -> Result<(), ApiError> {
        let managed = match self.runtime.list_managed().await {
            Ok(list) => list,
            Err(e) => {
                debug!("Orphan sweep skipped: {}", e);
                return Ok(());
            }
        };

        for (container_id, session_id) in managed {
            // Unclaimed warm containers are tracked by the pool, not the DB.
            if self.pool.contains(&session_id) {
                continue;
            }

            let orphaned = match db::sessions::get_by_id(&self.db, &session_id).await? {
                None => true,
                Some(session) => session.is_terminal(),
            };

            if orphaned {
                warn!("Destroying orphan container {} (session {})", container_id, session_id);
                if let Err(e) = self.runtime.destroy_container(&container_id).await {
                    warn!("Failed to destroy orphan {}: {}", container_id, e);
                }
            }
        }
        Ok(())
    }
}
