// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! NOXRUN API surface: router assembly and shared application state.
//!
//! Two separately-authenticated surfaces share one process: the external
//! `/api/v1` API (bearer token) and the internal `/internal` callback API
//! (shared secret). Health and metrics stay unauthenticated.

pub mod auth;
pub mod external;
pub mod internal;
pub mod types;

use axum::error_handling::HandleErrorLayer;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::BoxError;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower::timeout::TimeoutLayer;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cache::TemplateCache;
use crate::config::Config;
use crate::db::DbPool;
use crate::executions::ExecutionEngine;
use crate::metrics::Metrics;
use crate::runtime::ContainerScheduler;
use crate::sessions::SessionManager;
use crate::storage::ObjectStore;
use crate::warm_pool::WarmPool;

#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub sessions: Arc<SessionManager>,
    pub engine: Arc<ExecutionEngine>,
    pub runtime: Arc<dyn ContainerScheduler>,
    pub store: ObjectStore,
    pub pool: Arc<WarmPool>,
    pub template_cache: Arc<TemplateCache>,
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
}

pub fn build_router(state: AppState) -> Router {
    let external = Router::new()
        .route("/sessions", post(external::create_session).get(external::list_sessions))
        .route(
            "/sessions/:id",
            get(external::get_session).delete(external::terminate_session),
        )
        .route("/sessions/:id/execute", post(external::submit_execution))
        .route("/sessions/:id/executions", get(external::list_session_executions))
        .route("/sessions/:id/files/upload", post(external::upload_file))
        .route("/sessions/:id/files/*path", get(external::download_file))
        .route("/executions/:id/status", get(external::execution_status))
        .route("/executions/:id/result", get(external::execution_result))
        .route("/executions/:id/cancel", post(external::cancel_execution))
        .route("/templates", post(external::create_template).get(external::list_templates))
        .route(
            "/templates/:id",
            get(external::get_template)
                .put(external::update_template)
                .delete(external::delete_template),
        )
        .route("/containers", get(external::list_containers))
        .route("/containers/:id", get(external::get_container))
        .route("/containers/:id/logs", get(external::container_logs))
        .layer(middleware::from_fn_with_state(state.clone(), auth::external_auth));

    let internal = Router::new()
        .route("/executions/:id/result", post(internal::execution_result))
        .route("/executions/:id/status", post(internal::execution_status))
        .route("/executions/:id/heartbeat", post(internal::execution_heartbeat))
        .route("/executions/:id/artifacts", post(internal::execution_artifacts))
        .route("/sessions/:id/container_ready", post(internal::container_ready))
        .route("/sessions/:id/container_exited", post(internal::container_exited))
        .route("/nodes/register", post(internal::register_node))
        .route("/nodes", get(internal::list_nodes))
        .route("/nodes/:id/status", post(internal::set_node_status))
        .route("/nodes/:id", axum::routing::delete(internal::delete_node))
        .layer(middleware::from_fn_with_state(state.clone(), auth::internal_auth));

    Router::new()
        .route("/health", get(external::health))
        .route("/metrics", get(external::metrics))
        .nest("/api/v1", external)
        .nest("/internal", internal)
        .layer(middleware::from_fn(auth::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        // Per-request deadline; handler-internal calls carry their own
        // tighter timeouts.
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout))
                .layer(TimeoutLayer::new(Duration::from_secs(
                    REQUEST_DEADLINE_SECS,
                ))),
        )
        .layer(DefaultBodyLimit::max(state.config.security.max_upload_bytes + 64 * 1024))
        .with_state(state)
}

/// Outermost request deadline. Uploads of the full 100 MiB body over slow
/// links are the sizing constraint.
const REQUEST_DEADLINE_SECS: u64 = 120;

async fn handle_timeout(err: BoxError) -> crate::error::ApiError {
    if err.is::<tower::timeout::error::Elapsed>() {
        crate::error::ApiError::new(
            crate::error::ErrorCode::ServiceUnavailable,
            "request deadline exceeded",
            "Retry the request; submit and poll endpoints return quickly.",
        )
    } else {
        crate::error::ApiError::internal(err.to_string())
    }
}
