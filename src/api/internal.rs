// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Internal `/internal` callback surface, shared-secret authenticated.
//!
//! These endpoints are driven by in-container executors and runtime nodes;
//! they complete the session state machine (container_ready/exited) and
//! feed the execution engine (result/status/heartbeat/artifacts).

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::json;
use tracing::info;

use super::auth::RequestId;
use super::types::*;
use super::AppState;
use crate::db::executions::IngestOutcome;
use crate::db;
use crate::error::ApiError;
use crate::ids;

type ApiResult<T> = Result<T, ApiError>;

/// Terminal result ingestion, idempotent via the `Idempotency-Key` header.
/// First arrival answers 201; identical replays answer 200 with the stored
/// row; conflicting replays answer 409.
pub async fn execution_result(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(execution_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<crate::executions::ResultPayload>,
) -> ApiResult<(StatusCode, Json<ExecutionResultResponse>)> {
    let key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::invalid_parameter("Idempotency-Key header is required")
                .with_request_id(&rid)
        })?
        .to_string();

    let (outcome, stored) = state
        .engine
        .ingest_result(&execution_id, &key, body)
        .await
        .map_err(|e| e.with_request_id(&rid))?;

    let artifacts = db::artifacts::list_for_execution(state.engine.db(), &execution_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid))?;

    let code = match outcome {
        IngestOutcome::Inserted => StatusCode::CREATED,
        IngestOutcome::Replayed => StatusCode::OK,
        // Mismatch is surfaced as an error before we get here.
        IngestOutcome::Mismatch => StatusCode::CONFLICT,
    };
    Ok((code, Json(ExecutionResultResponse::from_record(stored, artifacts))))
}

/// Non-terminal transitions: running, timeout, crashed.
pub async fn execution_status(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(execution_id): Path<String>,
    Json(body): Json<StatusCallbackRequest>,
) -> ApiResult<Json<ExecutionStatusResponse>> {
    let record = state
        .engine
        .status_callback(&execution_id, &body.status, body.detail.as_deref())
        .await
        .map_err(|e| e.with_request_id(&rid))?;
    Ok(Json((&record).into()))
}

pub async fn execution_heartbeat(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(execution_id): Path<String>,
    Json(body): Json<HeartbeatRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .engine
        .heartbeat(&execution_id, body.timestamp, body.progress.as_ref())
        .await
        .map_err(|e| e.with_request_id(&rid))?;
    Ok(Json(json!({ "execution_id": execution_id, "status": "ok" })))
}

/// Artifact metadata append (append-only).
pub async fn execution_artifacts(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(execution_id): Path<String>,
    Json(body): Json<ArtifactsRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let appended = state
        .engine
        .append_artifacts(&execution_id, &body.artifacts)
        .await
        .map_err(|e| e.with_request_id(&rid))?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "execution_id": execution_id, "appended": appended })),
    ))
}

/// The container's executor is up: creating -> running. Also dispatches any
/// executions that queued while the session had no live container.
pub async fn container_ready(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(session_id): Path<String>,
    Json(body): Json<ContainerReadyRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.executor_url.is_empty() || !body.executor_url.starts_with("http") {
        return Err(
            ApiError::invalid_parameter("executor_url must be an http(s) URL").with_request_id(&rid)
        );
    }

    state
        .sessions
        .on_container_ready(&session_id, &body.executor_url)
        .await
        .map_err(|e| e.with_request_id(&rid))?;

    // Crashed-then-retried executions waiting on a migration dispatch now.
    if let Err(e) = state.engine.dispatch_waiting(&session_id).await {
        tracing::warn!("Waiting-dispatch after ready failed for {}: {}", session_id, e);
    }

    Ok(Json(json!({ "session_id": session_id, "status": "ok" })))
}

pub async fn container_exited(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(session_id): Path<String>,
    Json(body): Json<ContainerExitedRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .sessions
        .on_container_exited(&session_id, body.exit_code, body.reason.as_deref())
        .await
        .map_err(|e| e.with_request_id(&rid))?;
    Ok(Json(json!({ "session_id": session_id, "status": "ok" })))
}

/// Runtime nodes self-register (and re-register on restart).
pub async fn register_node(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Json(body): Json<RegisterNodeRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    if body.hostname.is_empty() || body.endpoint.is_empty() {
        return Err(ApiError::invalid_parameter("hostname and endpoint are required")
            .with_request_id(&rid));
    }
    if body.total_cpu_millis <= 0 || body.total_memory_mb <= 0 {
        return Err(ApiError::invalid_parameter("node capacity must be positive")
            .with_request_id(&rid));
    }

    let cached = json!(body.cached_images);
    let record = db::nodes::register(
        &state.db,
        db::nodes::NewNode {
            id: &ids::new_node_id(),
            hostname: &body.hostname,
            runtime_type: &body.runtime_type,
            endpoint: &body.endpoint,
            total_cpu_millis: body.total_cpu_millis,
            total_memory_mb: body.total_memory_mb,
            max_containers: body.max_containers.unwrap_or(64),
            cached_images: &cached,
            labels: &body.labels,
        },
    )
    .await
    .map_err(|e| ApiError::from(e).with_request_id(&rid))?;

    info!("Node {} registered ({})", record.id, record.hostname);
    Ok((
        StatusCode::CREATED,
        Json(json!({ "node_id": record.id, "hostname": record.hostname, "status": record.status })),
    ))
}

pub async fn list_nodes(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
) -> ApiResult<Json<serde_json::Value>> {
    let nodes = db::nodes::list(&state.db)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid))?;
    Ok(Json(json!({ "nodes": nodes, "count": nodes.len() })))
}

#[derive(Debug, serde::Deserialize)]
pub struct NodeStatusRequest {
    pub status: String,
}

/// Operator transitions: draining, maintenance, back online.
pub async fn set_node_status(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(node_id): Path<String>,
    Json(body): Json<NodeStatusRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if !ids::is_node_id(&node_id) {
        return Err(ApiError::invalid_parameter(format!("'{}' is not a node id", node_id))
            .with_request_id(&rid));
    }
    let status = db::nodes::NodeStatus::parse(&body.status).ok_or_else(|| {
        ApiError::invalid_parameter(format!("unknown node status '{}'", body.status))
            .with_request_id(&rid)
    })?;

    let updated = db::nodes::set_status(&state.db, &node_id, status)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid))?;
    if !updated {
        return Err(ApiError::not_found("node", &node_id).with_request_id(&rid));
    }
    info!("Node {} moved to {}", node_id, status);
    Ok(Json(json!({ "node_id": node_id, "status": status })))
}

/// Remove a node from the registry. Refused while it still carries
/// containers; sessions that referenced it are detached.
pub async fn delete_node(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(node_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let node = db::nodes::get_by_id(&state.db, &node_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid))?
        .ok_or_else(|| ApiError::not_found("node", &node_id).with_request_id(&rid))?;

    if node.running_containers > 0 {
        return Err(ApiError::state_conflict(
            format!("node {} still runs {} containers", node_id, node.running_containers),
            "Drain the node first and wait for its containers to finish.",
        )
        .with_request_id(&rid));
    }

    let detached = db::sessions::detach_node(&state.db, &node_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid))?;
    db::nodes::delete(&state.db, &node_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid))?;

    info!("Node {} deleted ({} sessions detached)", node_id, detached);
    Ok(Json(json!({ "node_id": node_id, "status": "deleted", "sessions_detached": detached })))
}
