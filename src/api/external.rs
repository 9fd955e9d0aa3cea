// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! External `/api/v1` surface: sessions, executions, files, templates,
//! containers, plus the unauthenticated health/metrics endpoints.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use serde_json::json;
use tracing::{info, warn};

use super::auth::RequestId;
use super::types::*;
use super::AppState;
use crate::db::sessions::SessionMode;
use crate::db;
use crate::error::ApiError;
use crate::executions::SubmitParams;
use crate::ids;
use crate::security;
use crate::sessions::CreateSessionParams;

type ApiResult<T> = Result<T, ApiError>;

// ---- Sessions ------------------------------------------------------------

pub async fn create_session(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Json(body): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<SessionResponse>)> {
    let mode = match body.mode.as_deref() {
        None => SessionMode::Ephemeral,
        Some(m) => SessionMode::parse(m).ok_or_else(|| {
            ApiError::invalid_parameter(format!("unknown mode '{}'", m)).with_request_id(&rid)
        })?,
    };

    let resources = body.resources.unwrap_or(ResourcesDto { cpu: None, memory: None, disk: None });
    let params = CreateSessionParams {
        template_id: body.template_id,
        cpu: resources.cpu,
        memory: resources.memory,
        disk: resources.disk,
        env: body.env,
        timeout_sec: body.timeout,
        mode,
        agent_id: body.agent_id,
        dependencies: body.dependencies,
    };

    let record = state
        .sessions
        .create(params)
        .await
        .map_err(|e| e.with_request_id(&rid))?;

    Ok((StatusCode::CREATED, Json(record.into())))
}

pub async fn get_session(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionResponse>> {
    let record = state
        .sessions
        .get(&session_id)
        .await
        .map_err(|e| e.with_request_id(&rid))?;
    state.sessions.touch(&session_id).await;
    Ok(Json(record.into()))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let (limit, offset) = page.clamped();
    let sessions = state
        .sessions
        .list(page.status.as_deref(), page.template_id.as_deref(), limit, offset)
        .await
        .map_err(|e| e.with_request_id(&rid))?;

    let items: Vec<SessionResponse> = sessions.into_iter().map(Into::into).collect();
    Ok(Json(json!({
        "sessions": items,
        "count": items.len(),
        "limit": limit,
        "offset": offset,
    })))
}

pub async fn terminate_session(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionResponse>> {
    let record = state
        .sessions
        .terminate(&session_id)
        .await
        .map_err(|e| e.with_request_id(&rid))?;
    Ok(Json(record.into()))
}

// ---- Executions ----------------------------------------------------------

pub async fn submit_execution(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(session_id): Path<String>,
    Json(body): Json<SubmitParams>,
) -> ApiResult<(StatusCode, Json<ExecuteResponse>)> {
    let record = state
        .engine
        .submit(&session_id, body)
        .await
        .map_err(|e| e.with_request_id(&rid))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ExecuteResponse { execution_id: record.id, status: "submitted" }),
    ))
}

pub async fn execution_status(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<ExecutionStatusResponse>> {
    let record = state
        .engine
        .get(&execution_id)
        .await
        .map_err(|e| e.with_request_id(&rid))?;
    Ok(Json((&record).into()))
}

pub async fn execution_result(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<ExecutionResultResponse>> {
    let record = state
        .engine
        .get(&execution_id)
        .await
        .map_err(|e| e.with_request_id(&rid))?;
    let artifacts = db::artifacts::list_for_execution(state.engine.db(), &execution_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid))?;
    Ok(Json(ExecutionResultResponse::from_record(record, artifacts)))
}

pub async fn cancel_execution(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<ExecutionStatusResponse>> {
    let record = state
        .engine
        .cancel(&execution_id)
        .await
        .map_err(|e| e.with_request_id(&rid))?;
    Ok(Json((&record).into()))
}

pub async fn list_session_executions(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(session_id): Path<String>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<serde_json::Value>> {
    // Surface a clean 404 for unknown sessions instead of an empty list.
    state
        .sessions
        .get(&session_id)
        .await
        .map_err(|e| e.with_request_id(&rid))?;

    let (limit, offset) = page.clamped();
    let executions = state
        .engine
        .list_for_session(&session_id, page.status.as_deref(), limit, offset)
        .await
        .map_err(|e| e.with_request_id(&rid))?;

    let items: Vec<ExecutionStatusResponse> = executions.iter().map(Into::into).collect();
    Ok(Json(json!({
        "session_id": session_id,
        "executions": items,
        "count": items.len(),
        "limit": limit,
        "offset": offset,
    })))
}

// ---- Workspace files -----------------------------------------------------

pub async fn upload_file(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(session_id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let session = state
        .sessions
        .get(&session_id)
        .await
        .map_err(|e| e.with_request_id(&rid))?;

    let mut target_path: Option<String> = None;
    let mut stored: Option<(String, usize)> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError::invalid_parameter(format!("malformed multipart body: {}", e)).with_request_id(&rid)
    })? {
        let field_name = field.name().map(String::from);
        match field_name.as_deref() {
            Some("path") => {
                let text = field.text().await.map_err(|e| {
                    ApiError::invalid_parameter(format!("unreadable path field: {}", e))
                        .with_request_id(&rid)
                })?;
                target_path = Some(text);
            }
            Some("file") | None => {
                let path = target_path
                    .clone()
                    .or_else(|| field.file_name().map(String::from))
                    .ok_or_else(|| {
                        ApiError::invalid_parameter("upload needs a path field or a file name")
                            .with_request_id(&rid)
                    })?;
                security::validate_workspace_path(&path)
                    .map_err(|r| ApiError::invalid_parameter(r.reason).with_request_id(&rid))?;

                let content_type = field.content_type().map(String::from);
                let data = field.bytes().await.map_err(|e| {
                    ApiError::invalid_parameter(format!("upload body unreadable: {}", e))
                        .with_request_id(&rid)
                })?;
                if data.len() > state.config.security.max_upload_bytes {
                    return Err(ApiError::invalid_parameter(format!(
                        "upload exceeds the {} byte limit",
                        state.config.security.max_upload_bytes
                    ))
                    .with_request_id(&rid));
                }

                let key = state.store.object_key(&session.id, &path);
                let size = data.len();
                state
                    .store
                    .put(&key, data, content_type.as_deref())
                    .await
                    .map_err(|e| {
                        ApiError::backend_unavailable("object store", e.to_string())
                            .with_request_id(&rid)
                    })?;
                stored = Some((path, size));
            }
            Some(other) => {
                warn!("Ignoring unknown multipart field '{}'", other);
            }
        }
    }

    let (path, size) = stored.ok_or_else(|| {
        ApiError::invalid_parameter("multipart body carried no file").with_request_id(&rid)
    })?;
    state.sessions.touch(&session_id).await;
    info!("Stored {} bytes at {} for session {}", size, path, session_id);

    Ok((
        StatusCode::CREATED,
        Json(json!({ "session_id": session_id, "path": path, "size_bytes": size })),
    ))
}

pub async fn download_file(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path((session_id, path)): Path<(String, String)>,
) -> ApiResult<Response> {
    let session = state
        .sessions
        .get(&session_id)
        .await
        .map_err(|e| e.with_request_id(&rid))?;
    security::validate_workspace_path(&path)
        .map_err(|r| ApiError::invalid_parameter(r.reason).with_request_id(&rid))?;

    let key = state.store.object_key(&session.id, &path);
    let size = state
        .store
        .size_of(&key)
        .await
        .map_err(|e| ApiError::backend_unavailable("object store", e.to_string()).with_request_id(&rid))?
        .ok_or_else(|| ApiError::not_found("file", &path).with_request_id(&rid))?;

    state.sessions.touch(&session_id).await;

    // Small files stream inline; larger ones redirect to a presigned URL.
    if size <= state.config.security.inline_download_limit_bytes as i64 {
        let data = state
            .store
            .get(&key)
            .await
            .map_err(|e| {
                ApiError::backend_unavailable("object store", e.to_string()).with_request_id(&rid)
            })?
            .ok_or_else(|| ApiError::not_found("file", &path).with_request_id(&rid))?;
        Ok(([("content-type", "application/octet-stream")], data).into_response())
    } else {
        let url = state.store.presign_get(&key).await.map_err(|e| {
            ApiError::backend_unavailable("object store", e.to_string()).with_request_id(&rid)
        })?;
        Ok(Redirect::temporary(&url).into_response())
    }
}

// ---- Templates -----------------------------------------------------------

pub async fn create_template(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Json(body): Json<CreateTemplateRequest>,
) -> ApiResult<(StatusCode, Json<TemplateResponse>)> {
    if body.name.is_empty() || body.name.len() > 128 {
        return Err(ApiError::invalid_parameter("template name must be 1-128 characters")
            .with_request_id(&rid));
    }
    if !security::validate_image_name(&body.image) {
        return Err(ApiError::invalid_parameter("invalid image reference").with_request_id(&rid));
    }
    for pkg in &body.preinstalled_packages {
        security::validate_package_name(pkg)
            .map_err(|r| ApiError::invalid_parameter(r.reason).with_request_id(&rid))?;
    }

    if db::templates::get_by_name(&state.db, &body.name)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid))?
        .is_some()
    {
        return Err(ApiError::state_conflict(
            format!("template '{}' already exists", body.name),
            "Template names are unique; update the existing template instead.",
        )
        .with_request_id(&rid));
    }

    let id = ids::new_template_id();
    let packages = json!(body.preinstalled_packages);
    let record = db::templates::create(
        &state.db,
        db::templates::NewTemplate {
            id: &id,
            name: &body.name,
            image: &body.image,
            runtime_type: &body.runtime_type,
            default_cpu: body.default_cpu.as_deref().unwrap_or("1"),
            default_memory: body.default_memory.as_deref().unwrap_or("512Mi"),
            default_disk: body.default_disk.as_deref().unwrap_or("1Gi"),
            default_timeout_sec: body.default_timeout_sec.unwrap_or(1800),
            preinstalled_packages: &packages,
        },
    )
    .await
    .map_err(|e| ApiError::from(e).with_request_id(&rid))?;

    Ok((StatusCode::CREATED, Json(record.into())))
}

pub async fn list_templates(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
) -> ApiResult<Json<serde_json::Value>> {
    let templates = db::templates::list(&state.db, false)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid))?;
    let items: Vec<TemplateResponse> = templates.into_iter().map(Into::into).collect();
    Ok(Json(json!({ "templates": items, "count": items.len() })))
}

pub async fn get_template(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(template_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !ids::is_template_id(&template_id) {
        return Err(ApiError::invalid_parameter(format!("'{}' is not a template id", template_id))
            .with_request_id(&rid));
    }
    let record = db::templates::get_by_id(&state.db, &template_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid))?
        .ok_or_else(|| ApiError::not_found("template", &template_id).with_request_id(&rid))?;

    let live_sessions = db::sessions::count_referencing_template(&state.db, &template_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid))?;

    let response: TemplateResponse = record.into();
    Ok(Json(json!({
        "template": response,
        "live_sessions": live_sessions,
        "warm_pool_size": state.pool.size(&template_id),
    })))
}

pub async fn update_template(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(template_id): Path<String>,
    Json(body): Json<UpdateTemplateRequest>,
) -> ApiResult<Json<TemplateResponse>> {
    if let Some(image) = &body.image {
        if !security::validate_image_name(image) {
            return Err(ApiError::invalid_parameter("invalid image reference").with_request_id(&rid));
        }
    }
    if let Some(packages) = &body.preinstalled_packages {
        for pkg in packages {
            security::validate_package_name(pkg)
                .map_err(|r| ApiError::invalid_parameter(r.reason).with_request_id(&rid))?;
        }
    }

    let packages = body.preinstalled_packages.as_ref().map(|p| json!(p));
    let updated = db::templates::update(
        &state.db,
        &template_id,
        db::templates::TemplateUpdate {
            image: body.image.as_deref(),
            default_cpu: body.default_cpu.as_deref(),
            default_memory: body.default_memory.as_deref(),
            default_disk: body.default_disk.as_deref(),
            default_timeout_sec: body.default_timeout_sec,
            preinstalled_packages: packages.as_ref(),
            active: body.active,
        },
    )
    .await
    .map_err(|e| ApiError::from(e).with_request_id(&rid))?;

    if !updated {
        return Err(ApiError::not_found("template", &template_id).with_request_id(&rid));
    }
    state.template_cache.invalidate(&template_id);

    // An image change makes existing warm containers stale; drain them and
    // let the replenisher rebuild the bucket from the new image.
    if body.image.is_some() {
        let stale = state.pool.drain(&template_id);
        if !stale.is_empty() {
            info!("Draining {} stale warm containers for {}", stale.len(), template_id);
            let runtime = state.runtime.clone();
            let db = state.db.clone();
            tokio::spawn(async move {
                for container in stale {
                    let _ = runtime.destroy_container(&container.container_id).await;
                    if let Some(node_id) = container.node_id {
                        let _ = db::nodes::release(
                            &db,
                            &node_id,
                            container.cpu_millis,
                            container.memory_mb,
                        )
                        .await;
                    }
                }
            });
        }
    }

    let record = db::templates::get_required(&state.db, &template_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid))?;
    Ok(Json(record.into()))
}

pub async fn delete_template(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(template_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let referencing = db::sessions::count_referencing_template(&state.db, &template_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid))?;
    if referencing > 0 {
        return Err(ApiError::state_conflict(
            format!(
                "template {} is referenced by {} non-terminal sessions",
                template_id, referencing
            ),
            "Deprecate the template (active=false) and retry once its sessions have ended.",
        )
        .with_request_id(&rid));
    }

    // Unclaimed warm containers for the template are torn down off-path.
    let warm = state.pool.drain(&template_id);
    if !warm.is_empty() {
        let runtime = state.runtime.clone();
        let db = state.db.clone();
        tokio::spawn(async move {
            for container in warm {
                let _ = runtime.destroy_container(&container.container_id).await;
                if let Some(node_id) = container.node_id {
                    let _ = db::nodes::release(
                        &db,
                        &node_id,
                        container.cpu_millis,
                        container.memory_mb,
                    )
                    .await;
                }
            }
        });
    }

    let deleted = db::templates::delete(&state.db, &template_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid))?;
    if !deleted {
        return Err(ApiError::not_found("template", &template_id).with_request_id(&rid));
    }
    state.template_cache.invalidate(&template_id);
    info!("Template {} deleted", template_id);
    Ok(Json(json!({ "template_id": template_id, "status": "deleted" })))
}

// ---- Containers ----------------------------------------------------------

pub async fn list_containers(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let (limit, offset) = page.clamped();
    let containers = db::containers::list(&state.db, page.session_id.as_deref(), limit, offset)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid))?;
    let items: Vec<ContainerResponse> = containers.into_iter().map(Into::into).collect();
    Ok(Json(json!({ "containers": items, "count": items.len() })))
}

pub async fn get_container(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(container_id): Path<String>,
) -> ApiResult<Json<ContainerResponse>> {
    let record = db::containers::get_by_id(&state.db, &container_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid))?
        .ok_or_else(|| ApiError::not_found("container", &container_id).with_request_id(&rid))?;
    Ok(Json(record.into()))
}

#[derive(Debug, serde::Deserialize)]
pub struct LogParamsDto {
    pub tail: Option<i64>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn container_logs(
    State(state): State<AppState>,
    RequestId(rid): RequestId,
    Path(container_id): Path<String>,
    Query(params): Query<LogParamsDto>,
) -> ApiResult<Json<serde_json::Value>> {
    // The row must exist before we touch the runtime, so 404s stay typed.
    db::containers::get_by_id(&state.db, &container_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid))?
        .ok_or_else(|| ApiError::not_found("container", &container_id).with_request_id(&rid))?;

    let tail = params.tail.unwrap_or(100).clamp(1, 10_000);
    let logs = state
        .runtime
        .container_logs(&container_id, tail, params.since)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&rid))?;

    Ok(Json(json!({ "container_id": container_id, "logs": logs })))
}

// ---- Health & metrics ----------------------------------------------------

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = db::ping(&state.db).await;
    let store_ok = state.store.healthy().await;
    let runtime_ok = state.runtime.ping().await;

    let status = if db_ok && store_ok && runtime_ok {
        "healthy"
    } else if db_ok {
        "degraded"
    } else {
        "unhealthy"
    };

    let code = if db_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        code,
        Json(json!({
            "status": status,
            "service": "noxrun-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "build_time": env!("BUILD_TIME"),
            "git_hash": env!("GIT_HASH"),
            "components": {
                "database": db_ok,
                "object_store": store_ok,
                "container_runtime": runtime_ok,
            },
            "timestamp": chrono::Utc::now(),
        })),
    )
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let text = state.metrics.render(&state.pool.sizes());
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        text,
    )
}
