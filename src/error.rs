// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! NOXRUN error taxonomy and the structured error envelope.
//!
//! Services return `ApiError`; it is translated into HTTP exactly once, in
//! `IntoResponse`. Every envelope carries a `solution` string suitable for
//! agent-facing display and the request id for correlation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Wire-level error codes, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidParameter,
    NotFound,
    StateConflict,
    TooManyRequests,
    Unauthorized,
    ServiceUnavailable,
    InternalError,
}

impl ErrorCode {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorCode::InvalidParameter => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::StateConflict => StatusCode::CONFLICT,
            ErrorCode::TooManyRequests => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The envelope every error response serializes to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error_code: ErrorCode,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub solution: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{code:?}: {description}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub description: String,
    pub detail: Option<String>,
    pub solution: String,
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, description: impl Into<String>, solution: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            detail: None,
            solution: solution.into(),
            request_id: None,
        }
    }

    pub fn invalid_parameter(description: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InvalidParameter,
            description,
            "Correct the highlighted parameter and retry the request.",
        )
    }

    pub fn not_found(entity: &str, id: &str) -> Self {
        Self::new(
            ErrorCode::NotFound,
            format!("{} '{}' does not exist", entity, id),
            format!(
                "Verify the {} id; it may have been cleaned up after its retention window.",
                entity
            ),
        )
    }

    pub fn state_conflict(description: impl Into<String>, solution: impl Into<String>) -> Self {
        Self::new(ErrorCode::StateConflict, description, solution)
    }

    pub fn capacity_exhausted(description: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::TooManyRequests,
            description,
            "All runtime nodes are at capacity. Retry with backoff or release idle sessions.",
        )
    }

    pub fn unauthorized() -> Self {
        Self::new(
            ErrorCode::Unauthorized,
            "Missing or invalid bearer token",
            "Supply a valid Authorization: Bearer token for this surface.",
        )
    }

    pub fn backend_unavailable(backend: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ServiceUnavailable,
            format!("{} backend is unavailable", backend),
            "The platform is degraded; retry shortly. Reads may be served from cache.",
        )
        .with_detail(detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InternalError,
            "Internal error",
            "Retry the request; if the problem persists, report the request_id.",
        )
        .with_detail(detail)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_solution(mut self, solution: impl Into<String>) -> Self {
        self.solution = solution.into();
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error_code: self.code,
            description: self.description.clone(),
            error_detail: self.detail.clone(),
            solution: self.solution.clone(),
            request_id: self.request_id.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.code == ErrorCode::InternalError {
            tracing::error!(
                request_id = self.request_id.as_deref().unwrap_or("-"),
                detail = self.detail.as_deref().unwrap_or("-"),
                "internal error surfaced to client"
            );
        }
        (self.code.status(), Json(self.envelope())).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => ApiError::not_found("record", "unknown"),
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                ApiError::backend_unavailable("database", e.to_string())
            }
            other => ApiError::internal(format!("database error: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorCode::InvalidParameter.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::StateConflict.status(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::TooManyRequests.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorCode::InternalError.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_envelope_carries_solution_and_request_id() {
        let err = ApiError::not_found("session", "sess_abc")
            .with_request_id("req-1");
        let env = err.envelope();
        assert_eq!(env.error_code, ErrorCode::NotFound);
        assert!(env.solution.contains("session id"));
        assert_eq!(env.request_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn test_detail_omitted_when_absent() {
        let env = ApiError::invalid_parameter("bad timeout").envelope();
        let json = serde_json::to_value(&env).unwrap();
        assert!(json.get("error_detail").is_none());
        assert!(json.get("request_id").is_none());
        assert_eq!(json["error_code"], "InvalidParameter");
    }

    #[test]
    fn test_capacity_maps_to_503() {
        let err = ApiError::capacity_exhausted("no schedulable node");
        assert_eq!(err.code.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_sqlx_error_mapping() {
        let err: ApiError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code, ErrorCode::NotFound);

        let err: ApiError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.code, ErrorCode::ServiceUnavailable);

        let err: ApiError = sqlx::Error::ColumnNotFound("x".into()).into();
        assert_eq!(err.code, ErrorCode::InternalError);
    }

    #[test]
    fn test_solution_is_overridable() {
        let err = ApiError::state_conflict("busy", "wait for it").with_solution("deprecate first");
        assert_eq!(err.solution, "deprecate first");
    }
}
