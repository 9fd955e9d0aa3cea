// BSD 3-Clause License
// Copyright (c) 2025, NØNOS - NOXRUN
//
//! Bearer-token middleware for the two API surfaces plus request-id
//! propagation.
//!
//! The external surface and the internal callback surface share a process
//! but authenticate with different tokens; internal paths never reveal the
//! existence of other sessions across that boundary.

use async_trait::async_trait;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use super::AppState;
use crate::error::ApiError;

/// Per-request correlation id, generated at ingress and echoed in the
/// `x-request-id` response header and every error envelope.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestId>()
            .cloned()
            .ok_or_else(|| ApiError::internal("request id middleware missing"))
    }
}

pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 64)
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(request_id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Constant-time over equal-length inputs.
fn token_matches(presented: &str, expected: &str) -> bool {
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// External `/api/v1` surface.
pub async fn external_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = bearer_token(&request)
        .map(|token| token_matches(token, &state.config.security.api_token))
        .unwrap_or(false);
    if authorized {
        next.run(request).await
    } else {
        unauthorized(&request)
    }
}

/// Internal `/internal` callback surface (separate shared secret).
pub async fn internal_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = bearer_token(&request)
        .map(|token| token_matches(token, &state.config.security.internal_token))
        .unwrap_or(false);
    if authorized {
        next.run(request).await
    } else {
        unauthorized(&request)
    }
}

fn unauthorized(request: &Request) -> Response {
    let headers = request.headers();
    let client_ip = crate::security::extract_client_ip(
        headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()),
        headers.get("x-real-ip").and_then(|v| v.to_str().ok()),
        None,
    );
    tracing::warn!(
        path = request.uri().path(),
        client_ip = client_ip.as_deref().unwrap_or("unknown"),
        "rejected request with missing or invalid bearer token"
    );

    let mut err = ApiError::unauthorized();
    if let Some(RequestId(rid)) = request.extensions().get::<RequestId>() {
        err = err.with_request_id(rid);
    }
    err.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_matches() {
        assert!(token_matches("secret-token", "secret-token"));
        assert!(!token_matches("secret-token", "secret-tokeN"));
        assert!(!token_matches("short", "secret-token"));
        assert!(!token_matches("", "secret-token"));
    }
}
