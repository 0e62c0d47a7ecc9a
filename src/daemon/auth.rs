// src/daemon/auth.rs

//! Bearer token authentication
//!
//! Every `/v1` handler takes an [`AdminAuth`] argument; the extractor
//! rejects the request with 401 before the body is read. An empty
//! configured token disables the check (only allowed on loopback binds).

use super::routes::{ApiError, SharedState};
use super::DaemonError;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::HeaderMap, header::AUTHORIZATION, request::Parts},
};

/// Proof that the request carried the admin token
#[derive(Debug, Clone, Copy)]
pub struct AdminAuth;

#[async_trait]
impl FromRequestParts<SharedState> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        verify_bearer(&parts.headers, &state.admin_token)
    }
}

/// Check `Authorization: Bearer <token>` against `expected`
pub fn verify_bearer(headers: &HeaderMap, expected: &str) -> Result<AdminAuth, ApiError> {
    if expected.is_empty() {
        return Ok(AdminAuth);
    }

    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match provided {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(AdminAuth),
        Some(_) => {
            tracing::warn!("Rejected request with invalid admin token");
            Err(ApiError(DaemonError::unauthorized("invalid admin token")))
        }
        None => {
            tracing::warn!("Rejected request without bearer token");
            Err(ApiError(DaemonError::unauthorized("missing bearer token")))
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
