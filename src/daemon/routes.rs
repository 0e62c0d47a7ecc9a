// src/daemon/routes.rs

//! Axum router configuration for mailsmithd
//!
//! Defines all HTTP routes for the daemon REST API:
//! - `/health` - Health check endpoint (no auth)
//! - `/v1/services/enable` - Enable or disable allow-listed services
//! - `/v1/webmail/setup` - Install and wire up webmail
//! - `/v1/webmail/status` - Webmail installation state
//! - `/v1/dns/forward` - Local resolver with upstream forwarding

use crate::daemon::{AdminAuth, DaemonError, DaemonState};
use crate::session::{
    DnsForwardRequest, DnsForwardResponse, ServiceEnableRequest, ServiceEnableResponse,
    WebmailSetupRequest, WebmailSetupResponse, WebmailStatus,
};
use axum::{
    Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared daemon state type
pub type SharedState = Arc<DaemonState>;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub pid: u32,
    pub uptime_secs: u64,
}

/// Error response wrapper for RFC 7807 format
pub struct ApiError(pub DaemonError);

impl From<DaemonError> for ApiError {
    fn from(err: DaemonError) -> Self {
        ApiError(err)
    }
}

impl From<crate::Error> for ApiError {
    fn from(err: crate::Error) -> Self {
        ApiError(DaemonError::from(err))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(DaemonError::bad_request(&rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = Json(&self.0);

        (
            status,
            [("content-type", "application/problem+json")],
            body,
        )
            .into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

/// Build the main router with all routes
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        // Health check (no auth required)
        .route("/health", get(health_handler))
        .nest("/v1", build_v1_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn build_v1_router() -> Router<SharedState> {
    Router::new()
        .route("/services/enable", post(services_enable_handler))
        .route("/webmail/setup", post(webmail_setup_handler))
        .route("/webmail/status", get(webmail_status_handler))
        .route("/dns/forward", post(dns_forward_handler))
}

/// Run a provisioning call on the blocking pool
///
/// Sessions shell out and sleep on locks; none of that may run on the
/// async workers.
async fn run_blocking<T, F>(state: &SharedState, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&crate::Provisioner) -> crate::Result<T> + Send + 'static,
{
    let provisioner = state.provisioner.clone();
    tokio::task::spawn_blocking(move || f(&provisioner))
        .await
        .map_err(|e| ApiError(DaemonError::internal(&format!("Task join error: {}", e))))?
        .map_err(ApiError::from)
}

// =============================================================================
// Health
// =============================================================================

/// Health check endpoint
///
/// GET /health
///
/// Returns basic health status. No authentication required.
async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        pid: std::process::id(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

// =============================================================================
// Services
// =============================================================================

/// Enable or disable services
///
/// POST /v1/services/enable
///
/// Body: `{"services": {"nginx": true, "apache2": false}}`. Unknown names
/// fail the whole request with 400 before anything runs; per-service
/// failures are reported in the results with a 200.
async fn services_enable_handler(
    _auth: AdminAuth,
    State(state): State<SharedState>,
    payload: Result<Json<ServiceEnableRequest>, JsonRejection>,
) -> ApiResult<Json<ServiceEnableResponse>> {
    let Json(request) = payload?;
    let response = run_blocking(&state, move |p| p.enable_services(&request)).await?;
    Ok(Json(response))
}

// =============================================================================
// Webmail
// =============================================================================

/// Install and configure webmail
///
/// POST /v1/webmail/setup
async fn webmail_setup_handler(
    _auth: AdminAuth,
    State(state): State<SharedState>,
    payload: Result<Json<WebmailSetupRequest>, JsonRejection>,
) -> ApiResult<Json<WebmailSetupResponse>> {
    let Json(request) = payload?;
    let response = run_blocking(&state, move |p| p.setup_webmail(&request)).await?;
    Ok(Json(response))
}

/// Webmail installation state
///
/// GET /v1/webmail/status
async fn webmail_status_handler(
    _auth: AdminAuth,
    State(state): State<SharedState>,
) -> ApiResult<Json<WebmailStatus>> {
    let status = run_blocking(&state, |p| Ok(p.webmail_status())).await?;
    Ok(Json(status))
}

// =============================================================================
// DNS
// =============================================================================

/// Configure the local forwarding resolver
///
/// POST /v1/dns/forward
async fn dns_forward_handler(
    _auth: AdminAuth,
    State(state): State<SharedState>,
    payload: Result<Json<DnsForwardRequest>, JsonRejection>,
) -> ApiResult<Json<DnsForwardResponse>> {
    let Json(request) = payload?;
    let response = run_blocking(&state, move |p| p.setup_dns_forward(&request)).await?;
    Ok(Json(response))
}
