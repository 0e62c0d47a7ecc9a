// src/daemon/mod.rs

//! mailsmithd HTTP API
//!
//! Thin JSON surface over the provisioning sessions. Every session runs
//! synchronously on a blocking worker thread; the async side only parses
//! requests, checks the bearer token and maps results to responses.
//!
//! ```text
//! client                         mailsmithd
//!   │                                │
//!   ├─ POST /v1/webmail/setup ──────►│ spawn_blocking
//!   │                                │   lock ─ guard ─ phases ─ release
//!   │◄──────── 200 / 400 / 409 / 500 ┤
//! ```
//!
//! # Module Structure
//!
//! - `routes` - router, handlers and the problem+json error wrapper
//! - `auth` - bearer token extractor

pub mod auth;
pub mod routes;

use crate::config::Config;
use crate::session::Provisioner;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub use auth::AdminAuth;
pub use routes::{ApiError, ApiResult, SharedState, build_router};

/// Error response format (RFC 7807)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonError {
    /// Error type URI
    #[serde(rename = "type")]
    pub error_type: String,
    /// Human-readable title
    pub title: String,
    /// HTTP status code
    pub status: u16,
    /// Detailed description
    pub detail: String,
    /// Additional error-specific data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Value>,
}

impl DaemonError {
    /// Create a new daemon error
    pub fn new(error_type: &str, title: &str, status: u16, detail: &str) -> Self {
        Self {
            error_type: format!("urn:mailsmith:error:{}", error_type),
            title: title.to_string(),
            status,
            detail: detail.to_string(),
            extensions: None,
        }
    }

    /// Conflict error
    pub fn conflict(detail: &str) -> Self {
        Self::new("conflict", "Conflict", 409, detail)
    }

    /// Internal error
    pub fn internal(detail: &str) -> Self {
        Self::new("internal", "Internal Error", 500, detail)
    }

    /// Bad request error
    pub fn bad_request(detail: &str) -> Self {
        Self::new("bad_request", "Bad Request", 400, detail)
    }

    /// Unauthorized error
    pub fn unauthorized(detail: &str) -> Self {
        Self::new("unauthorized", "Unauthorized", 401, detail)
    }

    /// A phase failed; rollback has already run
    pub fn phase_failed(phase: &str, detail: &str) -> Self {
        Self::new(
            "phase_failed",
            "Provisioning Failed",
            500,
            &format!("phase '{}' failed: {}", phase, detail),
        )
        .with_extensions(serde_json::json!({ "phase": phase }))
    }

    /// Add extensions
    pub fn with_extensions(mut self, extensions: serde_json::Value) -> Self {
        self.extensions = Some(extensions);
        self
    }
}

impl From<Error> for DaemonError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(detail) => DaemonError::bad_request(&detail),
            Error::Conflict(detail) => DaemonError::conflict(&detail),
            Error::PhaseFailed { phase, detail } => DaemonError::phase_failed(&phase, &detail),
            other => DaemonError::new(other.kind(), "Internal Error", 500, &other.to_string()),
        }
    }
}

/// Daemon state (shared across handlers)
pub struct DaemonState {
    pub provisioner: Provisioner,
    /// Empty disables authentication (loopback binds only)
    pub admin_token: String,
    pub started_at: Instant,
}

impl DaemonState {
    pub fn new(provisioner: Provisioner, admin_token: impl Into<String>) -> Self {
        Self {
            provisioner,
            admin_token: admin_token.into(),
            started_at: Instant::now(),
        }
    }
}

/// Run the daemon until SIGINT/SIGTERM
pub async fn run_daemon(config: Config) -> Result<()> {
    info!("Starting mailsmithd version {}", env!("CARGO_PKG_VERSION"));

    let addr = config.bind_addr()?;
    let admin_token = config.server.admin_token.clone();
    if admin_token.is_empty() {
        warn!("No admin token configured; API on {} is unauthenticated", addr);
    }

    let provisioner = Provisioner::from_config(config)?;
    let state = Arc::new(DaemonState::new(provisioner, admin_token));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Daemon ready, listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Daemon shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
