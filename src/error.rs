// src/error.rs

//! Error types for mailsmith
//!
//! The taxonomy follows how a request can fail:
//! - `Validation` - malformed or disallowed input, nothing was attempted
//! - `Conflict` - lock held or target already provisioned, nothing was attempted
//! - `PhaseFailed` - an external mutation failed, rollback has already run
//!
//! Everything else (`Command`, `Io`, `Config`, `Json`) is plumbing that either
//! surfaces inside a phase failure or aborts startup.

use thiserror::Error;

/// Result type for mailsmith operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the provisioning engine
#[derive(Error, Debug)]
pub enum Error {
    /// Input rejected before any external mutation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Lock held by another session or target already provisioned
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A phase failed and the session was unwound
    #[error("Phase '{phase}' failed: {detail}")]
    PhaseFailed { phase: String, detail: String },

    /// External command exited non-zero or timed out
    #[error("Command {program} failed: {detail}")]
    Command { program: String, detail: String },

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Machine-readable error kind used in API responses
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Conflict(_) => "conflict",
            Error::PhaseFailed { .. } => "phase_failed",
            Error::Command { .. } => "command",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_failed_display_names_phase() {
        let err = Error::PhaseFailed {
            phase: "test-webserver-config".to_string(),
            detail: "nginx: [emerg] unexpected \"}\"".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("test-webserver-config"));
        assert!(msg.contains("unexpected"));
        assert_eq!(err.kind(), "phase_failed");
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert_eq!(err.kind(), "io");
    }
}
