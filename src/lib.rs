// src/lib.rs

//! Mailsmith provisioning engine
//!
//! Installs and wires up the optional services of a self-hosted mail server
//! (webmail, a local forwarding resolver, the mail daemons themselves) by
//! shelling out to the host's package manager, init system and service
//! tools.
//!
//! # Architecture
//!
//! - Sessions: one request, one lock, one ordered phase list
//! - Phases: each external mutation paired with its inverse; a failure
//!   unwinds every applied phase in reverse order
//! - Idempotency: every session checks whether its goal is already met on
//!   the host before touching anything
//! - Allow-lists: commands run from absolute paths only, configuration is
//!   written only to an exact set of paths
//! - No state of its own: everything is re-derived from the host; sessions
//!   only append to an audit trail

pub mod audit;
pub mod config;
pub mod config_writer;
#[cfg(feature = "daemon")]
pub mod daemon;
mod error;
pub mod lock;
pub mod packages;
pub mod phase;
pub mod probe;
pub mod runner;
pub mod secrets;
pub mod services;
pub mod session;
pub mod validate;

pub use audit::{AuditEntry, AuditLog, AuditOutcome};
pub use config::{Config, WebServer};
pub use error::{Error, Result};
pub use lock::{LockGuard, LockManager};
pub use phase::{Phase, PhaseExecutor, PhaseOutcome};
pub use runner::{CommandResult, CommandRunner, CommandSpec, SystemRunner, Timeouts};
pub use session::{
    DnsForwardRequest, DnsForwardResponse, Provisioner, ServiceEnableRequest,
    ServiceEnableResponse, ServiceOutcome, SessionKind, WebmailSetupRequest, WebmailSetupResponse,
    WebmailState, WebmailStatus,
};
