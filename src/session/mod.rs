// src/session/mod.rs

//! Provisioning sessions
//!
//! A session is one end-to-end provisioning request: validate the input,
//! take the session kind's lock, consult the idempotency guard, then run an
//! ordered phase list through the [`PhaseExecutor`]. Sessions live for a
//! single request and persist nothing; a crash mid-session is recovered by
//! the guard on the next invocation.
//!
//! ```text
//! request ──► validate ──► lock ──► guard ──► phases ──► release
//!                │           │        │          │
//!               400         409      409        500 (after unwind)
//! ```
//!
//! # Module Structure
//!
//! - `webmail` - Roundcube installation and web server wiring
//! - `service_enable` - enable/disable allow-listed services
//! - `dns_forward` - local unbound resolver forwarding upstream

pub mod dns_forward;
pub mod service_enable;
pub mod webmail;

pub use dns_forward::{DnsForwardRequest, DnsForwardResponse};
pub use service_enable::{ServiceEnableRequest, ServiceEnableResponse, ServiceOutcome};
pub use webmail::{WebmailSetupRequest, WebmailSetupResponse, WebmailState, WebmailStatus};

use crate::audit::AuditLog;
use crate::config::Config;
use crate::config_writer::ConfigWriter;
use crate::lock::{LockGuard, LockManager};
use crate::packages::PackageManager;
use crate::phase::{ExecutionReport, Phase, PhaseExecutor, PhaseFailure};
use crate::probe::{Completeness, SystemProbe};
use crate::runner::{CommandRunner, SystemRunner, Timeouts};
use crate::services::ServiceManager;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// What a session provisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    WebmailSetup,
    ServiceEnable,
    DnsForward,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::WebmailSetup => "webmail_setup",
            SessionKind::ServiceEnable => "service_enable",
            SessionKind::DnsForward => "dns_forward",
        }
    }

    /// Name of the lock serializing sessions of this kind
    pub fn lock_name(&self) -> &'static str {
        match self {
            SessionKind::WebmailSetup => "webmail-setup",
            SessionKind::ServiceEnable => "service-enable",
            SessionKind::DnsForward => "dns-forward",
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Running,
    Completed,
    /// A phase failed and at least one rollback step failed too
    Failed,
    /// A phase failed and every rollback step succeeded
    RolledBack,
}

/// One provisioning request
#[derive(Debug, Clone)]
pub struct ProvisioningSession {
    pub id: String,
    pub kind: SessionKind,
    /// Request parameters, for logs and diagnostics
    pub target: BTreeMap<String, String>,
    pub lock_name: &'static str,
    state: SessionState,
}

impl ProvisioningSession {
    pub fn new(kind: SessionKind, target: BTreeMap<String, String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            target,
            lock_name: kind.lock_name(),
            state: SessionState::Pending,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run `phases` against `ctx`, recording the resulting state in `audit`
    pub fn execute<'a, C>(
        &mut self,
        audit: &AuditLog,
        ctx: &mut C,
        phases: Vec<Phase<'a, C>>,
    ) -> std::result::Result<ExecutionReport, PhaseFailure> {
        self.begin();
        audit.session_started(self);
        let result = PhaseExecutor::new(phases).run(ctx);
        match &result {
            Ok(report) => audit.record_report(self, report),
            Err(failure) => audit.record_failure(self, failure),
        }
        self.finish(match &result {
            Ok(_) => SessionState::Completed,
            Err(failure) if failure.rollback_errors.is_empty() => SessionState::RolledBack,
            Err(_) => SessionState::Failed,
        });
        result
    }

    pub fn begin(&mut self) {
        info!("Session {} started for {:?}", self.id, self.target);
        self.state = SessionState::Running;
    }

    /// Record a terminal state for sessions that drive several phase chains
    pub fn finish(&mut self, state: SessionState) {
        self.state = state;
        match state {
            SessionState::Completed => info!("Session {} completed", self.id),
            SessionState::RolledBack => warn!("Session {} rolled back", self.id),
            SessionState::Failed => warn!("Session {} failed; rollback was incomplete", self.id),
            SessionState::Pending | SessionState::Running => {}
        }
    }
}

impl From<PhaseFailure> for Error {
    fn from(failure: PhaseFailure) -> Self {
        Error::PhaseFailed {
            phase: failure.phase.to_string(),
            detail: failure.error.message,
        }
    }
}

/// Audit entries kept in memory per provisioner
const AUDIT_HISTORY: usize = 10_000;

/// Everything a session needs to act on the host
///
/// Cheap to clone; the HTTP layer shares one instance across requests.
#[derive(Clone)]
pub struct Provisioner {
    config: Arc<Config>,
    runner: Arc<dyn CommandRunner>,
    timeouts: Timeouts,
    locks: LockManager,
    services: ServiceManager,
    packages: PackageManager,
    probe: SystemProbe,
    writer: ConfigWriter,
    audit: AuditLog,
}

impl Provisioner {
    /// Build a provisioner over an arbitrary command runner
    pub fn new(config: Config, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        config.validate()?;
        let timeouts = config.timeouts()?;
        let locks = LockManager::new(&config.paths.lock_dir);
        let audit = AuditLog::new(config.paths.audit_log.clone(), AUDIT_HISTORY);
        Ok(Self {
            services: ServiceManager::new(runner.clone(), timeouts),
            packages: PackageManager::new(runner.clone(), timeouts),
            probe: SystemProbe::new(runner.clone(), timeouts),
            writer: ConfigWriter::new(runner.clone(), timeouts),
            config: Arc::new(config),
            runner,
            timeouts,
            locks,
            audit,
        })
    }

    /// Build a provisioner that runs real commands on this host
    pub fn from_config(config: Config) -> Result<Self> {
        let runner = SystemRunner::new(config.commands.privilege_prefix.clone());
        Self::new(config, Arc::new(runner))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn probe(&self) -> &SystemProbe {
        &self.probe
    }

    pub fn services(&self) -> &ServiceManager {
        &self.services
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Evaluate the completeness predicate of `kind` for `target`
    pub fn completeness(
        &self,
        kind: SessionKind,
        target: &BTreeMap<String, String>,
    ) -> Completeness {
        match kind {
            SessionKind::WebmailSetup => self.webmail_completeness(),
            SessionKind::DnsForward => self.dns_completeness(),
            SessionKind::ServiceEnable => self.service_completeness(target),
        }
    }

    /// Whether the goal of a `kind` session over `target` is already met
    pub fn is_fully_done(&self, kind: SessionKind, target: &BTreeMap<String, String>) -> bool {
        self.completeness(kind, target).is_fully_done()
    }

    /// Take the lock for `kind` or fail with a conflict
    fn lock(&self, kind: SessionKind) -> Result<LockGuard> {
        match self.locks.try_acquire(kind.lock_name())? {
            Some(guard) => Ok(guard),
            None => {
                warn!("{} rejected: lock {} is held", kind, kind.lock_name());
                Err(Error::Conflict(format!(
                    "setup already in progress ({})",
                    kind.lock_name()
                )))
            }
        }
    }
}
