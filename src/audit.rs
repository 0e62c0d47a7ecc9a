// src/audit.rs

//! Audit trail of provisioning sessions
//!
//! Every executed session leaves one entry when it starts, one per phase
//! (applied, skipped, failed, rolled back) and one for its terminal state.
//! Entries go to the tracing log, to a bounded in-memory history, and, when
//! a path is configured, to an append-only JSON-lines file. A failing file
//! write is logged and never fails the session.

use crate::phase::{ExecutionReport, PhaseFailure};
use crate::session::{ProvisioningSession, SessionKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Default audit file location
pub const DEFAULT_AUDIT_LOG: &str = "/var/log/mailsmith/audit.jsonl";

/// What an audit entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Started,
    Applied,
    Skipped,
    Failed,
    RolledBack,
    RollbackFailed,
    Completed,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Started => "started",
            AuditOutcome::Applied => "applied",
            AuditOutcome::Skipped => "skipped",
            AuditOutcome::Failed => "failed",
            AuditOutcome::RolledBack => "rolled_back",
            AuditOutcome::RollbackFailed => "rollback_failed",
            AuditOutcome::Completed => "completed",
        }
    }
}

/// Audit log entry
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub kind: SessionKind,
    /// Phase the entry is about; `None` for session-level entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AuditEntry {
    pub fn new(session: &ProvisioningSession, outcome: AuditOutcome) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: session.id.clone(),
            kind: session.kind,
            phase: None,
            outcome,
            details: None,
        }
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Format as log message
    pub fn to_log_message(&self) -> String {
        format!(
            "[{}] session={} kind={} phase={} {}{}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.session_id,
            self.kind,
            self.phase.as_deref().unwrap_or("-"),
            self.outcome.as_str(),
            self.details
                .as_deref()
                .map(|d| format!(" ({})", d))
                .unwrap_or_default()
        )
    }
}

#[derive(Debug)]
struct AuditInner {
    entries: Mutex<VecDeque<AuditEntry>>,
    max_entries: usize,
    file: Option<PathBuf>,
}

/// Audit logger shared by every session of a provisioner
///
/// Cheap to clone; clones append to the same history and file.
#[derive(Debug, Clone)]
pub struct AuditLog {
    inner: Arc<AuditInner>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(None, 10_000)
    }
}

impl AuditLog {
    pub fn new(file: Option<PathBuf>, max_entries: usize) -> Self {
        Self {
            inner: Arc::new(AuditInner {
                entries: Mutex::new(VecDeque::new()),
                max_entries,
                file,
            }),
        }
    }

    pub fn file(&self) -> Option<&Path> {
        self.inner.file.as_deref()
    }

    /// Log an audit entry
    pub fn log(&self, entry: AuditEntry) {
        let msg = entry.to_log_message();
        match entry.outcome {
            AuditOutcome::Failed | AuditOutcome::RollbackFailed => warn!("AUDIT: {}", msg),
            _ => info!("AUDIT: {}", msg),
        }

        if let Some(path) = &self.inner.file {
            if let Err(e) = append_json_line(path, &entry) {
                warn!("Failed to append to audit log {}: {}", path.display(), e);
            }
        }

        let mut entries = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.push_back(entry);
        while entries.len() > self.inner.max_entries {
            entries.pop_front();
        }
    }

    pub fn session_started(&self, session: &ProvisioningSession) {
        let details = session
            .target
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        self.log(AuditEntry::new(session, AuditOutcome::Started).with_details(details));
    }

    /// Record every phase of a successful run, then the session's completion
    pub fn record_report(&self, session: &ProvisioningSession, report: &ExecutionReport) {
        for phase in &report.applied {
            self.log(AuditEntry::new(session, AuditOutcome::Applied).with_phase(*phase));
        }
        for (phase, reason) in &report.skipped {
            self.log(
                AuditEntry::new(session, AuditOutcome::Skipped)
                    .with_phase(*phase)
                    .with_details(reason.as_str()),
            );
        }
        self.log(AuditEntry::new(session, AuditOutcome::Completed));
    }

    /// Record a failed run: what applied, the failing phase, then each
    /// rollback in the order it ran
    pub fn record_failure(&self, session: &ProvisioningSession, failure: &PhaseFailure) {
        for phase in &failure.applied {
            self.log(AuditEntry::new(session, AuditOutcome::Applied).with_phase(*phase));
        }
        self.log(
            AuditEntry::new(session, AuditOutcome::Failed)
                .with_phase(failure.phase)
                .with_details(failure.error.message.as_str()),
        );
        for phase in &failure.rolled_back {
            let error = failure
                .rollback_errors
                .iter()
                .find(|(name, _)| name == phase)
                .map(|(_, e)| e);
            let entry = match error {
                Some(e) => AuditEntry::new(session, AuditOutcome::RollbackFailed)
                    .with_details(e.message.as_str()),
                None => AuditEntry::new(session, AuditOutcome::RolledBack),
            };
            self.log(entry.with_phase(*phase));
        }
    }

    /// The newest `count` entries, oldest first
    pub fn recent(&self, count: usize) -> Vec<AuditEntry> {
        let entries = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let start = entries.len().saturating_sub(count);
        entries.iter().skip(start).cloned().collect()
    }

    /// Entries recorded for one session, oldest first
    pub fn session_entries(&self, session_id: &str) -> Vec<AuditEntry> {
        let entries = self
            .inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }
}

fn append_json_line(path: &Path, entry: &AuditEntry) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseError;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn session() -> ProvisioningSession {
        ProvisioningSession::new(
            SessionKind::DnsForward,
            BTreeMap::from([("forwarders".to_string(), "9.9.9.9".to_string())]),
        )
    }

    #[test]
    fn test_entry_log_message() {
        let s = session();
        let entry = AuditEntry::new(&s, AuditOutcome::RolledBack).with_phase("write-forward-zone");
        let msg = entry.to_log_message();
        assert!(msg.contains(&format!("session={}", s.id)));
        assert!(msg.contains("kind=dns_forward"));
        assert!(msg.contains("phase=write-forward-zone rolled_back"));
    }

    #[test]
    fn test_failure_records_rollbacks_in_order() {
        let log = AuditLog::default();
        let s = session();
        let failure = PhaseFailure {
            index: 2,
            phase: "verify",
            error: PhaseError::new("no answer"),
            applied: vec!["write", "start"],
            rolled_back: vec!["start", "write"],
            rollback_errors: vec![("write", PhaseError::new("read-only"))],
            warnings: vec![],
        };

        log.session_started(&s);
        log.record_failure(&s, &failure);

        let entries = log.session_entries(&s.id);
        let outcomes: Vec<_> = entries
            .iter()
            .map(|e| (e.phase.as_deref(), e.outcome))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                (None, AuditOutcome::Started),
                (Some("write"), AuditOutcome::Applied),
                (Some("start"), AuditOutcome::Applied),
                (Some("verify"), AuditOutcome::Failed),
                (Some("start"), AuditOutcome::RolledBack),
                (Some("write"), AuditOutcome::RollbackFailed),
            ]
        );
        assert_eq!(entries[0].details.as_deref(), Some("forwarders=9.9.9.9"));
        assert_eq!(entries[5].details.as_deref(), Some("read-only"));
    }

    #[test]
    fn test_history_is_bounded() {
        let log = AuditLog::new(None, 3);
        let s = session();
        for _ in 0..5 {
            log.log(AuditEntry::new(&s, AuditOutcome::Applied));
        }
        log.log(AuditEntry::new(&s, AuditOutcome::Completed));

        let recent = log.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[2].outcome, AuditOutcome::Completed);
        assert_eq!(log.recent(1).len(), 1);
    }

    #[test]
    fn test_file_appends_json_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("audit.jsonl");
        let log = AuditLog::new(Some(path.clone()), 100);
        let s = session();

        let report = ExecutionReport {
            applied: vec!["write-forward-zone"],
            skipped: vec![("install-unbound", "already installed".to_string())],
            warnings: vec![],
        };
        log.record_report(&s, &report);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["outcome"], "applied");
        assert_eq!(lines[0]["phase"], "write-forward-zone");
        assert_eq!(lines[1]["outcome"], "skipped");
        assert_eq!(lines[1]["details"], "already installed");
        assert_eq!(lines[2]["outcome"], "completed");
        assert_eq!(lines[2]["kind"], "dns_forward");
        assert!(lines[2].get("phase").is_none());
    }

    #[test]
    fn test_unwritable_file_does_not_panic() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let log = AuditLog::new(Some(blocker.join("audit.jsonl")), 10);

        log.log(AuditEntry::new(&session(), AuditOutcome::Started));
        assert_eq!(log.recent(10).len(), 1);
    }
}
