// src/probe.rs

//! Idempotency guard
//!
//! Whether a provisioning goal is already met is derived from the live
//! system every time: package database, file presence, unit enablement.
//! Nothing is remembered between requests.
//!
//! A session kind describes "done" as a [`Completeness`]: a conjunction of
//! independent named checks. Any single failing check makes the whole
//! predicate false, which routes the request back through the full phase
//! pipeline instead of trusting a partial install.

use crate::runner::{CommandRunner, CommandSpec, Timeouts, bin};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// One named sub-check of a completeness predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Check {
    pub name: String,
    pub passed: bool,
}

/// Conjunction of independent checks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Completeness {
    checks: Vec<Check>,
}

impl Completeness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sub-check
    pub fn check(mut self, name: impl Into<String>, passed: bool) -> Self {
        self.checks.push(Check {
            name: name.into(),
            passed,
        });
        self
    }

    /// True only if there is at least one check and every check passed
    pub fn is_fully_done(&self) -> bool {
        !self.checks.is_empty() && self.checks.iter().all(|c| c.passed)
    }

    /// Names of failing checks
    pub fn missing(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn checks(&self) -> &[Check] {
        &self.checks
    }
}

/// Read-only queries against the host
#[derive(Clone)]
pub struct SystemProbe {
    runner: Arc<dyn CommandRunner>,
    timeouts: Timeouts,
}

impl SystemProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, timeouts: Timeouts) -> Self {
        Self { runner, timeouts }
    }

    fn query(&self, spec: CommandSpec) -> Option<String> {
        let spec = spec.timeout(self.timeouts.probe);
        match self.runner.run(&spec) {
            Ok(result) if result.success() => Some(result.stdout),
            Ok(_) => None,
            Err(e) => {
                debug!("Probe {} could not run: {}", spec.display_line(), e);
                None
            }
        }
    }

    /// Package is in dpkg state `install ok installed`
    pub fn package_installed(&self, package: &str) -> bool {
        self.query(CommandSpec::new(bin::DPKG_QUERY).args(["-W", "-f=${Status}", package]))
            .is_some_and(|status| status.trim() == "install ok installed")
    }

    /// Installed version of `package`
    pub fn package_version(&self, package: &str) -> Option<String> {
        if !self.package_installed(package) {
            return None;
        }
        self.query(CommandSpec::new(bin::DPKG_QUERY).args(["-W", "-f=${Version}", package]))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn path_exists(&self, path: &str) -> bool {
        self.test("-e", path)
    }

    pub fn is_symlink(&self, path: &str) -> bool {
        self.test("-L", path)
    }

    pub fn is_socket(&self, path: &str) -> bool {
        self.test("-S", path)
    }

    fn test(&self, flag: &str, path: &str) -> bool {
        self.query(CommandSpec::new(bin::TEST).args([flag, path]))
            .is_some()
    }

    /// Contents of a root-readable file
    pub fn read_file(&self, path: &str) -> Option<String> {
        self.query(CommandSpec::new(bin::CAT).arg(path).privileged())
    }
}
