// src/services/manager.rs

//! systemd unit control
//!
//! Mutations run privileged with the default timeout and fail with
//! [`Error::Command`](crate::Error::Command) on a non-zero exit. Probes run
//! unprivileged with the short probe timeout and never fail: a probe that
//! cannot answer reads as "no".

use crate::runner::{CommandRunner, CommandSpec, Timeouts, bin};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info};

/// Lifecycle actions issued through `systemctl`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitAction {
    Enable,
    Disable,
    Start,
    Stop,
    Restart,
    Reload,
}

impl UnitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitAction::Enable => "enable",
            UnitAction::Disable => "disable",
            UnitAction::Start => "start",
            UnitAction::Stop => "stop",
            UnitAction::Restart => "restart",
            UnitAction::Reload => "reload",
        }
    }
}

/// Controls systemd units through the command runner
#[derive(Clone)]
pub struct ServiceManager {
    runner: Arc<dyn CommandRunner>,
    timeouts: Timeouts,
}

impl ServiceManager {
    pub fn new(runner: Arc<dyn CommandRunner>, timeouts: Timeouts) -> Self {
        Self { runner, timeouts }
    }

    /// Issue `systemctl <action> <unit>`
    pub fn control(&self, action: UnitAction, unit: &str) -> Result<()> {
        info!("systemctl {} {}", action.as_str(), unit);
        let spec = CommandSpec::new(bin::SYSTEMCTL)
            .args([action.as_str(), unit])
            .timeout(self.timeouts.default)
            .privileged();
        self.runner.run_checked(&spec)?;
        Ok(())
    }

    pub fn enable(&self, unit: &str) -> Result<()> {
        self.control(UnitAction::Enable, unit)
    }

    pub fn disable(&self, unit: &str) -> Result<()> {
        self.control(UnitAction::Disable, unit)
    }

    pub fn start(&self, unit: &str) -> Result<()> {
        self.control(UnitAction::Start, unit)
    }

    pub fn stop(&self, unit: &str) -> Result<()> {
        self.control(UnitAction::Stop, unit)
    }

    pub fn restart(&self, unit: &str) -> Result<()> {
        self.control(UnitAction::Restart, unit)
    }

    pub fn reload(&self, unit: &str) -> Result<()> {
        self.control(UnitAction::Reload, unit)
    }

    /// Undo an enable/start, returning the unit to its earlier state
    ///
    /// Both steps are attempted; the first error is returned.
    pub fn revert_activation(&self, unit: &str, was_enabled: bool, was_active: bool) -> Result<()> {
        let stopped = if was_active { Ok(()) } else { self.stop(unit) };
        let disabled = if was_enabled { Ok(()) } else { self.disable(unit) };
        stopped.and(disabled)
    }

    /// `systemctl is-active --quiet <unit>`
    pub fn is_active(&self, unit: &str) -> bool {
        self.probe("is-active", unit)
    }

    /// `systemctl is-enabled --quiet <unit>`
    pub fn is_enabled(&self, unit: &str) -> bool {
        self.probe("is-enabled", unit)
    }

    fn probe(&self, verb: &str, unit: &str) -> bool {
        let spec = CommandSpec::new(bin::SYSTEMCTL)
            .args([verb, "--quiet", unit])
            .timeout(self.timeouts.probe);
        match self.runner.run(&spec) {
            Ok(result) => result.success(),
            Err(e) => {
                debug!("systemctl {} {} could not run: {}", verb, unit, e);
                false
            }
        }
    }
}
