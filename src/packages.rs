// src/packages.rs

//! Debian package installation through apt-get

use crate::probe::SystemProbe;
use crate::runner::{CommandRunner, CommandSpec, Timeouts, bin};
use crate::Result;
use std::sync::Arc;
use tracing::info;

/// Installs and removes packages
#[derive(Clone)]
pub struct PackageManager {
    runner: Arc<dyn CommandRunner>,
    timeouts: Timeouts,
}

impl PackageManager {
    pub fn new(runner: Arc<dyn CommandRunner>, timeouts: Timeouts) -> Self {
        Self { runner, timeouts }
    }

    /// Install whichever of `packages` are missing
    ///
    /// Returns the packages this call actually installed, so a rollback can
    /// remove exactly those and nothing that was present before.
    pub fn install_missing(&self, probe: &SystemProbe, packages: &[String]) -> Result<Vec<String>> {
        let missing: Vec<String> = packages
            .iter()
            .filter(|p| !probe.package_installed(p))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(missing);
        }

        info!("Installing packages: {}", missing.join(" "));
        let spec = CommandSpec::new(bin::APT_GET)
            .args(["install", "-y", "--no-install-recommends"])
            .args(missing.iter().cloned())
            .env("DEBIAN_FRONTEND", "noninteractive")
            .timeout(self.timeouts.install)
            .privileged();
        self.runner.run_checked(&spec)?;
        Ok(missing)
    }

    /// Remove `packages`, keeping their configuration files
    pub fn remove(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        info!("Removing packages: {}", packages.join(" "));
        let spec = CommandSpec::new(bin::APT_GET)
            .args(["remove", "-y"])
            .args(packages.iter().cloned())
            .env("DEBIAN_FRONTEND", "noninteractive")
            .timeout(self.timeouts.install)
            .privileged();
        self.runner.run_checked(&spec)?;
        Ok(())
    }
}
