// src/services/conflict.rs

//! Conflicting-service resolution
//!
//! Called strictly before a target service is enabled. The counterpart
//! declared in the registry is stopped and then disabled. Failures are
//! logged and collected as warnings: if the counterpart lingers it will
//! simply lose the port to the target.

use super::{ServiceDescriptor, ServiceManager};
use tracing::{info, warn};

/// A conflicting service that was moved out of the way
#[derive(Debug, Clone)]
pub struct DisplacedService {
    pub descriptor: &'static ServiceDescriptor,
    pub was_enabled: bool,
    pub was_active: bool,
}

/// What [`ConflictResolver::resolve`] did
#[derive(Debug, Clone, Default)]
pub struct ConflictResolution {
    pub displaced: Option<DisplacedService>,
    pub warnings: Vec<String>,
}

/// Disables the counterpart of a service before it is enabled
pub struct ConflictResolver<'a> {
    services: &'a ServiceManager,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(services: &'a ServiceManager) -> Self {
        Self { services }
    }

    /// Stop and disable whatever conflicts with `target`
    pub fn resolve(&self, target: &ServiceDescriptor) -> ConflictResolution {
        let Some(other) = target.conflicts_with else {
            return ConflictResolution::default();
        };

        let was_enabled = self.services.is_enabled(other.unit);
        let was_active = self.services.is_active(other.unit);
        info!(
            "Resolving conflict: {} conflicts with {} (enabled={}, active={})",
            target.name, other.name, was_enabled, was_active
        );

        let mut warnings = Vec::new();
        if let Err(e) = self.services.stop(other.unit) {
            warn!("Failed to stop conflicting service {}: {}", other.name, e);
            warnings.push(format!("could not stop {}: {}", other.name, e));
        }
        if let Err(e) = self.services.disable(other.unit) {
            warn!("Failed to disable conflicting service {}: {}", other.name, e);
            warnings.push(format!("could not disable {}: {}", other.name, e));
        }

        ConflictResolution {
            displaced: Some(DisplacedService {
                descriptor: other,
                was_enabled,
                was_active,
            }),
            warnings,
        }
    }

    /// Put a displaced service back the way [`resolve`](Self::resolve) found it
    ///
    /// Best-effort; used when enabling the target is rolled back.
    pub fn restore(&self, resolution: &ConflictResolution) {
        let Some(displaced) = &resolution.displaced else {
            return;
        };
        let unit = displaced.descriptor.unit;
        if displaced.was_enabled {
            if let Err(e) = self.services.enable(unit) {
                warn!("Failed to re-enable {}: {}", displaced.descriptor.name, e);
            }
        }
        if displaced.was_active {
            if let Err(e) = self.services.start(unit) {
                warn!("Failed to restart {}: {}", displaced.descriptor.name, e);
            }
        }
    }
}
