// src/services/mod.rs

//! Manageable OS services
//!
//! The registry is a closed, compiled-in allow-list. Every service name that
//! arrives over the API must resolve here before it can reach `systemctl`.
//!
//! # Module Structure
//!
//! - `manager` - systemd unit control through the command runner
//! - `conflict` - stops and disables a conflicting service before enabling its counterpart

pub mod conflict;
pub mod manager;

pub use conflict::{ConflictResolution, ConflictResolver, DisplacedService};
pub use manager::ServiceManager;

use crate::{Error, Result, validate};

/// A manageable OS service
pub struct ServiceDescriptor {
    /// Public name accepted by the API
    pub name: &'static str,
    /// systemd unit
    pub unit: &'static str,
    /// Service that binds the same resource; declared on both sides
    pub conflicts_with: Option<&'static ServiceDescriptor>,
    /// Daemons that must be restarted (not merely started) to pick up configuration
    pub needs_restart_not_start: bool,
}

// Conflicts are cyclic; print the counterpart by name only
impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("conflicts_with", &self.conflicts_with.map(|d| d.name))
            .field("needs_restart_not_start", &self.needs_restart_not_start)
            .finish()
    }
}

impl PartialEq for ServiceDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ServiceDescriptor {}

pub static POSTFIX: ServiceDescriptor = ServiceDescriptor {
    name: "postfix",
    unit: "postfix.service",
    conflicts_with: None,
    needs_restart_not_start: true,
};

pub static DOVECOT: ServiceDescriptor = ServiceDescriptor {
    name: "dovecot",
    unit: "dovecot.service",
    conflicts_with: None,
    needs_restart_not_start: true,
};

pub static OPENDKIM: ServiceDescriptor = ServiceDescriptor {
    name: "opendkim",
    unit: "opendkim.service",
    conflicts_with: None,
    needs_restart_not_start: true,
};

pub static SPAMASSASSIN: ServiceDescriptor = ServiceDescriptor {
    name: "spamassassin",
    unit: "spamassassin.service",
    conflicts_with: None,
    needs_restart_not_start: false,
};

// Both bind :80/:443
pub static NGINX: ServiceDescriptor = ServiceDescriptor {
    name: "nginx",
    unit: "nginx.service",
    conflicts_with: Some(&APACHE2),
    needs_restart_not_start: false,
};

pub static APACHE2: ServiceDescriptor = ServiceDescriptor {
    name: "apache2",
    unit: "apache2.service",
    conflicts_with: Some(&NGINX),
    needs_restart_not_start: false,
};

pub static MARIADB: ServiceDescriptor = ServiceDescriptor {
    name: "mariadb",
    unit: "mariadb.service",
    conflicts_with: None,
    needs_restart_not_start: false,
};

// Both bind 127.0.0.53/127.0.0.1:53
pub static UNBOUND: ServiceDescriptor = ServiceDescriptor {
    name: "unbound",
    unit: "unbound.service",
    conflicts_with: Some(&SYSTEMD_RESOLVED),
    needs_restart_not_start: false,
};

pub static SYSTEMD_RESOLVED: ServiceDescriptor = ServiceDescriptor {
    name: "systemd-resolved",
    unit: "systemd-resolved.service",
    conflicts_with: Some(&UNBOUND),
    needs_restart_not_start: false,
};

pub static CLAMAV_DAEMON: ServiceDescriptor = ServiceDescriptor {
    name: "clamav-daemon",
    unit: "clamav-daemon.service",
    conflicts_with: None,
    needs_restart_not_start: false,
};

pub static CLAMAV_FRESHCLAM: ServiceDescriptor = ServiceDescriptor {
    name: "clamav-freshclam",
    unit: "clamav-freshclam.service",
    conflicts_with: None,
    needs_restart_not_start: false,
};

pub static FAIL2BAN: ServiceDescriptor = ServiceDescriptor {
    name: "fail2ban",
    unit: "fail2ban.service",
    conflicts_with: None,
    needs_restart_not_start: false,
};

/// Every service the API may touch
pub static REGISTRY: &[&ServiceDescriptor] = &[
    &POSTFIX,
    &DOVECOT,
    &OPENDKIM,
    &SPAMASSASSIN,
    &NGINX,
    &APACHE2,
    &MARIADB,
    &UNBOUND,
    &SYSTEMD_RESOLVED,
    &CLAMAV_DAEMON,
    &CLAMAV_FRESHCLAM,
    &FAIL2BAN,
];

/// Look up a registered service by name
pub fn find(name: &str) -> Option<&'static ServiceDescriptor> {
    REGISTRY.iter().copied().find(|d| d.name == name)
}

/// Validate `name` and resolve it against the registry
pub fn lookup(name: &str) -> Result<&'static ServiceDescriptor> {
    validate::service_name(name)?;
    find(name).ok_or_else(|| Error::Validation(format!("unknown service: {}", name)))
}
