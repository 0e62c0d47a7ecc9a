// src/session/service_enable.rs

//! Enabling and disabling allow-listed services
//!
//! Every requested name is validated before anything runs. Services are
//! then processed one at a time in name order, each through its own short
//! phase chain, so a failure on one service unwinds only that service:
//!
//! - enable: `resolve-conflicts` -> `enable-unit` -> `start-unit`
//! - disable: `stop-unit` -> `disable-unit`

use super::{Provisioner, ProvisioningSession, SessionKind, SessionState};
use crate::phase::{Phase, PhaseExecutor, PhaseOutcome, applied};
use crate::probe::Completeness;
use crate::services::{self, ConflictResolution, ConflictResolver, ServiceDescriptor};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, info_span, warn};

/// POST /v1/services/enable body
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEnableRequest {
    /// Service name to desired state
    pub services: BTreeMap<String, bool>,
}

/// What happened to one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOutcome {
    pub name: String,
    /// Probed after the run
    pub enabled: bool,
    /// Probed after the run
    pub started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEnableResponse {
    pub results: Vec<ServiceOutcome>,
    pub all_ok: bool,
}

#[derive(Debug, Default)]
struct ServiceContext {
    resolution: ConflictResolution,
}

impl Provisioner {
    /// Apply the requested enable/disable state to each service
    pub fn enable_services(&self, request: &ServiceEnableRequest) -> Result<ServiceEnableResponse> {
        if request.services.is_empty() {
            return Err(Error::Validation("no services given".to_string()));
        }
        let plan = request
            .services
            .iter()
            .map(|(name, &enable)| services::lookup(name).map(|d| (d, enable)))
            .collect::<Result<Vec<_>>>()?;

        let target: BTreeMap<String, String> = request
            .services
            .iter()
            .map(|(name, enable)| (name.clone(), enable.to_string()))
            .collect();
        let mut session = ProvisioningSession::new(SessionKind::ServiceEnable, target.clone());
        let span = info_span!("session", id = %session.id, kind = %session.kind);
        let _entered = span.enter();

        let _lock = self.lock(SessionKind::ServiceEnable)?;

        // No up-front guard: each chain skips what is already in place, and a
        // mail daemon asked to be on is restarted even when it already runs
        session.begin();
        self.audit.session_started(&session);
        let results: Vec<ServiceOutcome> = plan
            .into_iter()
            .map(|(descriptor, enable)| self.apply_service(&session, descriptor, enable))
            .collect();
        let all_ok = results.iter().all(|r| r.error.is_none());
        session.finish(if all_ok {
            SessionState::Completed
        } else {
            SessionState::RolledBack
        });

        Ok(ServiceEnableResponse { results, all_ok })
    }

    /// Every requested service is in its requested enabled and running state
    pub(crate) fn service_completeness(&self, target: &BTreeMap<String, String>) -> Completeness {
        target.iter().fold(Completeness::new(), |completeness, (name, wanted)| {
            let wanted = wanted == "true";
            match services::find(name) {
                Some(descriptor) => completeness
                    .check(
                        format!("{}-enabled", name),
                        self.services.is_enabled(descriptor.unit) == wanted,
                    )
                    .check(
                        format!("{}-active", name),
                        self.services.is_active(descriptor.unit) == wanted,
                    ),
                None => completeness.check(name.clone(), false),
            }
        })
    }

    fn apply_service(
        &self,
        session: &ProvisioningSession,
        descriptor: &'static ServiceDescriptor,
        enable: bool,
    ) -> ServiceOutcome {
        let phases = if enable {
            self.enable_phases(descriptor)
        } else {
            self.disable_phases(descriptor)
        };
        info!(
            "{} {}",
            if enable { "Enabling" } else { "Disabling" },
            descriptor.name
        );

        let mut ctx = ServiceContext::default();
        let (error, warnings) = match PhaseExecutor::new(phases).run(&mut ctx) {
            Ok(report) => {
                self.audit.record_report(session, &report);
                (None, report.warnings)
            }
            Err(failure) => {
                warn!("{}: {}", descriptor.name, failure);
                self.audit.record_failure(session, &failure);
                (Some(failure.to_string()), failure.warnings)
            }
        };

        ServiceOutcome {
            name: descriptor.name.to_string(),
            enabled: self.services.is_enabled(descriptor.unit),
            started: self.services.is_active(descriptor.unit),
            error,
            warnings,
        }
    }

    fn enable_phases(
        &self,
        descriptor: &'static ServiceDescriptor,
    ) -> Vec<Phase<'_, ServiceContext>> {
        let unit = descriptor.unit;
        vec![
            Phase::new("resolve-conflicts", move |ctx: &mut ServiceContext| {
                ctx.resolution = ConflictResolver::new(&self.services).resolve(descriptor);
                if ctx.resolution.warnings.is_empty() {
                    Ok(PhaseOutcome::Applied)
                } else {
                    Ok(PhaseOutcome::AppliedWithWarning(ctx.resolution.warnings.join("; ")))
                }
            })
            .with_rollback(move |ctx: &mut ServiceContext| {
                ConflictResolver::new(&self.services).restore(&ctx.resolution);
                Ok(())
            })
            .skip_when(move |_: &ServiceContext| {
                descriptor.conflicts_with.is_none().then(|| "no conflicting service".to_string())
            }),
            Phase::new("enable-unit", move |_: &mut ServiceContext| {
                applied(self.services.enable(unit))
            })
            .with_rollback(move |_: &mut ServiceContext| {
                self.services.disable(unit)?;
                Ok(())
            })
            .skip_when(move |_: &ServiceContext| {
                self.services.is_enabled(unit).then(|| "already enabled".to_string())
            }),
            Phase::new("start-unit", move |_: &mut ServiceContext| {
                // These daemons only pick up configuration on a full restart
                if descriptor.needs_restart_not_start {
                    applied(self.services.restart(unit))
                } else if self.services.is_active(unit) {
                    Ok(PhaseOutcome::Skipped("already running".to_string()))
                } else {
                    applied(self.services.start(unit))
                }
            }),
        ]
    }

    fn disable_phases(
        &self,
        descriptor: &'static ServiceDescriptor,
    ) -> Vec<Phase<'_, ServiceContext>> {
        let unit = descriptor.unit;
        vec![
            Phase::new("stop-unit", move |_: &mut ServiceContext| {
                applied(self.services.stop(unit))
            })
            .with_rollback(move |_: &mut ServiceContext| {
                self.services.start(unit)?;
                Ok(())
            })
            .skip_when(move |_: &ServiceContext| {
                (!self.services.is_active(unit)).then(|| "not running".to_string())
            }),
            Phase::new("disable-unit", move |_: &mut ServiceContext| {
                applied(self.services.disable(unit))
            })
            .skip_when(move |_: &ServiceContext| {
                (!self.services.is_enabled(unit)).then(|| "not enabled".to_string())
            }),
        ]
    }
}
