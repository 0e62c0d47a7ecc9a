// src/session/dns_forward.rs

//! Local DNS resolver with upstream forwarding
//!
//! Replaces systemd-resolved with unbound listening on 127.0.0.1 and
//! forwarding every query to the configured upstreams. A broken resolver
//! stops inbound mail, so the new resolver must answer a query before the
//! session is considered done; otherwise everything is unwound and
//! systemd-resolved is brought back. An unbound that was already serving
//! is restarted on the restored forward zone.

use super::{Provisioner, ProvisioningSession, SessionKind};
use crate::config_writer::{UNBOUND_FORWARD, templates};
use crate::phase::{Phase, PhaseError, PhaseOutcome, applied};
use crate::probe::Completeness;
use crate::runner::{CommandSpec, bin};
use crate::services::{self, ConflictResolution, ConflictResolver};
use crate::{Error, Result, validate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::{info, info_span, warn};

/// POST /v1/dns/forward body
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsForwardRequest {
    /// Upstream resolvers; the configured defaults when absent
    #[serde(default)]
    pub forwarders: Option<Vec<String>>,
    #[serde(default)]
    pub restart_postfix: bool,
    #[serde(default)]
    pub reconfigure: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsForwardResponse {
    pub success: bool,
    pub forwarders: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default)]
struct DnsContext {
    forwarders: Vec<IpAddr>,
    restart_postfix: bool,
    installed: Vec<String>,
    displaced: ConflictResolution,
    previous_forward: Option<String>,
    unbound_was_enabled: bool,
    unbound_was_active: bool,
}

impl Provisioner {
    /// Point the host's resolver at unbound forwarding to upstreams
    pub fn setup_dns_forward(&self, request: &DnsForwardRequest) -> Result<DnsForwardResponse> {
        let requested = request
            .forwarders
            .clone()
            .unwrap_or_else(|| self.config.dns.forwarders.clone());
        if requested.is_empty() {
            return Err(Error::Validation("at least one forwarder is required".to_string()));
        }
        let forwarders = requested
            .iter()
            .map(|f| validate::forwarder(f))
            .collect::<Result<Vec<_>>>()?;

        let target = BTreeMap::from([
            ("forwarders".to_string(), requested.join(",")),
            ("restartPostfix".to_string(), request.restart_postfix.to_string()),
        ]);
        let mut session = ProvisioningSession::new(SessionKind::DnsForward, target);
        let span = info_span!("session", id = %session.id, kind = %session.kind);
        let _entered = span.enter();

        let _lock = self.lock(SessionKind::DnsForward)?;

        if self.dns_completeness().is_fully_done() && !request.reconfigure {
            return Err(Error::Conflict("DNS forwarding is already configured".to_string()));
        }

        let mut ctx = DnsContext {
            forwarders,
            restart_postfix: request.restart_postfix,
            ..Default::default()
        };
        info!("Forwarding DNS to {}", requested.join(", "));
        let report = session.execute(&self.audit, &mut ctx, self.dns_phases())?;

        Ok(DnsForwardResponse {
            success: true,
            forwarders: ctx.forwarders.iter().map(IpAddr::to_string).collect(),
            warnings: report.warnings,
        })
    }

    /// unbound installed AND forward zone written AND unbound enabled
    pub(crate) fn dns_completeness(&self) -> Completeness {
        Completeness::new()
            .check("package", self.probe.package_installed("unbound"))
            .check("forward-zone", self.probe.path_exists(UNBOUND_FORWARD))
            .check("enabled", self.services.is_enabled(services::UNBOUND.unit))
    }

    fn dns_phases(&self) -> Vec<Phase<'_, DnsContext>> {
        let unbound = &services::UNBOUND;
        vec![
            Phase::new("install-unbound", move |ctx: &mut DnsContext| {
                ctx.installed = self
                    .packages
                    .install_missing(&self.probe, &["unbound".to_string()])?;
                if ctx.installed.is_empty() {
                    Ok(PhaseOutcome::Skipped("already installed".to_string()))
                } else {
                    Ok(PhaseOutcome::Applied)
                }
            })
            .with_rollback(move |ctx: &mut DnsContext| {
                self.packages.remove(&ctx.installed)?;
                Ok(())
            }),
            Phase::new("resolve-conflicts", move |ctx: &mut DnsContext| {
                ctx.displaced = ConflictResolver::new(&self.services).resolve(unbound);
                if ctx.displaced.warnings.is_empty() {
                    Ok(PhaseOutcome::Applied)
                } else {
                    Ok(PhaseOutcome::AppliedWithWarning(ctx.displaced.warnings.join("; ")))
                }
            })
            .with_rollback(move |ctx: &mut DnsContext| {
                ConflictResolver::new(&self.services).restore(&ctx.displaced);
                Ok(())
            }),
            Phase::new("write-forward-zone", move |ctx: &mut DnsContext| {
                let content = templates::unbound_forward(&ctx.forwarders)?;
                ctx.previous_forward = self.probe.read_file(UNBOUND_FORWARD);
                applied(self.writer.write(UNBOUND_FORWARD, &content))
            })
            .with_rollback(move |ctx: &mut DnsContext| {
                match ctx.previous_forward.take() {
                    Some(previous) => self.writer.write(UNBOUND_FORWARD, &previous)?,
                    None => self.writer.remove(UNBOUND_FORWARD)?,
                }
                // start-unbound has already unwound; a still running unbound
                // predates this session and must drop the rejected forwarders
                if self.services.is_active(unbound.unit) {
                    self.services.restart(unbound.unit)?;
                }
                Ok(())
            }),
            Phase::new("check-unbound-config", move |_: &mut DnsContext| {
                let spec = CommandSpec::new(bin::UNBOUND_CHECKCONF)
                    .timeout(self.timeouts.default)
                    .privileged();
                applied(self.runner.run_checked(&spec))
            }),
            Phase::new("start-unbound", move |ctx: &mut DnsContext| {
                ctx.unbound_was_enabled = self.services.is_enabled(unbound.unit);
                ctx.unbound_was_active = self.services.is_active(unbound.unit);
                if !ctx.unbound_was_enabled {
                    self.services.enable(unbound.unit)?;
                }
                // Restart so a running instance picks up the new forward zone
                applied(self.services.restart(unbound.unit))
            })
            .with_rollback(move |ctx: &mut DnsContext| {
                self.services.revert_activation(
                    unbound.unit,
                    ctx.unbound_was_enabled,
                    ctx.unbound_was_active,
                )?;
                Ok(())
            }),
            Phase::new("verify-resolution", move |_: &mut DnsContext| {
                let spec = CommandSpec::new(bin::DIG)
                    .args(["@127.0.0.1", "+short", "+time=2", "+tries=1", "localhost"])
                    .timeout(self.timeouts.probe);
                let result = self.runner.run_checked(&spec)?;
                if result.stdout.trim().is_empty() {
                    return Err(PhaseError::new("unbound returned no answer for localhost"));
                }
                Ok(PhaseOutcome::Applied)
            }),
            Phase::new("restart-postfix", move |_: &mut DnsContext| {
                let postfix = &services::POSTFIX;
                if !self.services.is_active(postfix.unit) {
                    return Ok(PhaseOutcome::AppliedWithWarning(
                        "postfix is not running; it will use the new resolver when started"
                            .to_string(),
                    ));
                }
                match self.services.restart(postfix.unit) {
                    Ok(()) => Ok(PhaseOutcome::Applied),
                    Err(e) => {
                        warn!("Postfix restart failed: {}", e);
                        Ok(PhaseOutcome::AppliedWithWarning(format!(
                            "postfix restart failed: {}",
                            e
                        )))
                    }
                }
            })
            .skip_when(|ctx: &DnsContext| {
                (!ctx.restart_postfix).then(|| "postfix restart not requested".to_string())
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: DnsForwardRequest = serde_json::from_str("{}").unwrap();
        assert!(request.forwarders.is_none());
        assert!(!request.restart_postfix);
        assert!(!request.reconfigure);

        let request: DnsForwardRequest =
            serde_json::from_str(r#"{"forwarders": ["9.9.9.9"], "restartPostfix": true}"#).unwrap();
        assert_eq!(request.forwarders, Some(vec!["9.9.9.9".to_string()]));
        assert!(request.restart_postfix);
    }
}
