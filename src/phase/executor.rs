// src/phase/executor.rs

//! Sequential phase execution and unwinding

use super::{Phase, PhaseError, PhaseOutcome};
use tracing::{error, info, warn};

/// What a successful run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    /// Phases whose mutation was performed, in order
    pub applied: Vec<&'static str>,
    /// Skipped phases and why
    pub skipped: Vec<(&'static str, String)>,
    /// Non-fatal warnings raised along the way
    pub warnings: Vec<String>,
}

/// A failed run, after unwinding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseFailure {
    /// Zero-based index of the failing phase
    pub index: usize,
    pub phase: &'static str,
    pub error: PhaseError,
    /// Phases applied before the failure, in order
    pub applied: Vec<&'static str>,
    /// Phases whose rollback was invoked, in invocation order
    pub rolled_back: Vec<&'static str>,
    /// Rollbacks that themselves failed (logged, never escalated)
    pub rollback_errors: Vec<(&'static str, PhaseError)>,
    /// Warnings raised before the failure
    pub warnings: Vec<String>,
}

impl std::fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "phase '{}' failed: {}", self.phase, self.error)
    }
}

impl std::error::Error for PhaseFailure {}

/// Runs an ordered phase list against a shared context
pub struct PhaseExecutor<'a, C> {
    phases: Vec<Phase<'a, C>>,
}

impl<'a, C> PhaseExecutor<'a, C> {
    pub fn new(phases: Vec<Phase<'a, C>>) -> Self {
        Self { phases }
    }

    /// Execute every phase in order
    ///
    /// On the first error the failing phase's own rollback runs, then the
    /// rollbacks of every completed phase since the last checkpoint, newest
    /// first. Phases after the failing one never run.
    pub fn run(mut self, ctx: &mut C) -> Result<ExecutionReport, PhaseFailure> {
        let total = self.phases.len();
        let mut report = ExecutionReport::default();
        // Indices of phases whose mutation took effect since the last checkpoint
        let mut completed: Vec<usize> = Vec::new();

        for index in 0..total {
            let phase = &mut self.phases[index];

            if let Some(reason) = phase.skip_when.as_ref().and_then(|when| when(ctx)) {
                info!("[{}/{}] {} skipped: {}", index + 1, total, phase.name, reason);
                report.skipped.push((phase.name, reason));
                continue;
            }

            info!("[{}/{}] {}", index + 1, total, phase.name);
            match (phase.run)(ctx) {
                Ok(PhaseOutcome::Applied) => {
                    report.applied.push(phase.name);
                    completed.push(index);
                }
                Ok(PhaseOutcome::AppliedWithWarning(warning)) => {
                    warn!("{}: {}", phase.name, warning);
                    report.applied.push(phase.name);
                    report.warnings.push(warning);
                    completed.push(index);
                }
                Ok(PhaseOutcome::Skipped(reason)) => {
                    info!("{} skipped: {}", phase.name, reason);
                    report.skipped.push((phase.name, reason));
                }
                Err(err) => {
                    error!("Phase {} failed: {}", phase.name, err);
                    let name = phase.name;
                    let (rolled_back, rollback_errors) = self.unwind(ctx, index, &completed);
                    return Err(PhaseFailure {
                        index,
                        phase: name,
                        error: err,
                        applied: report.applied,
                        rolled_back,
                        rollback_errors,
                        warnings: report.warnings,
                    });
                }
            }

            if self.phases[index].checkpoint {
                info!("Checkpoint reached after {}", self.phases[index].name);
                completed.clear();
            }
        }

        Ok(report)
    }

    fn unwind(
        &mut self,
        ctx: &mut C,
        failed: usize,
        completed: &[usize],
    ) -> (Vec<&'static str>, Vec<(&'static str, PhaseError)>) {
        let mut rolled_back = Vec::new();
        let mut errors = Vec::new();

        let order = std::iter::once(failed).chain(completed.iter().rev().copied());
        for index in order {
            let phase = &mut self.phases[index];
            let Some(rollback) = phase.rollback.as_mut() else {
                continue;
            };
            info!("Rolling back {}", phase.name);
            rolled_back.push(phase.name);
            if let Err(e) = rollback(ctx) {
                // Keep unwinding; earlier phases are independent of this one
                warn!("Rollback of {} failed: {}", phase.name, e);
                errors.push((phase.name, e));
            }
        }

        (rolled_back, errors)
    }
}
