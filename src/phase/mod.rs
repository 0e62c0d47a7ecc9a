// src/phase/mod.rs

//! Phased execution with reverse rollback
//!
//! A provisioning session is an ordered list of [`Phase`]s. Each phase
//! performs one external mutation and may carry a best-effort rollback that
//! undoes it. The [`PhaseExecutor`] runs phases strictly in order and, on the
//! first failure, unwinds.
//!
//! # Unwind Scope
//!
//! ```text
//! phase:     1 ─ 2 ─ 3* ─ 4 ─ 5 ─ 6(fails)
//!                     ^
//!                checkpoint
//! rollback:               6 → 5 → 4          (3, 2, 1 are kept)
//! ```
//!
//! A phase marked as a checkpoint closes a sub-chain: once it completes,
//! the phases up to and including it are considered committed and a later
//! failure only unwinds what came after. Without a checkpoint, a failure
//! unwinds everything back to the first phase.
//!
//! Phases share a mutable context `C` (discovered paths, generated secrets,
//! what was actually installed) so that later phases and rollbacks see what
//! earlier phases produced.

mod executor;

pub use executor::{ExecutionReport, PhaseExecutor, PhaseFailure};

use crate::runner::STDERR_TAIL_CHARS;
use thiserror::Error;

/// Why a phase failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct PhaseError {
    pub message: String,
}

impl PhaseError {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let count = message.chars().count();
        // Keep the tail; that is where tools put the actual error
        let message = if count > STDERR_TAIL_CHARS * 2 {
            message.chars().skip(count - STDERR_TAIL_CHARS * 2).collect()
        } else {
            message
        };
        Self { message }
    }
}

impl From<crate::Error> for PhaseError {
    fn from(err: crate::Error) -> Self {
        PhaseError::new(err.to_string())
    }
}

/// Result of a phase that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// The mutation was performed
    Applied,
    /// Performed, with a non-fatal warning worth surfacing to the caller
    AppliedWithWarning(String),
    /// Nothing to do; there is nothing to roll back either
    Skipped(String),
}

pub type PhaseResult = Result<PhaseOutcome, PhaseError>;

type RunFn<'a, C> = Box<dyn FnMut(&mut C) -> PhaseResult + 'a>;
type RollbackFn<'a, C> = Box<dyn FnMut(&mut C) -> Result<(), PhaseError> + 'a>;
type WhenFn<'a, C> = Box<dyn Fn(&C) -> Option<String> + 'a>;

/// One named mutation plus its rollback
pub struct Phase<'a, C> {
    name: &'static str,
    run: RunFn<'a, C>,
    rollback: Option<RollbackFn<'a, C>>,
    skip_when: Option<WhenFn<'a, C>>,
    checkpoint: bool,
}

impl<'a, C> Phase<'a, C> {
    pub fn new<F>(name: &'static str, run: F) -> Self
    where
        F: FnMut(&mut C) -> PhaseResult + 'a,
    {
        Self {
            name,
            run: Box::new(run),
            rollback: None,
            skip_when: None,
            checkpoint: false,
        }
    }

    /// Undo this phase's mutation
    ///
    /// Also invoked when this phase itself fails, to clear a half-applied
    /// artifact, so it must tolerate partial state.
    pub fn with_rollback<F>(mut self, rollback: F) -> Self
    where
        F: FnMut(&mut C) -> Result<(), PhaseError> + 'a,
    {
        self.rollback = Some(Box::new(rollback));
        self
    }

    /// Skip the phase when `reason` returns `Some`, evaluated just before it would run
    pub fn skip_when<F>(mut self, reason: F) -> Self
    where
        F: Fn(&C) -> Option<String> + 'a,
    {
        self.skip_when = Some(Box::new(reason));
        self
    }

    /// Commit everything up to and including this phase once it succeeds
    pub fn checkpoint(mut self) -> Self {
        self.checkpoint = true;
        self
    }
}

impl<C> std::fmt::Debug for Phase<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phase")
            .field("name", &self.name)
            .field("rollback", &self.rollback.is_some())
            .field("checkpoint", &self.checkpoint)
            .finish()
    }
}

/// Map a runner or writer result into a phase result
pub fn applied<T>(result: crate::Result<T>) -> PhaseResult {
    result.map(|_| PhaseOutcome::Applied).map_err(PhaseError::from)
}
