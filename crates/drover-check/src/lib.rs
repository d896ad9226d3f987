//! Verification backend for composed race-checking programs.
//!
//! The pipeline talks to the backend through the [`Checker`] trait, so the
//! bounded explicit-state evaluator shipped here ([`ExplicitChecker`]) can be
//! swapped for an external solver without touching the orchestration.

use drover_ir::Program;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod explicit;

pub use explicit::ExplicitChecker;

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("entry procedure '{name}' has no implementation")]
    MissingEntry { name: String },
    #[error("type mismatch while evaluating '{context}'")]
    TypeMismatch { context: String },
    #[error("unknown identifier '{name}'")]
    UnknownIdent { name: String },
}

/// One reported race: the checking access that found no common lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaceError {
    /// `read` or `write`, the checker side's access kind.
    pub access: String,
    /// Shared memory region the access targets.
    pub region: String,
}

impl fmt::Display for RaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "potential {} race on {}", self.access, self.region)
    }
}

/// Per-pair verification verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Verified,
    Errors(Vec<RaceError>),
    TimedOut,
    OutOfMemory,
    Inconclusive,
}

/// Resource bounds for one check.
#[derive(Debug, Clone)]
pub struct CheckLimits {
    /// Maximum call-inlining depth per callee.
    pub inline_bound: usize,
    /// Wall-clock budget; unlimited when `None`.
    pub timeout: Option<Duration>,
    /// Explored-state budget before giving up with `OutOfMemory`.
    pub max_states: usize,
    /// Command-step budget before giving up with `Inconclusive`.
    pub max_steps: usize,
}

impl Default for CheckLimits {
    fn default() -> Self {
        Self {
            inline_bound: 3,
            timeout: None,
            max_states: 1 << 20,
            max_steps: 1 << 22,
        }
    }
}

/// A verification backend able to check one composed entry procedure.
pub trait Checker {
    fn check(
        &self,
        program: &Program,
        entry: &str,
        limits: &CheckLimits,
    ) -> Result<VerificationOutcome, CheckError>;
}
