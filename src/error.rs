//! Structured error and warning kinds (SPEC_FULL.md §7). Every kind here
//! is *data* carried on a result object, not a panic or an escaping
//! exception — "failures are data, not control flow."

use bevy_ecs::prelude::Entity;
use thiserror::Error;

/// Fatal, compile-time input-validation and topology errors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    #[error("branch {0:?} has zero impedance (r = x = 0)")]
    ZeroImpedanceBranch(Entity),

    #[error("branch {0:?} references a bus that does not exist in this grid")]
    MissingBus(Entity),

    #[error("bus {0:?} has conflicting voltage set-points from more than one controller")]
    ConflictingVSetpoint(Entity),

    #[error("island rooted at bus {0:?} has no possible slack bus")]
    NoSlackPossible(Entity),

    #[error("field `{0}` contains a NaN or infinite value")]
    NaNInput(&'static str),

    #[error("device {0:?} carries a time profile whose length does not match the master time index")]
    ProfileLengthMismatch(Entity),
}

/// Non-fatal compiler findings, collected rather than logged-and-dropped
/// (SPEC_FULL.md §4.1 "Warnings channel").
#[derive(Debug, Clone, PartialEq)]
pub enum CompileWarning {
    /// A branch had no `rate_mva`; the compiler defaulted it from the
    /// line's nominal current times voltage.
    MissingBranchRateDefaulted { branch: Entity, defaulted_mva: f64 },
}

/// Linear-solve failure inside a Newton-family iteration. Never
/// propagated with `?`: callers see it folded into a non-converged
/// [`crate::solver::KernelOutcome`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Default)]
#[error("sparse linear system is numerically singular")]
pub struct SingularMatrix;

/// Driver-level configuration error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    #[error("solver type {0:?} has no implemented kernel in this engine")]
    UnsupportedSolverType(crate::solver::SolverType),
}
