//! A steady-state power-flow engine: network compilation into sparse
//! admittance matrices, a family of power-flow kernels (Newton-Raphson
//! with Iwamoto damping, DC, and HELM) behind a single driver contract,
//! a PV/PQ reactive-limit control loop, and continuation power flow
//! (CPF) for P-V curve tracing.
//!
//! Start at [`model::Grid`] to build a network, [`compiler::compile`]
//! to turn it into a [`compiler::NumericCircuit`], and
//! [`solver::driver::solve_power_flow`] or [`cpf::run_continuation`] to
//! run it.

pub mod compiler;
pub mod cpf;
pub mod error;
pub mod model;
pub mod progress;
pub mod solver;
pub mod sparse;

pub mod prelude {
    pub use crate::compiler::{CompileOutput, NumericCircuit, compile};
    pub use crate::cpf::{CpfOptions, CpfResult, Parametrization, StoppingCriterion, run_continuation};
    pub use crate::error::{CompileError, CompileWarning, DriverError, SingularMatrix};
    pub use crate::model::{
        Branch, BranchKind, Bus, BusId, BusType, Grid, Load, ControlledGenerator, Battery,
        StaticGenerator, Shunt, TargetBus, Zip,
    };
    pub use crate::progress::{CancelToken, Progress};
    pub use crate::solver::{
        KernelOutcome, PFResult, QControlMode, SolverOptions, SolverType, driver::solve_power_flow,
    };
}
