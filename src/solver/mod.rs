//! The power-flow kernel family (SPEC_FULL.md §4.3-§4.7): Newton-Raphson
//! with optional Iwamoto damping, DC, and HELM, behind one [`Kernel`]
//! trait, plus the Q-limit outer loop, branch post-processing, and the
//! driver that ties compilation, kernel retry, and aggregation together.
//!
//! Per REDESIGN FLAGS ("dynamic dispatch over solver variants"), kernel
//! selection is a tagged enum (`SolverType`) plus one trait — not the
//! teacher's inline single-kernel call in `ecs_run_pf`.

pub mod dc;
pub(crate) mod dsbus_dv;
pub mod driver;
pub mod helm;
pub mod newton;
pub mod postprocess;
pub mod qlimit;

use bevy_ecs::prelude::Entity;
use nalgebra::DVector;
use num_complex::Complex64;

use crate::compiler::NumericCircuit;
use crate::model::BusType;
use crate::progress::{CancelToken, ProgressCallback};

/// Wire values fixed per spec.md §6. Only `Nr`, `Iwamoto`, `Dc`, and
/// `Helm` have an implemented [`Kernel`]; the rest select a
/// `DriverError::UnsupportedSolverType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SolverType {
    Nr = 1,
    NrfdXb = 2,
    NrfdBx = 3,
    Gauss = 4,
    Dc = 5,
    Helm = 6,
    ZBus = 7,
    Iwamoto = 8,
    ContinuationNr = 9,
    HelmZ = 10,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QControlMode {
    Off,
    Direct,
}

#[derive(Debug, Clone, Copy)]
pub struct SolverOptions {
    pub solver_type: SolverType,
    pub retry_solver_type: Option<SolverType>,
    pub tolerance: f64,
    pub max_iterations: usize,
    pub q_control_mode: QControlMode,
    pub max_outer_iterations: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            solver_type: SolverType::Nr,
            retry_solver_type: Some(SolverType::Helm),
            tolerance: 1e-8,
            max_iterations: 30,
            q_control_mode: QControlMode::Direct,
            max_outer_iterations: 10,
        }
    }
}

/// What one kernel call returns, regardless of which kernel ran
/// (SPEC_FULL.md §4.3 "Termination", §4.5 "Contract"). Never carries an
/// error — "failures are data, not control flow" (§7): non-convergence
/// is `converged = false` with the last iterate, not a `Result::Err`.
#[derive(Debug, Clone)]
pub struct KernelOutcome {
    pub v: DVector<Complex64>,
    pub s_calc: DVector<Complex64>,
    pub converged: bool,
    pub iterations: usize,
    pub residual: f64,
    pub cancelled: bool,
}

/// Common interface every power-flow kernel implements
/// (REDESIGN FLAGS "dynamic dispatch over solver variants").
pub trait Kernel {
    fn solve(
        &self,
        circuit: &NumericCircuit,
        bus_types: &[BusType],
        v0: &DVector<Complex64>,
        options: &SolverOptions,
        progress: &mut ProgressCallback,
        cancel: &CancelToken,
    ) -> KernelOutcome;
}

/// Splits bus indices into `(pv, pq, ref)` index sets (SPEC_FULL.md §4.3
/// "Indexing"). `StoDispatch` buses are treated as `PV` for indexing
/// purposes (voltage-controlled, reactive power free).
pub(crate) fn index_sets(bus_types: &[BusType]) -> (Vec<usize>, Vec<usize>, Vec<usize>) {
    let mut pv = Vec::new();
    let mut pq = Vec::new();
    let mut refs = Vec::new();
    for (i, t) in bus_types.iter().enumerate() {
        match t {
            BusType::PV | BusType::StoDispatch => pv.push(i),
            BusType::PQ => pq.push(i),
            BusType::Ref => refs.push(i),
            BusType::None => {}
        }
    }
    (pv, pq, refs)
}

/// Infinity-norm mismatch residual shared by every AC kernel
/// (SPEC_FULL.md §4.3 "Mismatch function").
pub(crate) fn mismatch(
    ybus: &nalgebra_sparse::CscMatrix<Complex64>,
    v: &DVector<Complex64>,
    sbus: &DVector<Complex64>,
    pvpq: &[usize],
    pq: &[usize],
) -> (DVector<Complex64>, nalgebra::DVector<f64>) {
    let s_calc = s_calc_of(ybus, v);
    let mism = &s_calc - sbus;
    let mut f = nalgebra::DVector::zeros(pvpq.len() + pq.len());
    for (k, &i) in pvpq.iter().enumerate() {
        f[k] = mism[i].re;
    }
    for (k, &i) in pq.iter().enumerate() {
        f[pvpq.len() + k] = mism[i].im;
    }
    (s_calc, f)
}

/// S_calc = V ⊙ conj(Ybus · V).
pub(crate) fn s_calc_of(
    ybus: &nalgebra_sparse::CscMatrix<Complex64>,
    v: &DVector<Complex64>,
) -> DVector<Complex64> {
    let iv = ybus * v;
    DVector::from_iterator(v.len(), v.iter().zip(iv.iter()).map(|(vi, ivi)| vi * ivi.conj()))
}

pub(crate) fn inf_norm(f: &nalgebra::DVector<f64>) -> f64 {
    f.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))
}

/// Result of compiling, solving, and post-processing one island
/// (SPEC_FULL.md §6 `PFResult.per_island`/`per_bus`/`per_branch`).
#[derive(Debug, Clone)]
pub struct IslandResult {
    pub converged: bool,
    pub iterations: usize,
    pub residual: f64,
    pub cancelled: bool,
    pub bus_entities: Vec<Entity>,
    pub v: Vec<Complex64>,
    pub s_calc: Vec<Complex64>,
    pub branch_entities: Vec<Entity>,
    pub s_f: Vec<Complex64>,
    pub s_t: Vec<Complex64>,
    pub i_branch: Vec<f64>,
    pub loading: Vec<f64>,
    pub losses: Vec<Complex64>,
}

/// The grid-wide aggregation of every island's result
/// (SPEC_FULL.md §2 "aggregator -> MultiIslandResult"). `warnings` and
/// `island_failures` are the structured logger spec.md §6 attaches to
/// `PFResult` — non-fatal compiler findings and islands dropped for
/// lack of a possible slack bus (spec.md §7 "Topology" failure mode).
#[derive(Debug, Clone, Default)]
pub struct PFResult {
    pub islands: Vec<IslandResult>,
    pub warnings: Vec<crate::error::CompileWarning>,
    pub island_failures: Vec<crate::error::CompileError>,
}

impl PFResult {
    pub fn all_converged(&self) -> bool {
        self.islands.iter().all(|i| i.converged)
    }

    pub fn voltage_at(&self, bus: Entity) -> Option<Complex64> {
        self.islands.iter().find_map(|isl| {
            isl.bus_entities
                .iter()
                .position(|&e| e == bus)
                .map(|i| isl.v[i])
        })
    }
}
