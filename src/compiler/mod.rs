//! Turns a [`crate::model::Grid`] into one [`NumericCircuit`] per
//! connected island (SPEC_FULL.md §4.1). Grounded on the teacher's
//! `PFNetwork::create_y_bus`/`create_s_bus`/`create_v_init`
//! (`src/basic/system/system.rs`), generalized to the full four-admittance
//! branch rule, islanding, and structured errors.

mod assemble;
mod islands;

use bevy_ecs::prelude::Entity;
use nalgebra_sparse::CscMatrix;
use num_complex::Complex64;

use crate::error::{CompileError, CompileWarning};
use crate::model::{BusType, Grid};

/// The solver-ready numeric form of one connected island. Owns its own
/// arrays; shares no mutable state with the [`Grid`] it was built from
/// (SPEC_FULL.md §3 Ownership).
#[derive(Debug, Clone)]
pub struct NumericCircuit {
    pub n: usize,
    pub m: usize,
    pub sbase_mva: f64,

    /// Dense index -> originating bus entity, for mapping results back
    /// onto the device model.
    pub bus_entities: Vec<Entity>,
    /// Dense branch index -> originating branch entity.
    pub branch_entities: Vec<Entity>,

    pub ybus: CscMatrix<Complex64>,
    pub yseries: CscMatrix<Complex64>,
    pub yshunt: Vec<Complex64>,
    pub yf: CscMatrix<Complex64>,
    pub yt: CscMatrix<Complex64>,

    pub f: Vec<usize>,
    pub t: Vec<usize>,
    pub branch_active: Vec<bool>,
    pub branch_rate: Vec<f64>,

    pub sbus: Vec<Complex64>,
    pub ibus: Vec<Complex64>,
    pub vbus: Vec<Complex64>,
    pub bus_types: Vec<BusType>,

    pub vmin: Vec<f64>,
    pub vmax: Vec<f64>,
    pub qmin: Vec<f64>,
    pub qmax: Vec<f64>,

    /// Aggregated nameplate capacity per bus (MVA for generators,
    /// |P| MW for batteries, which carry no `s_nom`), used only by
    /// [`crate::cpf`]'s optional distributed-slack redistribution
    /// (spec.md §4.8: "proportionally to their installed power").
    pub installed_mva: Vec<f64>,
}

impl NumericCircuit {
    /// Islands with exactly one bus and no nonzero injection converge
    /// trivially at V = 1∠0 without invoking any kernel (SPEC_FULL.md §4.1).
    pub fn is_trivial(&self) -> bool {
        self.n == 1 && self.sbus[0].norm() < 1e-12 && self.ibus[0].norm() < 1e-12
    }

    pub fn pv(&self) -> Vec<usize> {
        self.index_of(BusType::PV)
    }

    pub fn pq(&self) -> Vec<usize> {
        self.index_of(BusType::PQ)
    }

    pub fn reference(&self) -> Vec<usize> {
        self.index_of(BusType::Ref)
    }

    fn index_of(&self, ty: BusType) -> Vec<usize> {
        self.bus_types
            .iter()
            .enumerate()
            .filter_map(|(i, t)| (*t == ty).then_some(i))
            .collect()
    }

    /// A cheap clone with `sbus` replaced, used by the Q-limit outer
    /// loop (SPEC_FULL.md §4.6: "recompile *only* the type-dependent
    /// arrays") instead of re-running the full compiler.
    pub fn with_sbus(&self, sbus: Vec<Complex64>) -> Self {
        debug_assert_eq!(sbus.len(), self.n);
        Self {
            sbus,
            ..self.clone()
        }
    }
}

/// Result of compiling a whole grid: one circuit per surviving island,
/// every non-fatal finding encountered along the way (SPEC_FULL.md §4.1
/// "Warnings channel"), and every island dropped because it had no
/// possible slack bus (spec.md §7 "Topology: island without any
/// possible slack bus -> fatal for that island; other islands
/// continue").
#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    pub islands: Vec<NumericCircuit>,
    pub warnings: Vec<CompileWarning>,
    pub island_failures: Vec<CompileError>,
}

/// Compiles `grid` into one [`NumericCircuit`] per connected island.
///
/// A fatal [`CompileError`] aborts the whole compilation, *except*
/// `NoSlackPossible`: spec.md §7 scopes that one failure to the island
/// that produced it, so it is collected into
/// [`CompileOutput::island_failures`] and compilation continues with
/// the remaining islands. Input-validation errors (zero-impedance
/// branch, NaN field, missing bus, conflicting set-point) are grid-wide
/// defects and stop compilation entirely.
pub fn compile(grid: &Grid) -> Result<CompileOutput, CompileError> {
    grid.validate_profiles()?;

    let mut warnings = Vec::new();
    let mut islands = Vec::new();
    let mut island_failures = Vec::new();

    for island in islands::find_islands(grid) {
        match assemble::build_numeric_circuit(grid, &island.buses, &island.branches, &mut warnings) {
            Ok(circuit) => islands.push(circuit),
            Err(err @ CompileError::NoSlackPossible(_)) => {
                log::warn!("{err}");
                island_failures.push(err);
            }
            Err(err) => return Err(err),
        }
    }

    Ok(CompileOutput {
        islands,
        warnings,
        island_failures,
    })
}
