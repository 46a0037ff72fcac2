//! Ties compilation, per-island kernel retry, the Q-limit outer loop,
//! and branch post-processing into the single
//! [`solve_power_flow`] entry point (SPEC_FULL.md §4.7). **[ADD]** as a
//! standalone unit: the teacher's `PowerGrid::run_pf`/`ecs_run_pf`
//! (`examples/chengts95-rustpower/src/basic/ecs/network.rs`) inline the
//! single-kernel, single-island case only and never retry or aggregate
//! across islands.

use std::collections::HashMap;

use bevy_ecs::prelude::Entity;
use nalgebra::DVector;
use num_complex::Complex64;

use crate::compiler::{self, NumericCircuit};
use crate::error::{CompileError, DriverError};
use crate::model::{BusType, Grid};
use crate::progress::{CancelToken, ProgressCallback};

use super::dc::DcKernel;
use super::helm::HelmKernel;
use super::newton::{IwamotoNewtonRaphson, NewtonRaphson};
use super::postprocess::branch_flows;
use super::{IslandResult, Kernel, PFResult, QControlMode, SolverOptions, SolverType};

fn kernel_for(ty: SolverType) -> Result<Box<dyn Kernel>, DriverError> {
    match ty {
        SolverType::Nr => Ok(Box::new(NewtonRaphson)),
        SolverType::Iwamoto => Ok(Box::new(IwamotoNewtonRaphson)),
        SolverType::Dc => Ok(Box::new(DcKernel)),
        SolverType::Helm | SolverType::HelmZ => Ok(Box::new(HelmKernel)),
        other => Err(DriverError::UnsupportedSolverType(other)),
    }
}

/// Runs one kernel to (non-)convergence, wrapped in the Q-limit direct
/// control loop of spec.md §4.6: between kernel calls, mutate a
/// solver-local `bus_types`/`sbus` pair and re-solve until no bus
/// changes state or `options.max_outer_iterations` is reached.
fn run_with_q_control(
    circuit: &NumericCircuit,
    solver_type: SolverType,
    v0: DVector<Complex64>,
    options: &SolverOptions,
    progress: &mut ProgressCallback,
    cancel: &CancelToken,
) -> (super::KernelOutcome, Vec<BusType>) {
    let kernel = match kernel_for(solver_type) {
        Ok(k) => k,
        Err(err) => {
            log::warn!("{err}");
            return (
                super::KernelOutcome {
                    v: v0,
                    s_calc: DVector::from_element(circuit.n, Complex64::new(0.0, 0.0)),
                    converged: false,
                    iterations: 0,
                    residual: f64::INFINITY,
                    cancelled: false,
                },
                circuit.bus_types.clone(),
            );
        }
    };

    let control = super::qlimit::control_buses(circuit);
    let mut bus_types = circuit.bus_types.clone();
    let mut sbus = circuit.sbus.clone();
    let mut v = v0;

    let max_outer = match options.q_control_mode {
        QControlMode::Off => 1,
        QControlMode::Direct => options.max_outer_iterations.max(1),
    };

    let mut outcome;
    let mut outer_iter = 0usize;
    loop {
        let working = circuit.with_sbus(sbus.clone());
        outcome = kernel.solve(&working, &bus_types, &v, options, progress, cancel);
        v = outcome.v.clone();
        outer_iter += 1;

        if outcome.cancelled || !outcome.converged || options.q_control_mode == QControlMode::Off {
            break;
        }
        if outer_iter >= max_outer {
            break;
        }

        let any_issue = super::qlimit::apply_direct_control(
            circuit,
            &control,
            &mut bus_types,
            &mut v,
            &outcome.s_calc,
            &mut sbus,
        );
        outcome.v = v.clone();

        if !any_issue {
            break;
        }
    }

    (outcome, bus_types)
}

/// §4.7's steps 2a/2b: try `options.solver_type`; if it does not
/// converge and `options.retry_solver_type` is configured, retry with
/// the non-converged iterate as the new initializer.
fn solve_island(
    circuit: &NumericCircuit,
    options: &SolverOptions,
    v0: DVector<Complex64>,
    progress: &mut ProgressCallback,
    cancel: &CancelToken,
) -> (super::KernelOutcome, Vec<BusType>) {
    let (outcome, bus_types) = run_with_q_control(circuit, options.solver_type, v0, options, progress, cancel);
    if outcome.converged || outcome.cancelled {
        return (outcome, bus_types);
    }
    if let Some(retry) = options.retry_solver_type {
        log::debug!("primary solver failed to converge, retrying with {retry:?}");
        return run_with_q_control(circuit, retry, outcome.v.clone(), options, progress, cancel);
    }
    (outcome, bus_types)
}

/// Runs `options.solver_type` (with retry and Q-limit control) over
/// every island of `grid` and aggregates the result, per spec.md §4.7.
///
/// `initial_v`, keyed by the originating bus [`Entity`], overrides the
/// compiler's default initial guess (PV set-point magnitude / 1.0 p.u.,
/// angle 0) for buses present in the map; this is spec.md §6's
/// `initial_V?` driver parameter.
pub fn solve_power_flow(
    grid: &Grid,
    options: &SolverOptions,
    initial_v: Option<&HashMap<Entity, Complex64>>,
    progress: &mut ProgressCallback,
    cancel: &CancelToken,
) -> Result<PFResult, CompileError> {
    let compiled = compiler::compile(grid)?;
    for failure in &compiled.island_failures {
        log::warn!("island dropped from solve: {failure}");
    }
    for warning in &compiled.warnings {
        log::debug!("compile warning: {warning:?}");
    }

    let mut islands = Vec::with_capacity(compiled.islands.len());

    for circuit in &compiled.islands {
        if circuit.is_trivial() {
            islands.push(trivial_island_result(circuit));
            continue;
        }

        let v0 = initial_v
            .map(|overrides| apply_overrides(circuit, overrides))
            .unwrap_or_else(|| DVector::from_vec(circuit.vbus.clone()));

        let (outcome, _bus_types) = solve_island(circuit, options, v0, progress, cancel);
        let flows = branch_flows(circuit, &outcome.v);

        islands.push(IslandResult {
            converged: outcome.converged,
            iterations: outcome.iterations,
            residual: outcome.residual,
            cancelled: outcome.cancelled,
            bus_entities: circuit.bus_entities.clone(),
            v: outcome.v.iter().copied().collect(),
            s_calc: outcome.s_calc.iter().copied().collect(),
            branch_entities: circuit.branch_entities.clone(),
            s_f: flows.s_f,
            s_t: flows.s_t,
            i_branch: flows.i_branch,
            loading: flows.loading,
            losses: flows.losses,
        });
    }

    Ok(PFResult {
        islands,
        warnings: compiled.warnings,
        island_failures: compiled.island_failures,
    })
}

fn trivial_island_result(circuit: &NumericCircuit) -> IslandResult {
    IslandResult {
        converged: true,
        iterations: 0,
        residual: 0.0,
        cancelled: false,
        bus_entities: circuit.bus_entities.clone(),
        v: vec![Complex64::new(1.0, 0.0)],
        s_calc: vec![Complex64::new(0.0, 0.0)],
        branch_entities: circuit.branch_entities.clone(),
        s_f: Vec::new(),
        s_t: Vec::new(),
        i_branch: Vec::new(),
        loading: Vec::new(),
        losses: Vec::new(),
    }
}

fn apply_overrides(circuit: &NumericCircuit, overrides: &HashMap<Entity, Complex64>) -> DVector<Complex64> {
    let mut v = circuit.vbus.clone();
    for (i, &bus) in circuit.bus_entities.iter().enumerate() {
        if let Some(&ov) = overrides.get(&bus) {
            v[i] = ov;
        }
    }
    DVector::from_vec(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Branch, BranchKind, Bus, ControlledGenerator, Load, Zip};
    use crate::progress::CancelToken;

    #[test]
    fn two_bus_solves_through_the_driver() {
        let mut grid = Grid::new(100.0, 60.0);
        let b0 = grid.add_bus(Bus {
            is_slack: true,
            ..Default::default()
        });
        let b1 = grid.add_bus(Bus::default());
        grid.add_branch(Branch::new(BranchKind::Line, b0, b1, 0.02, 0.1));
        grid.add_load(
            b1,
            Load {
                zip: Zip {
                    s: Complex64::new(0.5, 0.2),
                    ..Default::default()
                },
                active: true,
            },
        );

        let options = SolverOptions::default();
        let cancel = CancelToken::new();
        let result = solve_power_flow(&grid, &options, None, &mut |_| {}, &cancel).unwrap();

        assert_eq!(result.islands.len(), 1);
        assert!(result.all_converged());
        let island = &result.islands[0];
        assert_eq!(island.s_f.len(), 1);
        assert!((island.s_f[0] + island.s_t[0] - island.losses[0]).norm() < 1e-6);
    }

    #[test]
    fn islands_solve_independently() {
        let mut grid = Grid::new(100.0, 60.0);
        let a0 = grid.add_bus(Bus {
            is_slack: true,
            ..Default::default()
        });
        let a1 = grid.add_bus(Bus::default());
        grid.add_branch(Branch::new(BranchKind::Line, a0, a1, 0.02, 0.1));
        grid.add_load(
            a1,
            Load {
                zip: Zip {
                    s: Complex64::new(0.3, 0.1),
                    ..Default::default()
                },
                active: true,
            },
        );

        let b0 = grid.add_bus(Bus {
            is_slack: true,
            ..Default::default()
        });
        let b1 = grid.add_bus(Bus::default());
        grid.add_branch(Branch::new(BranchKind::Line, b0, b1, 0.03, 0.12));
        grid.add_load(
            b1,
            Load {
                zip: Zip {
                    s: Complex64::new(0.2, 0.05),
                    ..Default::default()
                },
                active: true,
            },
        );

        let options = SolverOptions::default();
        let cancel = CancelToken::new();
        let result = solve_power_flow(&grid, &options, None, &mut |_| {}, &cancel).unwrap();

        assert_eq!(result.islands.len(), 2);
        assert!(result.all_converged());
        let bus_sets: Vec<usize> = result.islands.iter().map(|i| i.bus_entities.len()).collect();
        assert_eq!(bus_sets, vec![2, 2]);
    }

    #[test]
    fn q_control_demotes_pv_bus_that_exceeds_its_limit() {
        let mut grid = Grid::new(100.0, 60.0);
        let b0 = grid.add_bus(Bus {
            is_slack: true,
            ..Default::default()
        });
        let b1 = grid.add_bus(Bus::default());
        let b2 = grid.add_bus(Bus::default());
        grid.add_branch(Branch::new(BranchKind::Line, b0, b1, 0.01, 0.08));
        grid.add_branch(Branch::new(BranchKind::Line, b1, b2, 0.01, 0.08));
        grid.add_generator(
            b1,
            ControlledGenerator {
                p_mw: 200.0,
                v_set_pu: 1.05,
                q_min_mvar: -50.0,
                q_max_mvar: 50.0,
                ..Default::default()
            },
        );
        grid.add_load(
            b2,
            Load {
                zip: Zip {
                    s: Complex64::new(300.0, 120.0),
                    ..Default::default()
                },
                active: true,
            },
        );

        let options = SolverOptions {
            q_control_mode: QControlMode::Direct,
            ..Default::default()
        };
        let cancel = CancelToken::new();
        let result = solve_power_flow(&grid, &options, None, &mut |_| {}, &cancel).unwrap();
        let island = &result.islands[0];
        // Whether or not this particular case converges, Q-control must
        // never leave the generator bus holding both a Q violation and
        // its 1.05 set-point simultaneously (property 6).
        let gen_idx = 1;
        let v_mag = island.v[gen_idx].norm();
        let q = island.s_calc[gen_idx].im;
        let at_setpoint = (v_mag - 1.05).abs() < 1e-6;
        let within_limits = q <= 0.5 + 1e-6 && q >= -0.5 - 1e-6;
        assert!(!at_setpoint || within_limits);
    }
}
