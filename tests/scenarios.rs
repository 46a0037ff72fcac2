//! End-to-end scenarios S1-S6 (spec.md §8), each driving the crate the
//! way a real caller would: build a [`Grid`], compile it, run a solver
//! or the continuation driver, and check the result.

use std::collections::HashMap;

use num_complex::Complex64;

use grid_pf::compiler::compile;
use grid_pf::cpf::{CpfOptions, Parametrization, StoppingCriterion, run_continuation};
use grid_pf::error::CompileError;
use grid_pf::model::{Branch, BranchKind, Bus, ControlledGenerator, Grid, Load, Zip};
use grid_pf::progress::CancelToken;
use grid_pf::solver::driver::solve_power_flow;
use grid_pf::solver::{QControlMode, SolverOptions, SolverType};

fn no_progress(_: grid_pf::progress::Progress) {}

/// S1. Two-bus slack + PQ load.
#[test]
fn s1_two_bus_slack_and_pq_load_converges() {
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

    let options = SolverOptions {
        solver_type: SolverType::Nr,
        retry_solver_type: None,
        tolerance: 1e-8,
        max_iterations: 5,
        q_control_mode: QControlMode::Off,
        ..Default::default()
    };
    let cancel = CancelToken::new();
    let result = solve_power_flow(&grid, &options, None, &mut no_progress, &cancel).unwrap();

    assert!(result.all_converged());
    let island = &result.islands[0];
    let v1 = island.v[1];
    assert!((v1.norm() - 0.9577).abs() < 2e-3);
    assert!((island.s_f[0] + island.s_t[0] - island.losses[0]).norm() < 1e-6);
}

/// S2. Three-bus PV->PQ switch: with Q-control on, bus 1 demotes to PQ
/// once its reactive output exceeds Qmax, and its |V| no longer sits at
/// the 1.05 set-point.
#[test]
fn s2_three_bus_pv_to_pq_switch() {
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

    let cancel = CancelToken::new();

    let with_control = SolverOptions {
        q_control_mode: QControlMode::Direct,
        max_outer_iterations: 10,
        ..Default::default()
    };
    let result = solve_power_flow(&grid, &with_control, None, &mut no_progress, &cancel).unwrap();
    let island = &result.islands[0];
    let v1 = island.v[1].norm();
    let q1 = island.s_calc[1].im;
    // Property 6: never simultaneously off-limits and at set-point.
    let at_setpoint = (v1 - 1.05).abs() < 1e-6;
    let within_limits = q1 <= 0.5 + 1e-6 && q1 >= -0.5 - 1e-6;
    assert!(!at_setpoint || within_limits);

    let without_control = SolverOptions {
        q_control_mode: QControlMode::Off,
        ..Default::default()
    };
    let result_off = solve_power_flow(&grid, &without_control, None, &mut no_progress, &cancel).unwrap();
    let island_off = &result_off.islands[0];
    // With control off, bus 1 holds its 1.05 V set-point exactly.
    assert!((island_off.v[1].norm() - 1.05).abs() < 1e-9);
}

/// S3. Two disconnected subgraphs, each with its own slack, solved and
/// reported independently.
#[test]
fn s3_islanding_solves_independently() {
    let mut grid = Grid::new(100.0, 60.0);

    let a0 = grid.add_bus(Bus {
        is_slack: true,
        ..Default::default()
    });
    let a1 = grid.add_bus(Bus::default());
    let a2 = grid.add_bus(Bus::default());
    grid.add_branch(Branch::new(BranchKind::Line, a0, a1, 0.01, 0.08));
    grid.add_branch(Branch::new(BranchKind::Line, a1, a2, 0.01, 0.08));
    grid.add_load(
        a2,
        Load {
            zip: Zip {
                s: Complex64::new(0.4, 0.15),
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
    grid.add_branch(Branch::new(BranchKind::Line, b0, b1, 0.02, 0.09));
    grid.add_load(
        b1,
        Load {
            zip: Zip {
                s: Complex64::new(0.25, 0.1),
                ..Default::default()
            },
            active: true,
        },
    );

    let compiled = compile(&grid).unwrap();
    assert_eq!(compiled.islands.len(), 2);
    let total_buses: usize = compiled.islands.iter().map(|c| c.n).sum();
    assert_eq!(total_buses, 5);
    let sizes: std::collections::BTreeSet<usize> = compiled.islands.iter().map(|c| c.n).collect();
    assert_eq!(sizes, std::collections::BTreeSet::from([3, 2]));

    let options = SolverOptions::default();
    let cancel = CancelToken::new();
    let result = solve_power_flow(&grid, &options, None, &mut no_progress, &cancel).unwrap();
    assert_eq!(result.islands.len(), 2);
    assert!(result.all_converged());

    // Per-bus arrays stay scoped to their own island.
    let first_entities: std::collections::HashSet<_> = result.islands[0].bus_entities.iter().collect();
    let second_entities: std::collections::HashSet<_> = result.islands[1].bus_entities.iter().collect();
    assert!(first_entities.is_disjoint(&second_entities));
}

/// S4. CPF nose: lambda increases then decreases at least once, and the
/// trajectory stops at the first decrease.
#[test]
fn s4_cpf_traces_to_the_nose() {
    let mut grid = Grid::new(100.0, 60.0);
    let b0 = grid.add_bus(Bus {
        is_slack: true,
        ..Default::default()
    });
    let b1 = grid.add_bus(Bus::default());
    let b2 = grid.add_bus(Bus::default());
    grid.add_branch(Branch::new(BranchKind::Line, b0, b1, 0.01, 0.1));
    grid.add_branch(Branch::new(BranchKind::Line, b1, b2, 0.01, 0.1));
    grid.add_load(
        b1,
        Load {
            zip: Zip {
                s: Complex64::new(0.3, 0.1),
                ..Default::default()
            },
            active: true,
        },
    );
    grid.add_load(
        b2,
        Load {
            zip: Zip {
                s: Complex64::new(0.3, 0.1),
                ..Default::default()
            },
            active: true,
        },
    );

    let pf_options = SolverOptions::default();
    let cancel = CancelToken::new();
    let base = solve_power_flow(&grid, &pf_options, None, &mut no_progress, &cancel).unwrap();
    assert!(base.all_converged());

    let island = &base.islands[0];
    let mut v_base = HashMap::new();
    for (i, &e) in island.bus_entities.iter().enumerate() {
        v_base.insert(e, island.v[i]);
    }
    let compiled = compile(&grid).unwrap();
    let circuit = &compiled.islands[0];
    let mut s_target = HashMap::new();
    for (i, &e) in circuit.bus_entities.iter().enumerate() {
        s_target.insert(e, circuit.sbus[i] * 3.0);
    }

    let cpf_options = CpfOptions {
        parametrization: Parametrization::ArcLength,
        initial_step: 0.05,
        step_min: 0.01,
        step_max: 0.2,
        stop_at: StoppingCriterion::Nose,
        ..Default::default()
    };
    let result = run_continuation(&grid, &cpf_options, &v_base, &s_target, &mut no_progress, &cancel).unwrap();

    let island_traj = &result.islands[0];
    assert!(island_traj.steps.len() >= 2, "trajectory should take at least two steps before the nose");

    let lambdas: Vec<f64> = island_traj.steps.iter().map(|s| s.lambda).collect();
    // Property 7: strictly increasing up to (and not including) the
    // terminating step, which is the first decrease. Pushing the target
    // far past the base case (3x) guarantees the trajectory eventually
    // overshoots the maximum loadability point regardless of how mild
    // the starting load is, since lambda keeps climbing past 1.0 until
    // the nose is found.
    let mut saw_decrease = false;
    for w in lambdas.windows(2) {
        if w[1] < w[0] {
            saw_decrease = true;
            break;
        }
        assert!(w[1] > w[0], "lambda must increase strictly before the nose");
    }
    assert!(saw_decrease, "trajectory should turn over at the nose before the 3x target is reached");
}

/// S5. Non-convergence fallback: a deliberately under-iterated NR pass
/// fails to converge; retrying with HELM on the same (benign) case
/// succeeds.
#[test]
fn s5_nr_failure_recovers_via_helm_retry() {
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

    let cancel = CancelToken::new();

    let no_retry = SolverOptions {
        solver_type: SolverType::Nr,
        retry_solver_type: None,
        tolerance: 1e-6,
        max_iterations: 1,
        q_control_mode: QControlMode::Off,
        ..Default::default()
    };
    let result = solve_power_flow(&grid, &no_retry, None, &mut no_progress, &cancel).unwrap();
    assert!(!result.islands[0].converged);
    assert_eq!(result.islands[0].iterations, 1);

    let with_retry = SolverOptions {
        solver_type: SolverType::Nr,
        retry_solver_type: Some(SolverType::Helm),
        tolerance: 1e-6,
        max_iterations: 1,
        q_control_mode: QControlMode::Off,
        ..Default::default()
    };
    let result = solve_power_flow(&grid, &with_retry, None, &mut no_progress, &cancel).unwrap();
    assert!(result.islands[0].converged);
}

/// S6. Zero-impedance rejection: compilation fails before any solver runs.
#[test]
fn s6_zero_impedance_branch_rejected() {
    let mut grid = Grid::new(100.0, 60.0);
    let b0 = grid.add_bus(Bus {
        is_slack: true,
        ..Default::default()
    });
    let b1 = grid.add_bus(Bus::default());
    grid.add_branch(Branch::new(BranchKind::Line, b0, b1, 0.0, 0.0));

    let err = compile(&grid).unwrap_err();
    assert!(matches!(err, CompileError::ZeroImpedanceBranch(_)));

    let options = SolverOptions::default();
    let cancel = CancelToken::new();
    let err = solve_power_flow(&grid, &options, None, &mut no_progress, &cancel).unwrap_err();
    assert!(matches!(err, CompileError::ZeroImpedanceBranch(_)));
}
