//! Continuation power flow (SPEC_FULL.md §4.8). **[ADD]** in full — the
//! teacher has no analogue. Directly grounded on
//! `examples/original_source/.../continuation_power_flow.py`'s
//! `cpf_p`/`cpf_p_jac`/`predictor`/`corrector`/`continuation_nr`
//! (itself ported from MATPOWER's `runcpf.m`), translated onto this
//! crate's [`crate::compiler::NumericCircuit`]/index-set/sparse-matrix
//! conventions. The three parametrizations, the backtracking corrector,
//! the step-adaptation rule, the `Nose`/`Full`/`ExtraOverloads` stopping
//! criteria, and the optional distributed-slack re-solve are carried
//! over unchanged in semantics.

use std::collections::HashMap;

use bevy_ecs::prelude::Entity;
use nalgebra::DVector;
use nalgebra_sparse::CooMatrix;
use nalgebra_sparse::CscMatrix;
use num_complex::Complex64;

use crate::compiler::{self, NumericCircuit};
use crate::error::CompileError;
use crate::model::Grid;
use crate::progress::{CancelToken, Progress, ProgressCallback};
use crate::solver::dsbus_dv::dSbus_dV;
use crate::solver::newton::{build_jacobian, csc_raw};
use crate::solver::qlimit;
use crate::solver::{QControlMode, index_sets, s_calc_of};
use crate::solver::postprocess::branch_flows;
use crate::sparse::{RSparseSolver, Solve, csc_hstack, csc_vstack};

/// Which of spec.md §4.8's three parametrization functions drives the
/// predictor/corrector tangent and the stopping condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parametrization {
    Natural,
    ArcLength,
    PseudoArcLength,
}

/// Where to stop tracing the trajectory (spec.md §4.8 "Stopping criteria").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoppingCriterion {
    Nose,
    Full,
    ExtraOverloads,
}

#[derive(Debug, Clone, Copy)]
pub struct CpfOptions {
    pub parametrization: Parametrization,
    pub initial_step: f64,
    pub step_min: f64,
    pub step_max: f64,
    pub adapt_step: bool,
    pub error_tol: f64,
    pub corrector_tol: f64,
    pub max_corrector_it: usize,
    pub stop_at: StoppingCriterion,
    pub baseline_overload_count: Option<usize>,
    /// Backtracking step-size multiplier in (0, 1) (spec.md §4.8 "Corrector").
    pub acceleration_parameter: f64,
    pub q_control_mode: QControlMode,
    pub max_outer_iterations: usize,
    pub distributed_slack: bool,
    /// Hard cap on continuation steps, independent of `stop_at`, so a
    /// misbehaving trajectory cannot loop forever.
    pub max_steps: usize,
}

impl Default for CpfOptions {
    fn default() -> Self {
        Self {
            parametrization: Parametrization::ArcLength,
            initial_step: 0.05,
            step_min: 0.01,
            step_max: 0.2,
            adapt_step: true,
            error_tol: 1e-3,
            corrector_tol: 1e-6,
            max_corrector_it: 20,
            stop_at: StoppingCriterion::Nose,
            baseline_overload_count: None,
            acceleration_parameter: 0.5,
            q_control_mode: QControlMode::Off,
            max_outer_iterations: 10,
            distributed_slack: false,
            max_steps: 2000,
        }
    }
}

/// One converged (or final, partially-converged) point of the
/// trajectory (spec.md §4.8 "Output per step").
#[derive(Debug, Clone)]
pub struct CpfStep {
    pub v: Vec<Complex64>,
    pub s_calc: Vec<Complex64>,
    pub lambda: f64,
    pub s_f: Vec<Complex64>,
    pub s_t: Vec<Complex64>,
    pub losses: Vec<Complex64>,
    pub loading: Vec<f64>,
    pub residual: f64,
    pub converged: bool,
}

/// The trajectory traced for one island, in strictly increasing step
/// index (SPEC_FULL.md §5 "Ordering").
#[derive(Debug, Clone, Default)]
pub struct IslandCpfResult {
    pub bus_entities: Vec<Entity>,
    pub branch_entities: Vec<Entity>,
    pub steps: Vec<CpfStep>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CpfResult {
    pub islands: Vec<IslandCpfResult>,
}

/// Traces the continuation power flow for every island of `grid` from a
/// caller-supplied converged base case (`v_base`, keyed by bus
/// [`Entity`]) towards `s_target` (also keyed by bus `Entity`; buses
/// absent from the map keep their compiled `circuit.sbus` value).
///
/// The base-case injection `S_base` in spec.md §4.8 is always the
/// compiler's own `circuit.sbus` — this crate does not accept an
/// independent `S_base` override, since it would have to agree with
/// `v_base`'s power-flow solution to produce a meaningful transfer
/// vector; a caller wanting a different base case recompiles a `Grid`
/// with those injections instead (an Open Question resolution recorded
/// in DESIGN.md).
pub fn run_continuation(
    grid: &Grid,
    cpf_options: &CpfOptions,
    v_base: &HashMap<Entity, Complex64>,
    s_target: &HashMap<Entity, Complex64>,
    progress: &mut ProgressCallback,
    cancel: &CancelToken,
) -> Result<CpfResult, CompileError> {
    let compiled = compiler::compile(grid)?;
    let mut islands = Vec::with_capacity(compiled.islands.len());

    for circuit in &compiled.islands {
        if circuit.is_trivial() || circuit.reference().is_empty() {
            islands.push(IslandCpfResult {
                bus_entities: circuit.bus_entities.clone(),
                branch_entities: circuit.branch_entities.clone(),
                steps: Vec::new(),
                cancelled: false,
            });
            continue;
        }

        let v0 = gather_v0(circuit, v_base);
        let s_tgt = gather_s_target(circuit, s_target);
        islands.push(run_island(circuit, cpf_options, &v0, &s_tgt, progress, cancel));
    }

    Ok(CpfResult { islands })
}

fn gather_v0(circuit: &NumericCircuit, v_base: &HashMap<Entity, Complex64>) -> DVector<Complex64> {
    let mut v = circuit.vbus.clone();
    for (i, &bus) in circuit.bus_entities.iter().enumerate() {
        if let Some(&ov) = v_base.get(&bus) {
            v[i] = ov;
        }
    }
    DVector::from_vec(v)
}

fn gather_s_target(circuit: &NumericCircuit, s_target: &HashMap<Entity, Complex64>) -> DVector<Complex64> {
    let mut s = circuit.sbus.clone();
    for (i, &bus) in circuit.bus_entities.iter().enumerate() {
        if let Some(&ov) = s_target.get(&bus) {
            s[i] = ov;
        }
    }
    DVector::from_vec(s)
}

fn inf_norm_vec(v: &[f64]) -> f64 {
    v.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()))
}

/// Builds `Jsparse_csc` a (nj+1)x(nj+1) CSC augmented system
/// `[[J, dF_dlam], [dP_dV, dP_dlam]]` (spec.md §4.8 "Predictor"/
/// "Corrector") by reusing the teacher's `csc_hstack`/`csc_vstack`
/// block-assembly helpers instead of densifying the Jacobian.
fn augmented_jacobian(jac: &CscMatrix<f64>, df_dlam: &[f64], dp_dv: &[f64], dp_dlam: f64) -> CscMatrix<f64> {
    let nj = jac.nrows();
    let mut col_coo = CooMatrix::new(nj, 1);
    for (i, &v) in df_dlam.iter().enumerate() {
        if v != 0.0 {
            col_coo.push(i, 0, v);
        }
    }
    let last_col: CscMatrix<f64> = CscMatrix::from(&col_coo);
    let top = csc_hstack(&[jac, &last_col]);

    let mut row_coo = CooMatrix::new(1, nj + 1);
    for (i, &v) in dp_dv.iter().enumerate() {
        if v != 0.0 {
            row_coo.push(0, i, v);
        }
    }
    row_coo.push(0, nj, dp_dlam);
    let last_row: CscMatrix<f64> = CscMatrix::from(&row_coo);

    csc_vstack(&[&top, &last_row])
}

/// Value of the parametrization function P(V, lambda) (spec.md §4.8).
#[allow(clippy::too_many_arguments)]
fn cpf_p(
    parametrization: Parametrization,
    step: f64,
    z: &DVector<f64>,
    v: &DVector<Complex64>,
    lam: f64,
    v_prev: &DVector<Complex64>,
    lam_prev: f64,
    pvpq: &[usize],
    pq: &[usize],
    n: usize,
) -> f64 {
    match parametrization {
        Parametrization::Natural => {
            if lam >= lam_prev {
                lam - lam_prev - step
            } else {
                lam_prev - lam - step
            }
        }
        Parametrization::ArcLength => {
            let mut sum = 0.0;
            for &i in pvpq {
                let d = v[i].arg() - v_prev[i].arg();
                sum += d * d;
            }
            for &i in pq {
                let d = v[i].norm() - v_prev[i].norm();
                sum += d * d;
            }
            let dl = lam - lam_prev;
            sum += dl * dl;
            sum - step * step
        }
        Parametrization::PseudoArcLength => {
            let mut dot = 0.0;
            for &i in pvpq {
                dot += z[i] * (v[i].arg() - v_prev[i].arg());
            }
            for &i in pq {
                dot += z[n + i] * (v[i].norm() - v_prev[i].norm());
            }
            dot += z[2 * n] * (lam - lam_prev);
            dot - step
        }
    }
}

/// Partial derivatives of P w.r.t. V (ordered `[pvpq angles, pq
/// magnitudes]`, matching the Jacobian's column order) and lambda.
#[allow(clippy::too_many_arguments)]
fn cpf_p_jac(
    parametrization: Parametrization,
    z: &DVector<f64>,
    v: &DVector<Complex64>,
    lam: f64,
    v_prev: &DVector<Complex64>,
    lam_prev: f64,
    pvpq: &[usize],
    pq: &[usize],
    n: usize,
) -> (Vec<f64>, f64) {
    match parametrization {
        Parametrization::Natural => {
            let dp_dv = vec![0.0; pvpq.len() + pq.len()];
            let dp_dlam = if lam >= lam_prev { 1.0 } else { -1.0 };
            (dp_dv, dp_dlam)
        }
        Parametrization::ArcLength => {
            let mut dp_dv = Vec::with_capacity(pvpq.len() + pq.len());
            for &i in pvpq {
                dp_dv.push(2.0 * (v[i].arg() - v_prev[i].arg()));
            }
            for &i in pq {
                dp_dv.push(2.0 * (v[i].norm() - v_prev[i].norm()));
            }
            let dp_dlam = if (lam - lam_prev).abs() < 1e-15 {
                1.0
            } else {
                2.0 * (lam - lam_prev)
            };
            (dp_dv, dp_dlam)
        }
        Parametrization::PseudoArcLength => {
            let mut dp_dv = Vec::with_capacity(pvpq.len() + pq.len());
            for &i in pvpq {
                dp_dv.push(z[i]);
            }
            for &i in pq {
                dp_dv.push(z[n + i]);
            }
            (dp_dv, z[2 * n])
        }
    }
}

/// spec.md §4.8 "Predictor": tangent vector via the augmented Jacobian
/// system, normalized, then one step of length `step` along it.
#[allow(clippy::too_many_arguments)]
fn predictor(
    circuit: &NumericCircuit,
    v: &DVector<Complex64>,
    lam: f64,
    sxfr: &DVector<Complex64>,
    pv: &[usize],
    pq: &[usize],
    step: f64,
    z: &DVector<f64>,
    v_prev: &DVector<Complex64>,
    lam_prev: f64,
    parametrization: Parametrization,
) -> (DVector<Complex64>, f64, DVector<f64>) {
    let n = circuit.n;
    let pvpq: Vec<usize> = pv.iter().chain(pq.iter()).copied().collect();
    let nj = pv.len() + 2 * pq.len();

    let vnorm = DVector::from_iterator(n, v.iter().map(|x| x / x.norm()));
    let (d_s_d_vm, d_s_d_va) = dSbus_dV(&circuit.ybus, v, &vnorm);
    let jac = build_jacobian(&d_s_d_va, &d_s_d_vm, &pvpq, pq);

    let mut df_dlam = Vec::with_capacity(nj);
    for &i in &pvpq {
        df_dlam.push(-sxfr[i].re);
    }
    for &i in pq {
        df_dlam.push(-sxfr[i].im);
    }

    let (dp_dv, dp_dlam) = cpf_p_jac(parametrization, z, v, lam, v_prev, lam_prev, &pvpq, pq, n);
    let aug = augmented_jacobian(&jac, &df_dlam, &dp_dv, dp_dlam);
    let (mut ap, mut ai, mut ax) = csc_raw(&aug);
    let mut rhs = vec![0.0; nj + 1];
    rhs[nj] = 1.0;

    let mut solver = RSparseSolver::default();
    let mut z_new = DVector::zeros(2 * n + 1);
    if solver.solve(&mut ap, &mut ai, &mut ax, &mut rhs, nj + 1).is_ok() {
        for (k, &i) in pvpq.iter().enumerate() {
            z_new[i] = rhs[k];
        }
        for (k, &i) in pq.iter().enumerate() {
            z_new[n + i] = rhs[pvpq.len() + k];
        }
        z_new[2 * n] = rhs[nj];
        let norm = z_new.norm();
        if norm > 1e-14 {
            z_new /= norm;
        }
    }

    let mut va: Vec<f64> = v.iter().map(|c| c.arg()).collect();
    let mut vm: Vec<f64> = v.iter().map(|c| c.norm()).collect();
    for &i in &pvpq {
        va[i] += step * z_new[i];
    }
    for &i in pq {
        vm[i] += step * z_new[n + i];
    }
    let lam0 = lam + step * z_new[2 * n];
    let v0 = DVector::from_iterator(n, va.iter().zip(vm.iter()).map(|(&a, &m)| Complex64::from_polar(m, a)));

    (v0, lam0, z_new)
}

struct CorrectorOutcome {
    v: DVector<Complex64>,
    s_calc: DVector<Complex64>,
    converged: bool,
    iterations: usize,
    lam: f64,
    residual: f64,
}

/// spec.md §4.8 "Corrector": full Newton on the augmented system
/// `[F(V, lambda); P(V, lambda)] = 0`, with backtracking line search on
/// a failed residual reduction.
#[allow(clippy::too_many_arguments)]
fn corrector(
    circuit: &NumericCircuit,
    sbus: &DVector<Complex64>,
    v0: &DVector<Complex64>,
    pv: &[usize],
    pq: &[usize],
    lam0: f64,
    sxfr: &DVector<Complex64>,
    v_prev: &DVector<Complex64>,
    lam_prev: f64,
    z: &DVector<f64>,
    step: f64,
    parametrization: Parametrization,
    tol: f64,
    max_it: usize,
    acceleration_parameter: f64,
) -> CorrectorOutcome {
    let n = circuit.n;
    let pvpq: Vec<usize> = pv.iter().chain(pq.iter()).copied().collect();
    let npv = pv.len();
    let npq = pq.len();
    let j2 = npv + npq;
    let j3 = j2 + npq;

    let mismatch_f = |v: &DVector<Complex64>, lam: f64| -> (DVector<Complex64>, Vec<f64>) {
        let s_calc = s_calc_of(&circuit.ybus, v);
        let lamc = Complex64::new(lam, 0.0);
        let mut f = Vec::with_capacity(j3 + 1);
        let mism: Vec<Complex64> = (0..n).map(|i| s_calc[i] - sbus[i] - lamc * sxfr[i]).collect();
        for &i in &pvpq {
            f.push(mism[i].re);
        }
        for &i in pq {
            f.push(mism[i].im);
        }
        (s_calc, f)
    };

    let mut va: Vec<f64> = v0.iter().map(|c| c.arg()).collect();
    let mut vm: Vec<f64> = v0.iter().map(|c| c.norm()).collect();
    let mut lam = lam0;
    let mut v = v0.clone();

    let (mut s_calc, mut f) = mismatch_f(&v, lam);
    f.push(cpf_p(parametrization, step, z, &v, lam, v_prev, lam_prev, &pvpq, pq, n));
    let mut norm_f = inf_norm_vec(&f);
    let mut converged = norm_f < tol;
    let mut iter = 0usize;

    while !converged && iter < max_it {
        iter += 1;

        let vnorm = DVector::from_iterator(n, v.iter().map(|x| x / x.norm()));
        let (d_s_d_vm, d_s_d_va) = dSbus_dV(&circuit.ybus, &v, &vnorm);
        let jac = build_jacobian(&d_s_d_va, &d_s_d_vm, &pvpq, pq);

        let mut df_dlam = Vec::with_capacity(j3);
        for &i in &pvpq {
            df_dlam.push(-sxfr[i].re);
        }
        for &i in pq {
            df_dlam.push(-sxfr[i].im);
        }
        let (dp_dv, dp_dlam) = cpf_p_jac(parametrization, z, &v, lam, v_prev, lam_prev, &pvpq, pq, n);
        let aug = augmented_jacobian(&jac, &df_dlam, &dp_dv, dp_dlam);
        let (mut ap, mut ai, mut ax) = csc_raw(&aug);
        let mut rhs = f.clone();

        let mut solver = RSparseSolver::default();
        if solver.solve(&mut ap, &mut ai, &mut ax, &mut rhs, j3 + 1).is_err() {
            return CorrectorOutcome {
                v,
                s_calc,
                converged: false,
                iterations: iter,
                lam,
                residual: norm_f,
            };
        }

        let d_va = rhs[0..j2].to_vec();
        let d_vm = rhs[j2..j3].to_vec();
        let d_lam = rhs[j3];

        let prev_va = va.clone();
        let prev_vm = vm.clone();
        let prev_lam = lam;

        let mut mu = 1.0f64;
        let mut l_iter = 0usize;
        let mut back_track = true;
        let mut norm_f_new = norm_f;

        while back_track && l_iter < max_it && mu > tol {
            if l_iter > 0 {
                va = prev_va.clone();
                vm = prev_vm.clone();
                lam = prev_lam;
            }
            for (k, &i) in pvpq.iter().enumerate() {
                va[i] -= mu * d_va[k];
            }
            for (k, &i) in pq.iter().enumerate() {
                vm[i] -= mu * d_vm[k];
            }
            lam -= mu * d_lam;

            v = DVector::from_iterator(n, va.iter().zip(vm.iter()).map(|(&a, &m)| Complex64::from_polar(m, a)));
            let (sc, mut f_new) = mismatch_f(&v, lam);
            f_new.push(cpf_p(parametrization, step, z, &v, lam, v_prev, lam_prev, &pvpq, pq, n));
            norm_f_new = inf_norm_vec(&f_new);
            s_calc = sc;
            f = f_new;

            back_track = norm_f_new > norm_f;
            mu *= acceleration_parameter;
            l_iter += 1;
        }

        if l_iter > 1 && back_track {
            va = prev_va;
            vm = prev_vm;
            lam = prev_lam;
            v = DVector::from_iterator(n, va.iter().zip(vm.iter()).map(|(&a, &m)| Complex64::from_polar(m, a)));
            return CorrectorOutcome {
                v,
                s_calc,
                converged: false,
                iterations: iter,
                lam,
                residual: norm_f,
            };
        }
        norm_f = norm_f_new;
        converged = norm_f < tol;
    }

    CorrectorOutcome {
        v,
        s_calc,
        converged,
        iterations: iter,
        lam,
        residual: norm_f,
    }
}

/// Traces one island's continuation power flow to the configured
/// stopping criterion (spec.md §4.8 "Outer loop"/"Stopping criteria").
fn run_island(
    circuit: &NumericCircuit,
    options: &CpfOptions,
    v_base: &DVector<Complex64>,
    s_target: &DVector<Complex64>,
    progress: &mut ProgressCallback,
    cancel: &CancelToken,
) -> IslandCpfResult {
    let n = circuit.n;
    let mut bus_types = circuit.bus_types.clone();
    let control = qlimit::control_buses(circuit);
    let mut sbus_base: Vec<Complex64> = circuit.sbus.clone();
    let mut sxfr = DVector::from_iterator(n, (0..n).map(|i| s_target[i] - sbus_base[i]));

    let mut lam = 0.0f64;
    let mut lam_prev = 0.0f64;
    let mut v = v_base.clone();
    let mut v_prev = v_base.clone();
    let mut z = DVector::zeros(2 * n + 1);
    z[2 * n] = 1.0;

    let mut step = options.initial_step;
    let mut parametrization = options.parametrization;
    let mut adapt_step = options.adapt_step;

    let total_installed: f64 = circuit.installed_mva.iter().sum();

    let mut steps = Vec::new();
    let mut cont_steps = 0usize;
    let mut cancelled = false;

    'outer: loop {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        if cont_steps >= options.max_steps {
            log::warn!("CPF trajectory hit the {}-step hard cap", options.max_steps);
            break;
        }
        cont_steps += 1;

        let (mut pv, mut pq, _refs) = index_sets(&bus_types);
        pv.sort_unstable();
        pq.sort_unstable();

        let sbus_base_v = DVector::from_vec(sbus_base.clone());

        let (v0, lam0, z_new) = predictor(circuit, &v, lam, &sxfr, &pv, &pq, step, &z, &v_prev, lam_prev, parametrization);
        z = z_new;
        v_prev = v.clone();
        lam_prev = lam;

        let corrected = corrector(
            circuit,
            &sbus_base_v,
            &v0,
            &pv,
            &pq,
            lam0,
            &sxfr,
            &v_prev,
            lam_prev,
            &z,
            step,
            parametrization,
            options.corrector_tol,
            options.max_corrector_it,
            options.acceleration_parameter,
        );

        if !corrected.converged {
            log::warn!("CPF corrector failed to converge at step {cont_steps}; terminating trajectory");
            break;
        }

        let (mut v_new, mut lam_new, mut s_calc_new) = (corrected.v, corrected.lam, corrected.s_calc);

        if options.distributed_slack && total_installed > 0.0 {
            let slack_power: f64 = circuit.reference().iter().map(|&i| s_calc_new[i].re).sum();
            let delta: Vec<Complex64> = circuit
                .installed_mva
                .iter()
                .map(|&p| Complex64::new(slack_power * p / total_installed, 0.0))
                .collect();
            let redistributed: Vec<Complex64> = sbus_base.iter().zip(delta.iter()).map(|(&s, &d)| s + d).collect();
            let redistributed_v = DVector::from_vec(redistributed);
            let recorrected = corrector(
                circuit,
                &redistributed_v,
                &v_new,
                &pv,
                &pq,
                lam_new,
                &sxfr,
                &v_prev,
                lam_prev,
                &z,
                step,
                parametrization,
                options.corrector_tol,
                options.max_corrector_it,
                options.acceleration_parameter,
            );
            if recorrected.converged {
                v_new = recorrected.v;
                lam_new = recorrected.lam;
                s_calc_new = recorrected.s_calc;
            }
        }

        let flows = branch_flows(circuit, &v_new);
        steps.push(CpfStep {
            v: v_new.iter().copied().collect(),
            s_calc: s_calc_new.iter().copied().collect(),
            lambda: lam_new,
            s_f: flows.s_f.clone(),
            s_t: flows.s_t.clone(),
            losses: flows.losses.clone(),
            loading: flows.loading.clone(),
            residual: corrected.residual,
            converged: true,
        });
        progress(Progress::CpfStep { lambda: lam_new });

        if options.q_control_mode == QControlMode::Direct {
            let mut v_mut = v_new.clone();
            let any_issue = qlimit::apply_direct_control(circuit, &control, &mut bus_types, &mut v_mut, &s_calc_new, &mut sbus_base);
            if any_issue {
                v_new = v_mut;
                sxfr = DVector::from_iterator(n, (0..n).map(|i| s_target[i] - sbus_base[i]));
            }
        }

        match options.stop_at {
            StoppingCriterion::Nose => {
                if lam_new < lam_prev {
                    break 'outer;
                }
            }
            StoppingCriterion::Full => {
                if lam_new.abs() < 1e-8 {
                    break 'outer;
                } else if lam_new < lam_prev && lam_new - step < 0.0 {
                    step = lam_new;
                    parametrization = Parametrization::Natural;
                    adapt_step = false;
                }
            }
            StoppingCriterion::ExtraOverloads => {
                let baseline = options.baseline_overload_count.unwrap_or(0);
                let overloaded = flows.loading.iter().filter(|&&l| l.abs() > 1.0).count();
                if overloaded > baseline {
                    break 'outer;
                }
            }
        }

        if adapt_step {
            let (pv2, pq2, _) = index_sets(&bus_types);
            let mut fx = Vec::with_capacity(pv2.len() + 2 * pq2.len());
            for &i in pv2.iter().chain(pq2.iter()) {
                fx.push(v_new[i].arg() - v0[i].arg());
            }
            for &i in &pq2 {
                fx.push(v_new[i].norm() - v0[i].norm());
            }
            fx.push(lam_new - lam0);
            let mut cpf_error = inf_norm_vec(&fx);
            if cpf_error == 0.0 {
                cpf_error = 1e-20;
            }
            step = (step * options.error_tol / cpf_error).clamp(options.step_min, options.step_max);
        }

        v = v_new;
        lam = lam_new;
    }

    IslandCpfResult {
        bus_entities: circuit.bus_entities.clone(),
        branch_entities: circuit.branch_entities.clone(),
        steps,
        cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Branch, BranchKind, Bus, Load, Zip};
    use crate::solver::SolverOptions;
    use crate::solver::driver::solve_power_flow;

    fn two_bus_grid() -> Grid {
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
        grid
    }

    #[test]
    fn traces_a_few_steps_of_increasing_lambda() {
        let grid = two_bus_grid();
        let cancel = CancelToken::new();
        let base = solve_power_flow(&grid, &SolverOptions::default(), None, &mut |_| {}, &cancel).unwrap();
        assert!(base.all_converged());

        let island = &base.islands[0];
        let mut v_base = HashMap::new();
        for (i, &e) in island.bus_entities.iter().enumerate() {
            v_base.insert(e, island.v[i]);
        }
        let circuit = &compiler::compile(&grid).unwrap().islands[0];
        let mut s_target = HashMap::new();
        for (i, &e) in circuit.bus_entities.iter().enumerate() {
            s_target.insert(e, circuit.sbus[i] * 1.5);
        }

        let options = CpfOptions {
            stop_at: StoppingCriterion::Nose,
            ..Default::default()
        };
        let result = run_continuation(&grid, &options, &v_base, &s_target, &mut |_| {}, &cancel).unwrap();

        let traced = &result.islands[0];
        assert!(!traced.steps.is_empty());
        assert!(traced.steps.iter().all(|s| s.converged));
        // Every step's flows still close the power balance at that point
        // of the trajectory, independent of the nose-finding logic.
        for step in &traced.steps {
            assert!((step.s_f[0] + step.s_t[0] - step.losses[0]).norm() < 1e-6);
        }
    }

    #[test]
    fn max_steps_hard_cap_bounds_the_trajectory() {
        let grid = two_bus_grid();
        let cancel = CancelToken::new();
        let base = solve_power_flow(&grid, &SolverOptions::default(), None, &mut |_| {}, &cancel).unwrap();
        let island = &base.islands[0];
        let mut v_base = HashMap::new();
        for (i, &e) in island.bus_entities.iter().enumerate() {
            v_base.insert(e, island.v[i]);
        }
        let circuit = &compiler::compile(&grid).unwrap().islands[0];
        let mut s_target = HashMap::new();
        for (i, &e) in circuit.bus_entities.iter().enumerate() {
            s_target.insert(e, circuit.sbus[i] * 5.0);
        }

        let options = CpfOptions {
            max_steps: 1,
            ..Default::default()
        };
        let result = run_continuation(&grid, &options, &v_base, &s_target, &mut |_| {}, &cancel).unwrap();
        assert!(result.islands[0].steps.len() <= 1);
    }
}
