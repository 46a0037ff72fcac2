//! DC (linearized) power-flow kernel (SPEC_FULL.md §4.4), absent from
//! the teacher entirely. Solves B'·θ = P with all magnitudes pinned at
//! 1 p.u. and the reference bus's angle held at 0.

use nalgebra::DVector;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use num_complex::Complex64;

use crate::compiler::NumericCircuit;
use crate::model::BusType;
use crate::progress::{CancelToken, Progress, ProgressCallback};
use crate::sparse::{RSparseSolver, Solve};

use super::{Kernel, KernelOutcome};

pub struct DcKernel;

impl Kernel for DcKernel {
    fn solve(
        &self,
        circuit: &NumericCircuit,
        bus_types: &[BusType],
        _v0: &DVector<Complex64>,
        _options: &crate::solver::SolverOptions,
        progress: &mut ProgressCallback,
        _cancel: &CancelToken,
    ) -> KernelOutcome {
        let n = circuit.n;
        let non_ref: Vec<usize> = bus_types
            .iter()
            .enumerate()
            .filter_map(|(i, t)| (*t != BusType::Ref).then_some(i))
            .collect();

        if non_ref.is_empty() {
            let v = DVector::from_element(n, Complex64::new(1.0, 0.0));
            let s_calc = super::s_calc_of(&circuit.ybus, &v);
            return KernelOutcome {
                v,
                s_calc,
                converged: true,
                iterations: 1,
                residual: 0.0,
                cancelled: false,
            };
        }

        // B' is the imaginary part of Yseries restricted to non-reference
        // buses (shunts excluded, per the standard DC assumptions).
        let mut col_of: std::collections::HashMap<usize, usize> = std::collections::HashMap::new();
        for (k, &i) in non_ref.iter().enumerate() {
            col_of.insert(i, k);
        }
        let dim = non_ref.len();
        let mut coo = CooMatrix::new(dim, dim);
        for (r, c, v) in circuit.yseries.triplet_iter() {
            if let (Some(&lr), Some(&lc)) = (col_of.get(&r), col_of.get(&c)) {
                coo.push(lr, lc, v.im);
            }
        }
        let b_prime: CscMatrix<f64> = CscMatrix::from(&coo);

        let p: Vec<f64> = non_ref.iter().map(|&i| circuit.sbus[i].re).collect();
        let mut rhs = p.clone();
        let mut ap = b_prime.col_offsets().to_vec();
        let mut ai = b_prime.row_indices().to_vec();
        let mut ax = b_prime.values().to_vec();

        let mut solver = RSparseSolver::default();
        let solved = solver.solve(&mut ap, &mut ai, &mut ax, &mut rhs, dim).is_ok();

        let mut theta = vec![0.0_f64; n];
        if solved {
            for (k, &i) in non_ref.iter().enumerate() {
                theta[i] = rhs[k];
            }
        }

        let v = DVector::from_iterator(n, theta.iter().map(|&th| Complex64::from_polar(1.0, th)));
        let s_calc = super::s_calc_of(&circuit.ybus, &v);
        progress(Progress::Iteration { fraction: 1.0 });

        KernelOutcome {
            v,
            s_calc,
            converged: solved,
            iterations: 1,
            residual: 0.0,
            cancelled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::model::{Branch, BranchKind, Bus, Grid, Load, Zip};
    use crate::progress::CancelToken;

    fn two_bus_grid(p: f64) -> Grid {
        let mut grid = Grid::new(100.0, 60.0);
        let b0 = grid.add_bus(Bus {
            is_slack: true,
            ..Default::default()
        });
        let b1 = grid.add_bus(Bus::default());
        grid.add_branch(Branch::new(BranchKind::Line, b0, b1, 0.0, 0.1));
        grid.add_load(
            b1,
            Load {
                zip: Zip {
                    s: Complex64::new(p, 0.0),
                    ..Default::default()
                },
                active: true,
            },
        );
        grid
    }

    #[test]
    fn doubling_injection_doubles_angle_deviation() {
        let circuit_a = compile(&two_bus_grid(0.1)).unwrap().islands.into_iter().next().unwrap();
        let circuit_b = compile(&two_bus_grid(0.2)).unwrap().islands.into_iter().next().unwrap();

        let v0 = DVector::from_element(2, Complex64::new(1.0, 0.0));
        let options = crate::solver::SolverOptions::default();
        let cancel = CancelToken::new();

        let out_a = DcKernel.solve(&circuit_a, &circuit_a.bus_types, &v0, &options, &mut |_| {}, &cancel);
        let out_b = DcKernel.solve(&circuit_b, &circuit_b.bus_types, &v0, &options, &mut |_| {}, &cancel);

        assert!(out_a.converged && out_b.converged);
        let theta_a = out_a.v[1].arg();
        let theta_b = out_b.v[1].arg();
        assert!((theta_b - 2.0 * theta_a).abs() < 1e-9);
    }
}
