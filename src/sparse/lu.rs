//! Sparse LU backend used by the Newton-family kernels to solve the
//! Jacobian system each iteration. Grounded on the teacher's rsparse
//! binding; the `Solve` contract is reshaped to return a structured
//! [`crate::error::SingularMatrix`] instead of a string, per SPEC_FULL.md
//! §4.2, so kernels can fold a factorization failure into a
//! [`crate::solver::KernelOutcome`] instead of matching on text.

use rsparse::{
    self,
    data::{self, Numeric, Symb},
    lsolve, lu, sqr, usolve,
};

use crate::error::SingularMatrix;

/// A reusable sparse direct solver for `A x = b` systems sharing a
/// sparsity pattern across repeated calls (one call per Newton
/// iteration). Caches the symbolic factorization until [`Solve::reset`]
/// is called, since the Jacobian's sparsity pattern is stable across
/// iterations of a single power-flow solve but not across different
/// circuits or islands.
pub trait Solve {
    /// Factorizes `A` (CSC, given by `ap`/`ai`/`ax`) and solves `A x = b`
    /// in place, overwriting `b` with the solution.
    fn solve(
        &mut self,
        ap: &mut [usize],
        ai: &mut [usize],
        ax: &mut [f64],
        b: &mut [f64],
        n: usize,
    ) -> Result<(), SingularMatrix>;

    /// Drops any cached symbolic factorization, forcing the next
    /// `solve` call to re-analyze the sparsity pattern.
    fn reset(&mut self);
}

/// `Solve` backed by the pure-Rust `rsparse` crate (left-looking sparse
/// LU with column AMD ordering).
#[derive(Default)]
pub struct RSparseSolver {
    x: Option<Vec<f64>>,
    symbolic: Option<Symb>,
}

#[allow(non_snake_case)]
impl Solve for RSparseSolver {
    fn solve(
        &mut self,
        ap: &mut [usize],
        ai: &mut [usize],
        ax: &mut [f64],
        b: &mut [f64],
        _n: usize,
    ) -> Result<(), SingularMatrix> {
        let n = ap.len() - 1;
        let p: Vec<isize> = ap.iter().map(|&v| v as isize).collect();
        let a = data::Sprs {
            m: n,
            n,
            i: ai.to_vec(),
            p,
            x: ax.to_vec(),
            nzmax: ax.len(),
        };
        if self.symbolic.is_none() {
            self.symbolic = Some(sqr(&a, 1, false));
            self.x = Some(vec![0.0; n]);
        }
        let x = self.x.as_mut().unwrap();
        let s = self.symbolic.as_mut().unwrap();
        let numeric = lu(&a, s, 1e-6).map_err(|_| SingularMatrix)?;
        ipvec(&numeric.pinv, b, &mut x[..]);
        lsolve(&numeric.l, x);
        usolve(&numeric.u, x);
        ipvec(&s.q, x, &mut b[..]);
        Ok(())
    }

    fn reset(&mut self) {
        self.symbolic = None;
    }
}

fn ipvec_identity<T: Numeric<T>>(b: &[T], x: &mut [T]) {
    x.copy_from_slice(b);
}

fn ipvec_perm<T: Numeric<T>>(p: &[isize], b: &[T], x: &mut [T]) {
    for k in 0..b.len() {
        x[p[k] as usize] = b[k];
    }
}

fn ipvec<T: Numeric<T>>(p: &Option<Vec<isize>>, b: &[T], x: &mut [T]) {
    match p {
        Some(pvec) => ipvec_perm(pvec, b, x),
        None => ipvec_identity(b, x),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solves_a_small_diagonal_system() {
        // A = diag(2, 4), b = [4, 8] -> x = [2, 2]
        let mut ap = vec![0, 1, 2];
        let mut ai = vec![0, 1];
        let mut ax = vec![2.0, 4.0];
        let mut b = vec![4.0, 8.0];
        let mut solver = RSparseSolver::default();
        solver.solve(&mut ap, &mut ai, &mut ax, &mut b, 2).unwrap();
        assert!((b[0] - 2.0).abs() < 1e-9);
        assert!((b[1] - 2.0).abs() < 1e-9);
    }
}
