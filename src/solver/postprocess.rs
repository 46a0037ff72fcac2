//! Branch post-processing: flows, losses, current magnitude, and
//! loading (SPEC_FULL.md §4.7). Grounded on GridCal's branch-value block
//! in `continuation_nr`
//! (`examples/original_source/.../continuation_power_flow.py`, the
//! `Sf`/`St`/`losses`/`loading` computation after a converged
//! corrector) — the teacher has no equivalent of its own.

use nalgebra::DVector;
use num_complex::Complex64;

use crate::compiler::NumericCircuit;

/// Per-branch results of spec.md §4.7's post-processing formulas, in
/// MVA (flows, losses) and per-unit (current, dimensionless loading).
#[derive(Debug, Clone, Default)]
pub struct BranchFlows {
    pub s_f: Vec<Complex64>,
    pub s_t: Vec<Complex64>,
    pub losses: Vec<Complex64>,
    pub i_branch: Vec<f64>,
    pub loading: Vec<f64>,
}

/// Computes `S_f`, `S_t`, `losses`, `I_branch`, and `loading` for every
/// branch in `circuit` given the converged bus voltage vector `v`.
pub fn branch_flows(circuit: &NumericCircuit, v: &DVector<Complex64>) -> BranchFlows {
    if circuit.m == 0 {
        return BranchFlows::default();
    }

    let i_f = &circuit.yf * v;
    let i_t = &circuit.yt * v;
    let sbase = circuit.sbase_mva;

    let mut out = BranchFlows {
        s_f: Vec::with_capacity(circuit.m),
        s_t: Vec::with_capacity(circuit.m),
        losses: Vec::with_capacity(circuit.m),
        i_branch: Vec::with_capacity(circuit.m),
        loading: Vec::with_capacity(circuit.m),
    };

    for b in 0..circuit.m {
        let v_f = v[circuit.f[b]];
        let v_t = v[circuit.t[b]];
        let s_f = v_f * i_f[b].conj() * sbase;
        let s_t = v_t * i_t[b].conj() * sbase;
        let losses = s_f + s_t;
        let i_branch = i_f[b].norm().max(i_t[b].norm());
        let loading = s_f.norm().max(s_t.norm()) / circuit.branch_rate[b].max(1e-9);

        out.s_f.push(s_f);
        out.s_t.push(s_t);
        out.losses.push(losses);
        out.i_branch.push(i_branch);
        out.loading.push(loading);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::model::{Branch, BranchKind, Bus, Grid, Load, Zip};
    use crate::progress::CancelToken;
    use crate::solver::newton::NewtonRaphson;
    use crate::solver::{Kernel, SolverOptions};

    #[test]
    fn flow_conservation_matches_losses() {
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

        let out = compile(&grid).unwrap();
        let circuit = &out.islands[0];
        let v0 = DVector::from_vec(circuit.vbus.clone());
        let options = SolverOptions {
            tolerance: 1e-10,
            ..Default::default()
        };
        let cancel = CancelToken::new();
        let outcome = NewtonRaphson.solve(circuit, &circuit.bus_types, &v0, &options, &mut |_| {}, &cancel);
        assert!(outcome.converged);

        let flows = branch_flows(circuit, &outcome.v);
        assert_eq!(flows.s_f.len(), 1);
        assert!((flows.s_f[0] + flows.s_t[0] - flows.losses[0]).norm() < 1e-9);
        // A line feeding a load draws strictly positive real loss.
        assert!(flows.losses[0].re > 0.0);
    }
}
