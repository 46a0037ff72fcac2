//! PV/PQ reactive-limit control switching (SPEC_FULL.md §4.6).
//! Generalizes the teacher's `modify_qlim_system`
//! (`examples/chengts95-rustpower/src/basic/ecs/powerflow/qlim.rs`),
//! which only ever demotes PV -> PQ on a limit violation, to the full
//! switch-back-to-PV behavior of spec.md §4.6 (directly grounded on
//! GridCal's `control_q_direct`, called from
//! `examples/original_source/.../continuation_power_flow.py`'s
//! `continuation_nr`). Kept as a plain function over a caller-owned
//! `bus_types: &mut [BusType]`/`sbus: &mut [Complex64]` pair, per the
//! REDESIGN FLAGS note on mutable bus type during Q-control: neither
//! array lives on the frozen [`crate::compiler::NumericCircuit`].

use nalgebra::DVector;
use num_complex::Complex64;

use crate::compiler::NumericCircuit;
use crate::model::BusType;

/// Which buses are voltage-controlling in the *compiled* (unmutated)
/// circuit — the `control_buses` set spec.md §4.6 calls "originally
/// PV". Fixed for the lifetime of one solver call; computed once before
/// the outer loop starts.
pub fn control_buses(circuit: &NumericCircuit) -> Vec<bool> {
    circuit
        .bus_types
        .iter()
        .map(|t| matches!(t, BusType::PV | BusType::StoDispatch))
        .collect()
}

/// Applies one pass of spec.md §4.6's direct Q-limit control. Mutates
/// `bus_types` and `sbus` in place and resets `v[i]` to its set-point
/// magnitude wherever a bus switches back to PV. Returns `true` iff any
/// bus changed state or had its reactive injection clamped
/// (`any_issue` in the spec pseudocode) — the caller re-solves and
/// calls this again until it returns `false` or the outer-iteration cap
/// is reached.
pub fn apply_direct_control(
    circuit: &NumericCircuit,
    control_buses: &[bool],
    bus_types: &mut [BusType],
    v: &mut DVector<Complex64>,
    s_calc: &DVector<Complex64>,
    sbus: &mut [Complex64],
) -> bool {
    let mut any_issue = false;

    for i in 0..circuit.n {
        match bus_types[i] {
            BusType::Ref | BusType::None => continue,
            BusType::PQ if control_buses[i] => {
                // Was PV (or STO_DISPATCH), demoted to PQ by an earlier
                // pass. Only reconsider it while it still sits off its
                // set-point; once restored to PV this branch no longer
                // applies to it this call.
                let vset = circuit.vbus[i].norm();
                if (v[i].norm() - vset).abs() > 1e-9 {
                    let q = s_calc[i].im;
                    if q >= circuit.qmax[i] {
                        sbus[i] = Complex64::new(sbus[i].re, circuit.qmax[i]);
                        any_issue = true;
                    } else if q <= circuit.qmin[i] {
                        sbus[i] = Complex64::new(sbus[i].re, circuit.qmin[i]);
                        any_issue = true;
                    } else {
                        bus_types[i] = BusType::PV;
                        v[i] = Complex64::from_polar(vset, v[i].arg());
                        any_issue = true;
                        log::debug!("bus {i} restored to PV: Q back within [{}, {}]", circuit.qmin[i], circuit.qmax[i]);
                    }
                }
            }
            BusType::PQ => {}
            BusType::PV | BusType::StoDispatch => {
                let q = s_calc[i].im;
                if q >= circuit.qmax[i] {
                    bus_types[i] = BusType::PQ;
                    sbus[i] = Complex64::new(sbus[i].re, circuit.qmax[i]);
                    any_issue = true;
                    log::debug!("bus {i} demoted to PQ at Qmax={}", circuit.qmax[i]);
                } else if q <= circuit.qmin[i] {
                    bus_types[i] = BusType::PQ;
                    sbus[i] = Complex64::new(sbus[i].re, circuit.qmin[i]);
                    any_issue = true;
                    log::debug!("bus {i} demoted to PQ at Qmin={}", circuit.qmin[i]);
                }
            }
        }
    }

    any_issue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::model::{Branch, BranchKind, Bus, ControlledGenerator, Grid, Load, Zip};

    fn three_bus_grid() -> Grid {
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
        grid
    }

    #[test]
    fn demotes_pv_bus_exceeding_qmax() {
        let grid = three_bus_grid();
        let out = compile(&grid).unwrap();
        let circuit = &out.islands[0];
        let control = control_buses(circuit);
        let mut bus_types = circuit.bus_types.clone();
        let mut sbus: Vec<Complex64> = circuit.sbus.clone();
        let mut v = DVector::from_vec(circuit.vbus.clone());
        // Fabricate a solved state where the PV bus's calculated Q
        // overshoots its Qmax of 0.5 p.u. (50 MVAr / 100 MVA).
        let pv_i = circuit
            .bus_types
            .iter()
            .position(|t| *t == BusType::PV)
            .unwrap();
        let mut s_calc = DVector::from_vec(circuit.sbus.clone());
        s_calc[pv_i] = Complex64::new(s_calc[pv_i].re, 0.8);

        let any_issue = apply_direct_control(circuit, &control, &mut bus_types, &mut v, &s_calc, &mut sbus);

        assert!(any_issue);
        assert_eq!(bus_types[pv_i], BusType::PQ);
        assert!((sbus[pv_i].im - circuit.qmax[pv_i]).abs() < 1e-12);
    }

    #[test]
    fn no_issue_when_within_limits() {
        let grid = three_bus_grid();
        let out = compile(&grid).unwrap();
        let circuit = &out.islands[0];
        let control = control_buses(circuit);
        let mut bus_types = circuit.bus_types.clone();
        let mut sbus: Vec<Complex64> = circuit.sbus.clone();
        let mut v = DVector::from_vec(circuit.vbus.clone());
        let s_calc = DVector::from_vec(circuit.sbus.clone());

        let any_issue = apply_direct_control(circuit, &control, &mut bus_types, &mut v, &s_calc, &mut sbus);
        assert!(!any_issue);
        assert_eq!(bus_types, circuit.bus_types);
    }
}
