use bevy_ecs::prelude::*;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Points a device entity back at the bus it is attached to. The
/// arena-allocated replacement for the "bus owns device, device
/// references bus" cycle flagged in SPEC_FULL.md §9 REDESIGN FLAGS.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetBus(pub Entity);

/// The ZIP load triple: constant-impedance (Ω), constant-current (kA),
/// and constant-power (MVA) components, each complex. Loads consume —
/// positive `s` reduces net bus injection.
#[derive(Component, Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Zip {
    pub z: Complex64,
    pub i: Complex64,
    pub s: Complex64,
}

#[derive(Component, Debug, Clone, Copy, Default)]
pub struct Load {
    pub zip: Zip,
    pub active: bool,
}

/// A voltage-controlling generator (or battery dispatched as one).
#[derive(Component, Debug, Clone, Copy)]
pub struct ControlledGenerator {
    pub p_mw: f64,
    pub v_set_pu: f64,
    pub q_min_mvar: f64,
    pub q_max_mvar: f64,
    pub s_nom_mva: f64,
    pub is_slack: bool,
    pub active: bool,
}

impl Default for ControlledGenerator {
    fn default() -> Self {
        Self {
            p_mw: 0.0,
            v_set_pu: 1.0,
            q_min_mvar: f64::NEG_INFINITY,
            q_max_mvar: f64::INFINITY,
            s_nom_mva: 0.0,
            is_slack: false,
            active: true,
        }
    }
}

/// A battery: identical to [`ControlledGenerator`] for solver purposes
/// when dispatched as generation, plus an energy capacity the solver
/// never reads (relevant to the out-of-scope time-series driver only).
#[derive(Component, Debug, Clone, Copy)]
pub struct Battery {
    pub p_mw: f64,
    pub v_set_pu: f64,
    pub q_min_mvar: f64,
    pub q_max_mvar: f64,
    pub e_nom_mwh: f64,
    /// STO_DISPATCH bus-type flag (SPEC_FULL.md §4.1 decision table).
    pub dispatch_storage: bool,
    pub active: bool,
}

impl Default for Battery {
    fn default() -> Self {
        Self {
            p_mw: 0.0,
            v_set_pu: 1.0,
            q_min_mvar: f64::NEG_INFINITY,
            q_max_mvar: f64::INFINITY,
            e_nom_mwh: 0.0,
            dispatch_storage: false,
            active: true,
        }
    }
}

/// A pure injection device: does not control voltage.
#[derive(Component, Debug, Clone, Copy, Default)]
pub struct StaticGenerator {
    pub s_mva: Complex64,
    pub active: bool,
}

#[derive(Component, Debug, Clone, Copy, Default)]
pub struct Shunt {
    pub y_s: Complex64,
    pub active: bool,
}
