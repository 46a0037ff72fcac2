use bevy_ecs::prelude::*;
use serde::{Deserialize, Serialize};

/// Compiled bus classification. Wire values fixed for persistence/interop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BusType {
    PQ = 1,
    PV = 2,
    Ref = 3,
    None = 4,
    StoDispatch = 5,
}

/// A node of the electrical network.
///
/// Devices attached to a bus do not live on this component: they are
/// separate entities carrying a [`crate::model::devices::TargetBus`]
/// pointing back here, so there is no owning `Vec` of children and no
/// reference cycle.
#[derive(Component, Debug, Clone, Serialize, Deserialize)]
pub struct Bus {
    pub name: String,
    /// Nominal voltage, kV.
    pub vn_kv: f64,
    pub vm_min_pu: f64,
    pub vm_max_pu: f64,
    pub x: f64,
    pub y: f64,
    /// Manual slack flag; combines with attached-device state at compile
    /// time to derive [`BusType`] (see the decision table in SPEC_FULL.md §4.1).
    pub is_slack: bool,
    pub active: bool,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            name: String::new(),
            vn_kv: 1.0,
            vm_min_pu: 0.9,
            vm_max_pu: 1.1,
            x: 0.0,
            y: 0.0,
            is_slack: false,
            active: true,
        }
    }
}

/// Stable external identifier for a bus, independent of the compiler's
/// dense 0..N numbering (which is an implementation detail of a single
/// compilation and is not guaranteed stable across recompiles).
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusId(pub u64);
