use bevy_ecs::prelude::*;
use serde::{Deserialize, Serialize};

/// Distinguishes the five branch variants named in SPEC_FULL.md §3. All
/// share the common series/shunt/tap fields below; `kind` only affects
/// how a host chooses defaults and how it labels the branch — the
/// compiler's admittance-assembly rule (§4.1) treats every variant the
/// same way, per the teacher's single `AdmittanceBranch` shape
/// (`examples/chengts95-rustpower/src/basic/system/system.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchKind {
    Line,
    Transformer,
    DcLine,
    Vsc,
    Upfc,
}

/// An edge of the network: a line, transformer, DC line, VSC, or UPFC.
///
/// `from`/`to` are bus entities (non-owning references, per SPEC_FULL.md
/// §3 ownership rules). The compiler resolves them to dense indices.
#[derive(Component, Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub kind: BranchKind,
    #[serde(with = "entity_serde")]
    pub from: Entity,
    #[serde(with = "entity_serde")]
    pub to: Entity,
    /// Series resistance, p.u.
    pub r: f64,
    /// Series reactance, p.u.
    pub x: f64,
    /// Total shunt conductance (line charging), p.u., halved at each end.
    pub g: f64,
    /// Total shunt susceptance (line charging), p.u., halved at each end.
    pub b: f64,
    /// Tap module |t|.
    pub tap_m: f64,
    /// Tap phase shift, radians.
    pub tap_theta: f64,
    /// Thermal rating, MVA. `None` until a warning-producing default is
    /// applied by the compiler.
    pub rate_mva: Option<f64>,
    pub active: bool,
    /// Optional impedance tolerance used by Monte-Carlo samplers
    /// (out of scope here; carried through so that driver is untouched).
    pub z_tolerance: Option<f64>,
}

impl Branch {
    pub fn new(kind: BranchKind, from: Entity, to: Entity, r: f64, x: f64) -> Self {
        Self {
            kind,
            from,
            to,
            r,
            x,
            g: 0.0,
            b: 0.0,
            tap_m: 1.0,
            tap_theta: 0.0,
            rate_mva: None,
            active: true,
            z_tolerance: None,
        }
    }
}

mod entity_serde {
    use bevy_ecs::prelude::Entity;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(e: &Entity, s: S) -> Result<S::Ok, S::Error> {
        e.to_bits().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Entity, D::Error> {
        let bits = u64::deserialize(d)?;
        Ok(Entity::from_bits(bits))
    }
}
