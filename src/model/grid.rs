use bevy_ecs::prelude::*;
use num_complex::Complex64;

use super::branch::Branch;
use super::bus::{Bus, BusId};
use super::devices::{Battery, ControlledGenerator, Load, Shunt, StaticGenerator, TargetBus};
use super::profile::{TimeIndexLen, TimeProfile};
use crate::error::CompileError;

/// Owns the whole device model. A `Grid` exclusively owns its buses;
/// each bus exclusively owns the devices attached to it (SPEC_FULL.md
/// §3 Ownership) — expressed here as arena-allocated `bevy_ecs` entities
/// rather than a `Vec`-of-children tree, per the REDESIGN FLAGS note on
/// cyclic bus/device references.
///
/// A `Grid` is mutated freely by a host (importer, editor) between
/// compilations; [`crate::compiler::compile`] takes a read-only
/// snapshot and never mutates it back.
pub struct Grid {
    world: World,
    pub sbase_mva: f64,
    pub freq_hz: f64,
    next_bus_id: u64,
}

impl Grid {
    pub fn new(sbase_mva: f64, freq_hz: f64) -> Self {
        Self {
            world: World::new(),
            sbase_mva,
            freq_hz,
            next_bus_id: 0,
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// Sets the master time-series length every [`TimeProfile`] must
    /// match (SPEC_FULL.md §3 "Profiles"). Advanced by the out-of-scope
    /// time-series driver; the compiler only reads it.
    pub fn set_time_index_len(&mut self, len: usize) {
        self.world.insert_resource(TimeIndexLen(Some(len)));
    }

    pub fn time_index_len(&self) -> Option<usize> {
        self.world.get_resource::<TimeIndexLen>().and_then(|r| r.0)
    }

    /// Attaches a time-indexed series to an existing device entity.
    pub fn attach_profile<T: Send + Sync + 'static>(&mut self, entity: Entity, profile: TimeProfile<T>) {
        self.world.entity_mut(entity).insert(profile);
    }

    /// Validates every attached profile against the master time index,
    /// per SPEC_FULL.md §3: "the compiler validates every profile's
    /// length against the master index when profiles are present." A
    /// grid with no master length set (the out-of-scope driver never
    /// advanced it) has nothing to validate against, so profiles are
    /// left unchecked.
    pub fn validate_profiles(&self) -> Result<(), CompileError> {
        let expected = match self.time_index_len() {
            Some(len) => len,
            None => return Ok(()),
        };
        for e in self.world.iter_entities() {
            if let Some(p) = self.world.get::<TimeProfile<Complex64>>(e.id()) {
                if p.len() != expected {
                    return Err(CompileError::ProfileLengthMismatch(e.id()));
                }
            }
            if let Some(p) = self.world.get::<TimeProfile<f64>>(e.id()) {
                if p.len() != expected {
                    return Err(CompileError::ProfileLengthMismatch(e.id()));
                }
            }
        }
        Ok(())
    }

    pub fn add_bus(&mut self, bus: Bus) -> Entity {
        let id = BusId(self.next_bus_id);
        self.next_bus_id += 1;
        self.world.spawn((bus, id)).id()
    }

    pub fn add_branch(&mut self, branch: Branch) -> Entity {
        self.world.spawn(branch).id()
    }

    pub fn add_load(&mut self, bus: Entity, load: Load) -> Entity {
        self.world.spawn((load, TargetBus(bus))).id()
    }

    pub fn add_generator(&mut self, bus: Entity, gen: ControlledGenerator) -> Entity {
        self.world.spawn((gen, TargetBus(bus))).id()
    }

    pub fn add_battery(&mut self, bus: Entity, battery: Battery) -> Entity {
        self.world.spawn((battery, TargetBus(bus))).id()
    }

    pub fn add_static_generator(&mut self, bus: Entity, sgen: StaticGenerator) -> Entity {
        self.world.spawn((sgen, TargetBus(bus))).id()
    }

    pub fn add_shunt(&mut self, bus: Entity, shunt: Shunt) -> Entity {
        self.world.spawn((shunt, TargetBus(bus))).id()
    }

    pub fn bus(&self, e: Entity) -> Option<&Bus> {
        self.world.get::<Bus>(e)
    }

    pub fn buses(&self) -> impl Iterator<Item = (Entity, &Bus)> {
        self.world.iter_entities().filter_map(|e| {
            let bus = self.world.get::<Bus>(e.id())?;
            Some((e.id(), bus))
        })
    }

    pub fn branches(&self) -> impl Iterator<Item = (Entity, &Branch)> {
        self.world.iter_entities().filter_map(|e| {
            let branch = self.world.get::<Branch>(e.id())?;
            Some((e.id(), branch))
        })
    }

    pub fn loads_on(&self, bus: Entity) -> impl Iterator<Item = &Load> + '_ {
        self.world
            .iter_entities()
            .filter_map(move |e| {
                let target = self.world.get::<TargetBus>(e.id())?;
                if target.0 != bus {
                    return None;
                }
                self.world.get::<Load>(e.id())
            })
    }

    pub fn generators(&self) -> impl Iterator<Item = (Entity, &ControlledGenerator)> {
        self.world.iter_entities().filter_map(|e| {
            let target = self.world.get::<TargetBus>(e.id())?;
            let gen = self.world.get::<ControlledGenerator>(e.id())?;
            Some((target.0, gen))
        })
    }

    pub fn batteries(&self) -> impl Iterator<Item = (Entity, &Battery)> {
        self.world.iter_entities().filter_map(|e| {
            let target = self.world.get::<TargetBus>(e.id())?;
            let bat = self.world.get::<Battery>(e.id())?;
            Some((target.0, bat))
        })
    }

    pub fn static_generators(&self) -> impl Iterator<Item = (Entity, &StaticGenerator)> {
        self.world.iter_entities().filter_map(|e| {
            let target = self.world.get::<TargetBus>(e.id())?;
            let sgen = self.world.get::<StaticGenerator>(e.id())?;
            Some((target.0, sgen))
        })
    }

    pub fn shunts(&self) -> impl Iterator<Item = (Entity, &Shunt)> {
        self.world.iter_entities().filter_map(|e| {
            let target = self.world.get::<TargetBus>(e.id())?;
            let shunt = self.world.get::<Shunt>(e.id())?;
            Some((target.0, shunt))
        })
    }

    pub fn loads(&self) -> impl Iterator<Item = (Entity, &Load)> {
        self.world.iter_entities().filter_map(|e| {
            let target = self.world.get::<TargetBus>(e.id())?;
            let load = self.world.get::<Load>(e.id())?;
            Some((target.0, load))
        })
    }
}
