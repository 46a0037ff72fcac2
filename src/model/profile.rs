use bevy_ecs::prelude::*;

/// Shared length every device profile must match (SPEC_FULL.md §3
/// invariant: "Profiles, if present, have identical length equal to the
/// master-time length"). Advanced externally by the out-of-scope
/// time-series driver; the compiler only ever reads it to validate.
#[derive(Resource, Debug, Clone, Copy, Default)]
pub struct TimeIndexLen(pub Option<usize>);

/// A time-indexed series of a single device attribute (S, P, Vset, Y).
/// One per device entity, at most, per attribute.
#[derive(Component, Debug, Clone)]
pub struct TimeProfile<T: Send + Sync + 'static> {
    pub values: Vec<T>,
}

impl<T: Send + Sync + 'static> TimeProfile<T> {
    pub fn new(values: Vec<T>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
