//! Connected-component splitting (SPEC_FULL.md §4.1 "Islanding").
//! Absent from the teacher entirely; grounded on `monistowl-gat`'s use
//! of `petgraph` for its own network graph
//! (`crates/gat-algo/src/power_flow/q_limits.rs`).

use std::collections::HashMap;

use bevy_ecs::prelude::Entity;
use petgraph::unionfind::UnionFind;

use crate::model::{Branch, Grid};

/// One connected component: the active buses it contains and every
/// branch whose both ends fall inside it.
pub struct Island {
    pub buses: Vec<Entity>,
    pub branches: Vec<Entity>,
}

/// Splits `grid` into connected islands over *active* buses joined by
/// *active* branches. An inactive branch never joins two buses into one
/// island even if its endpoints are otherwise connected; if its two
/// endpoints end up in different islands regardless, it is dropped (it
/// cannot be assigned to either island's per-branch arrays).
pub fn find_islands(grid: &Grid) -> Vec<Island> {
    let active_buses: Vec<Entity> = grid
        .buses()
        .filter(|(_, bus)| bus.active)
        .map(|(e, _)| e)
        .collect();

    let mut dense: HashMap<Entity, usize> = HashMap::with_capacity(active_buses.len());
    for (i, &e) in active_buses.iter().enumerate() {
        dense.insert(e, i);
    }

    let mut uf = UnionFind::new(active_buses.len());
    let active_branches: Vec<(Entity, &Branch)> = grid
        .branches()
        .filter(|(_, b)| b.active)
        .collect();

    for (_, branch) in &active_branches {
        if let (Some(&fi), Some(&ti)) = (dense.get(&branch.from), dense.get(&branch.to)) {
            uf.union(fi, ti);
        }
    }

    let mut groups: HashMap<usize, Vec<Entity>> = HashMap::new();
    for &e in &active_buses {
        let root = uf.find(dense[&e]);
        groups.entry(root).or_default().push(e);
    }

    let mut islands: Vec<Island> = groups
        .into_values()
        .map(|buses| Island {
            buses,
            branches: Vec::new(),
        })
        .collect();

    // bus entity -> index of the island containing it
    let mut owner: HashMap<Entity, usize> = HashMap::new();
    for (idx, island) in islands.iter().enumerate() {
        for &b in &island.buses {
            owner.insert(b, idx);
        }
    }

    for (be, branch) in grid.branches() {
        let from_owner = owner.get(&branch.from);
        let to_owner = owner.get(&branch.to);
        if let (Some(&fo), Some(&to)) = (from_owner, to_owner) {
            if fo == to {
                islands[fo].branches.push(be);
            }
        }
    }

    islands
}
