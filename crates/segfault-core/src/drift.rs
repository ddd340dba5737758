//! Per-tick relocation of walls and gates under topological invariants.
//!
//! Drift is silent: processes learn about it only through what they can no
//! longer see or walk through.

use rand::Rng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

use crate::geometry::{
    Grid, Tile, WallSet, adjacent_edge_slots, exit_count, is_fully_connected,
    orthogonal_neighbors,
};
use crate::state::{GateKind, Shard, WallId};

/// Minimum Chebyshev distance kept between any two gates.
const GATE_MIN_SPACING: i32 = 3;

/// Fraction bounds of the wall set that drifts each tick.
const DRIFT_FRACTION_MIN: f64 = 0.10;
const DRIFT_FRACTION_MAX: f64 = 0.25;

/// Move a random subset of walls one edge slot each, preserving the wall
/// budget and the acceptance invariants. Walls that cannot move legally stay.
pub(crate) fn drift_walls(shard: &mut Shard, grid: Grid, rng: &mut SmallRng) {
    let mut wall_ids: Vec<WallId> = shard.walls.keys().copied().collect();
    if wall_ids.is_empty() {
        return;
    }
    let min_count = ((wall_ids.len() as f64 * DRIFT_FRACTION_MIN) as usize).max(1);
    let max_count = ((wall_ids.len() as f64 * DRIFT_FRACTION_MAX) as usize).max(1);
    let move_count = rng.random_range(min_count..=max_count);
    wall_ids.shuffle(rng);
    let mut selected: Vec<WallId> = wall_ids.into_iter().take(move_count).collect();
    // Lowest wall id moves first, so slot contention resolves to the lowest id.
    selected.sort_unstable();

    for wall_id in selected {
        let current = shard.walls[&wall_id];
        let mut candidates = adjacent_edge_slots(current, grid);
        candidates.shuffle(rng);
        for target in candidates {
            if shard.walls.values().any(|w| *w == target) {
                continue;
            }
            shard.walls.insert(wall_id, target);
            if constraints_ok(shard, grid) {
                break;
            }
            shard.walls.insert(wall_id, current);
        }
    }
}

/// Move each gate to a random orthogonal neighbor, respecting occupancy and
/// the inter-gate spacing floor. A gate with no legal destination stays.
pub(crate) fn drift_gates(shard: &mut Shard, grid: Grid, rng: &mut SmallRng) {
    let mut occupied: Vec<Tile> = shard
        .processes
        .values()
        .filter(|p| p.alive)
        .map(|p| p.pos)
        .collect();
    occupied.push(shard.defragger.pos);

    for idx in 0..shard.gates.len() {
        let other_positions: Vec<Tile> = shard
            .gates
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, g)| g.pos)
            .collect();
        let mut candidates: Vec<Tile> = orthogonal_neighbors(shard.gates[idx].pos)
            .into_iter()
            .filter(|t| grid.in_bounds(*t))
            .collect();
        candidates.shuffle(rng);
        for tile in candidates {
            if occupied.contains(&tile) || other_positions.contains(&tile) {
                continue;
            }
            if other_positions
                .iter()
                .any(|g| tile.chebyshev(*g) < GATE_MIN_SPACING)
            {
                continue;
            }
            shard.gates[idx].pos = tile;
            break;
        }
    }
}

/// Acceptance check applied to every tentative wall placement.
fn constraints_ok(shard: &Shard, grid: Grid) -> bool {
    let walls: WallSet = shard.walls_set();
    if !is_fully_connected(grid, &walls) {
        return false;
    }
    for tile in grid.tiles() {
        if exit_count(tile, grid, &walls) == 0 {
            return false;
        }
    }
    // The stable gate must keep at least one exit.
    if let Some(stable) = shard.gates.iter().find(|g| g.kind == GateKind::Stable) {
        if exit_count(stable.pos, grid, &walls) == 0 {
            return false;
        }
    }
    true
}
