//! Defragmenter target selection and movement.
//!
//! Priority: broadcast pull, retained LOS lock, fresh LOS acquisition,
//! patrol. Escalation bonuses ride the Fibonacci ladder; broadcast
//! escalation beats the watchdog's pending bonus when both would apply.

use rand::Rng;
use rand::rngs::SmallRng;

use crate::geometry::{Grid, Tile, adjacent_tiles, distance_map, los_clear, shortest_step};
use crate::state::{ProcessId, Shard, TargetReason};

/// Escalation ladder; indexed by `count - 1`, clamped to the last rung.
pub const FIBONACCI_ESCALATION: [u32; 6] = [1, 3, 5, 8, 13, 21];

/// Ladder value for an escalation count.
#[must_use]
pub fn escalation_bonus(count: u32) -> u32 {
    if count == 0 {
        return 0;
    }
    let idx = ((count - 1) as usize).min(FIBONACCI_ESCALATION.len() - 1);
    FIBONACCI_ESCALATION[idx]
}

/// Outcome of target selection for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TargetChoice {
    pub target: Option<ProcessId>,
    pub reason: TargetReason,
    pub bonus_steps: u32,
}

/// Pick the defragger's target and escalation bonus for this tick.
///
/// Evaluated against the post-drift map. A fresh LOS pick locks its target
/// and counts as a liveness input; the watchdog's pending bonus discharges
/// here unless a broadcast bonus overrides it.
pub(crate) fn select_target(shard: &mut Shard, grid: Grid) -> TargetChoice {
    let walls = shard.walls_set();

    // Broadcast pull: latest timestamp wins, ties to the lowest process id.
    if !shard.broadcasts.is_empty() {
        let latest = shard
            .broadcasts
            .iter()
            .map(|b| b.timestamp_ms)
            .max()
            .unwrap_or(0);
        let target = shard
            .broadcasts
            .iter()
            .filter(|b| b.timestamp_ms == latest)
            .map(|b| b.process_id)
            .min()
            .expect("non-empty ledger");
        let count = shard
            .broadcasts
            .iter()
            .filter(|b| b.process_id == target)
            .count() as u32;
        shard.defragger.target_acquired_tick = None;
        return TargetChoice {
            target: Some(target),
            reason: TargetReason::Broadcast,
            bonus_steps: escalation_bonus(count),
        };
    }

    let pending = shard.watchdog.discharge();
    let bonus_steps = escalation_bonus(pending);

    // Retained LOS lock: survives target movement, broken only by a sprint.
    if let Some(prev) = shard.defragger.last_los_target {
        let retained = shard
            .processes
            .get(prev)
            .is_some_and(|p| p.alive && p.los_lock && los_clear(shard.defragger.pos, p.pos, &walls));
        if retained {
            return TargetChoice {
                target: Some(prev),
                reason: TargetReason::Los,
                bonus_steps,
            };
        }
    }

    // Fresh LOS acquisition: nearest by BFS distance, ties to the lowest id.
    let distances = distance_map(shard.defragger.pos, grid, &walls);
    let mut best: Option<(u32, ProcessId)> = None;
    for (id, proc) in &shard.processes {
        if !proc.alive || !los_clear(shard.defragger.pos, proc.pos, &walls) {
            continue;
        }
        let Some(&dist) = distances.get(&proc.pos) else {
            continue;
        };
        let better = match best {
            None => true,
            Some((bd, bid)) => dist < bd || (dist == bd && id < bid),
        };
        if better {
            best = Some((dist, id));
        }
    }
    if let Some((_, id)) = best {
        if let Some(proc) = shard.processes.get_mut(id) {
            proc.los_lock = true;
        }
        shard.liveness.new_lock = true;
        shard.defragger.last_los_target = Some(id);
        shard.defragger.target_acquired_tick = Some(shard.tick);
        return TargetChoice {
            target: Some(id),
            reason: TargetReason::Los,
            bonus_steps,
        };
    }

    shard.defragger.target_acquired_tick = None;
    let reason = if pending > 0 {
        TargetReason::Watchdog
    } else {
        TargetReason::Patrol
    };
    TargetChoice {
        target: None,
        reason,
        bonus_steps,
    }
}

/// One step of defragger movement: BFS pursuit with a deterministic keypad
/// tie-break when targeted, a visit-biased random walk otherwise.
pub(crate) fn next_step(shard: &Shard, grid: Grid, rng: &mut SmallRng) -> Option<Tile> {
    let walls = shard.walls_set();
    let target_pos = shard
        .defragger
        .target_id
        .and_then(|id| shard.processes.get(id))
        .filter(|p| p.alive)
        .map(|p| p.pos);
    match target_pos {
        Some(goal) => shortest_step(shard.defragger.pos, goal, grid, &walls),
        None => patrol_step(shard, grid, rng),
    }
}

/// Biased random walk toward under-visited tiles.
fn patrol_step(shard: &Shard, grid: Grid, rng: &mut SmallRng) -> Option<Tile> {
    let walls = shard.walls_set();
    let neighbors = adjacent_tiles(shard.defragger.pos, grid, &walls);
    if neighbors.is_empty() {
        return None;
    }
    let weights: Vec<f64> = neighbors
        .iter()
        .map(|n| 1.0 / (1.0 + f64::from(shard.defragger.visits(*n, grid))))
        .collect();
    Some(weighted_choice(&neighbors, &weights, rng))
}

fn weighted_choice(candidates: &[Tile], weights: &[f64], rng: &mut SmallRng) -> Tile {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return candidates[rng.random_range(0..candidates.len())];
    }
    let r = rng.random::<f64>() * total;
    let mut upto = 0.0;
    for (candidate, weight) in candidates.iter().zip(weights) {
        upto += weight;
        if upto >= r {
            return *candidate;
        }
    }
    candidates[candidates.len() - 1]
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rand::SeedableRng;

    use super::*;
    use crate::state::{Broadcast, Process, ShardId};

    const GRID: Grid = Grid::new(20);

    fn empty_shard() -> Shard {
        Shard::new(
            ShardId(0),
            13,
            GRID,
            BTreeMap::new(),
            Vec::new(),
            Tile::new(19, 19),
        )
    }

    fn broadcast(pid: ProcessId, ts: u64) -> Broadcast {
        Broadcast {
            process_id: pid,
            message: "ping".into(),
            timestamp_ms: ts,
        }
    }

    #[test]
    fn escalation_ladder_values() {
        assert_eq!(escalation_bonus(0), 0);
        assert_eq!(escalation_bonus(1), 1);
        assert_eq!(escalation_bonus(2), 3);
        assert_eq!(escalation_bonus(3), 5);
        assert_eq!(escalation_bonus(99), 21);
    }

    #[test]
    fn latest_broadcast_wins_and_ties_break_low() {
        let mut shard = empty_shard();
        let a = shard.processes.insert(Process::new("A", Tile::new(0, 0)));
        let b = shard.processes.insert(Process::new("B", Tile::new(1, 0)));
        shard.broadcasts = vec![broadcast(b, 100), broadcast(a, 100)];
        let choice = select_target(&mut shard, GRID);
        assert_eq!(choice.target, Some(a.min(b)));
        assert_eq!(choice.reason, TargetReason::Broadcast);
        assert_eq!(choice.bonus_steps, 1);
    }

    #[test]
    fn repeat_broadcasts_escalate_within_the_window() {
        let mut shard = empty_shard();
        let a = shard.processes.insert(Process::new("A", Tile::new(0, 0)));
        shard.broadcasts = vec![broadcast(a, 100), broadcast(a, 101), broadcast(a, 102)];
        let choice = select_target(&mut shard, GRID);
        assert_eq!(choice.target, Some(a));
        assert_eq!(choice.bonus_steps, 5);
    }

    #[test]
    fn cleared_ledger_resets_escalation() {
        let mut shard = empty_shard();
        let a = shard.processes.insert(Process::new("A", Tile::new(0, 0)));
        shard.broadcasts = vec![broadcast(a, 100), broadcast(a, 101)];
        let choice = select_target(&mut shard, GRID);
        assert_eq!(choice.bonus_steps, 3);
        shard.broadcasts.clear();
        shard.processes[a].los_lock = false;
        shard.defragger.last_los_target = None;
        // Far corner to hide from LOS: nothing left to chase.
        shard.processes[a].pos = Tile::new(3, 7);
        let choice = select_target(&mut shard, GRID);
        assert_eq!(choice.target, None);
        assert_eq!(choice.bonus_steps, 0);
    }

    #[test]
    fn fresh_los_pick_is_nearest_and_locks() {
        let mut shard = empty_shard();
        shard.defragger.pos = Tile::new(15, 2);
        let near = shard.processes.insert(Process::new("N", Tile::new(10, 2)));
        let far = shard.processes.insert(Process::new("F", Tile::new(2, 2)));
        let choice = select_target(&mut shard, GRID);
        assert_eq!(choice.target, Some(near));
        assert_eq!(choice.reason, TargetReason::Los);
        assert!(shard.processes[near].los_lock);
        assert!(!shard.processes[far].los_lock);
        assert!(shard.liveness.new_lock);
        assert_eq!(shard.defragger.target_acquired_tick, Some(shard.tick));
    }

    #[test]
    fn retained_lock_beats_a_nearer_newcomer() {
        let mut shard = empty_shard();
        shard.defragger.pos = Tile::new(15, 2);
        let locked = shard.processes.insert(Process::new("L", Tile::new(2, 2)));
        let nearer = shard.processes.insert(Process::new("N", Tile::new(14, 2)));
        shard.processes[locked].los_lock = true;
        shard.defragger.last_los_target = Some(locked);
        let choice = select_target(&mut shard, GRID);
        assert_eq!(choice.target, Some(locked));
        assert!(!shard.processes[nearer].los_lock);
    }

    #[test]
    fn sprint_broken_lock_falls_through_to_fresh_pick() {
        let mut shard = empty_shard();
        shard.defragger.pos = Tile::new(15, 2);
        let prev = shard.processes.insert(Process::new("P", Tile::new(2, 2)));
        shard.defragger.last_los_target = Some(prev);
        // Lock already cleared by this tick's sprint.
        shard.processes[prev].los_lock = false;
        let choice = select_target(&mut shard, GRID);
        assert_eq!(choice.target, Some(prev));
        assert_eq!(choice.reason, TargetReason::Los);
        // Re-acquired as a fresh lock, not a retained one.
        assert!(shard.processes[prev].los_lock);
        assert_eq!(shard.defragger.target_acquired_tick, Some(shard.tick));
    }

    #[test]
    fn watchdog_bonus_discharges_into_patrol() {
        let mut shard = empty_shard();
        shard.watchdog.pending_bonus = 1;
        let choice = select_target(&mut shard, GRID);
        assert_eq!(choice.target, None);
        assert_eq!(choice.reason, TargetReason::Watchdog);
        assert_eq!(choice.bonus_steps, 1);
        assert_eq!(shard.watchdog.pending_bonus, 0);
    }

    #[test]
    fn broadcast_bonus_overrides_watchdog_bonus() {
        let mut shard = empty_shard();
        shard.watchdog.pending_bonus = 3;
        let a = shard.processes.insert(Process::new("A", Tile::new(0, 0)));
        shard.broadcasts = vec![broadcast(a, 50)];
        let choice = select_target(&mut shard, GRID);
        assert_eq!(choice.reason, TargetReason::Broadcast);
        assert_eq!(choice.bonus_steps, 1);
        // Undischarged: the pending bonus waits for a window with no ledger.
        assert_eq!(shard.watchdog.pending_bonus, 3);
    }

    #[test]
    fn patrol_prefers_under_visited_tiles() {
        let mut shard = empty_shard();
        shard.defragger.pos = Tile::new(10, 10);
        // Saturate every neighbor but one.
        let walls = shard.walls_set();
        let neighbors = adjacent_tiles(Tile::new(10, 10), GRID, &walls);
        for n in neighbors.iter().skip(1) {
            for _ in 0..1000 {
                shard.defragger.record_visit(*n, GRID);
            }
        }
        let fresh = neighbors[0];
        let mut rng = SmallRng::seed_from_u64(2);
        let mut hits = 0;
        for _ in 0..200 {
            if next_step(&shard, GRID, &mut rng) == Some(fresh) {
                hits += 1;
            }
        }
        assert!(hits > 150, "expected strong bias, got {hits}/200");
    }
}
