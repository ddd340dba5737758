//! Simultaneous resolution of MOVE/BUFFER/IDLE against pre-drift topology.

use std::collections::BTreeMap;

use rand::rngs::SmallRng;
use rand::seq::IndexedRandom;

use crate::geometry::{Grid, Tile, WallSet, adjacent_tiles, keypad_delta, step_legal};
use crate::state::{Command, ProcessId, Shard};

/// Maximum tiles covered by one sprint.
const SPRINT_LENGTH: usize = 3;

/// Resolved destinations per live process; `None` means idle in place.
pub(crate) type MoveSet = BTreeMap<ProcessId, Option<Tile>>;

/// Resolve every buffered action into a committed destination set.
///
/// Order of evaluation is slot order, which keeps the sprint RNG draws
/// deterministic for a given command stream.
pub(crate) fn resolve_actions(
    shard: &Shard,
    grid: Grid,
    cooldown_ticks: u64,
    rng: &mut SmallRng,
) -> MoveSet {
    let walls = shard.walls_set();
    let mut moves: MoveSet = BTreeMap::new();
    let order: Vec<ProcessId> = shard.processes.keys().collect();

    for id in &order {
        let proc = &shard.processes[*id];
        let dest = if proc.alive {
            intent_destination(shard, grid, &walls, *id, cooldown_ticks, rng)
        } else {
            None
        };
        moves.insert(*id, dest);
    }

    // Nobody may enter the defragger's tile.
    for dest in moves.values_mut() {
        if *dest == Some(shard.defragger.pos) {
            *dest = None;
        }
    }

    // Contested destinations: everyone involved idles.
    let mut dest_claims: BTreeMap<Tile, Vec<ProcessId>> = BTreeMap::new();
    for (id, dest) in &moves {
        if let Some(tile) = dest {
            dest_claims.entry(*tile).or_default().push(*id);
        }
    }
    for claimants in dest_claims.values() {
        if claimants.len() > 1 {
            for id in claimants {
                moves.insert(*id, None);
            }
        }
    }

    // Vacated-tile fixpoint: a mover stands only if the tick-start occupant
    // of its destination is itself moving somewhere else.
    let occupants: BTreeMap<Tile, ProcessId> = shard
        .processes
        .iter()
        .filter(|(_, p)| p.alive)
        .map(|(id, p)| (p.pos, id))
        .collect();
    let mut changed = true;
    while changed {
        changed = false;
        for id in &order {
            let Some(dest) = moves[id] else { continue };
            if let Some(&occupant) = occupants.get(&dest) {
                let occupant_dest = moves.get(&occupant).copied().flatten();
                let vacating = occupant_dest.is_some_and(|d| d != dest);
                if occupant != *id && !vacating {
                    moves.insert(*id, None);
                    changed = true;
                }
            }
        }
    }

    moves
}

/// Commit resolved destinations, stamping sprint bookkeeping.
///
/// A committed sprint clears the sprinter's LOS lock. Movers that land on an
/// echo tile are reported so the shard can raise their noise events.
pub(crate) fn apply_moves(shard: &mut Shard, moves: &MoveSet) -> Vec<ProcessId> {
    let echo_positions: Vec<Tile> = shard.echo_tiles.iter().map(|e| e.pos).collect();
    let mut landed_on_echo = Vec::new();
    for (&id, dest) in moves {
        let Some(dest) = dest else { continue };
        let tick = shard.tick;
        let Some(proc) = shard.processes.get_mut(id) else {
            continue;
        };
        if !proc.alive {
            continue;
        }
        proc.pos = *dest;
        if matches!(proc.buffered, Command::Buffer(_)) {
            proc.los_lock = false;
            proc.last_sprint_tick = tick as i64;
        }
        if echo_positions.contains(dest) {
            landed_on_echo.push(id);
        }
    }
    landed_on_echo
}

/// Translate one buffered command into a destination, or idle.
///
/// Illegal input resolves silently to idle; the process gets no feedback.
fn intent_destination(
    shard: &Shard,
    grid: Grid,
    walls: &WallSet,
    id: ProcessId,
    cooldown_ticks: u64,
    rng: &mut SmallRng,
) -> Option<Tile> {
    let proc = &shard.processes[id];
    let digit = match proc.buffered {
        Command::Move(d) | Command::Buffer(d) => d,
        _ => return None,
    };
    let (dx, dy) = keypad_delta(digit)?;
    if dx == 0 && dy == 0 {
        return None;
    }
    let target = proc.pos.offset(dx, dy);
    if !grid.in_bounds(target) || !step_legal(proc.pos, target, walls) {
        return None;
    }
    if matches!(proc.buffered, Command::Move(_)) {
        return Some(target);
    }
    // Sprint: subject to cooldown, then up to three steps preferring the
    // intended direction, turning randomly where it is blocked.
    if shard.tick as i64 - proc.last_sprint_tick <= cooldown_ticks as i64 {
        return None;
    }
    let mut current = proc.pos;
    for _ in 0..SPRINT_LENGTH {
        let options = adjacent_tiles(current, grid, walls);
        if options.is_empty() {
            break;
        }
        let preferred = current.offset(dx, dy);
        current = if options.contains(&preferred) {
            preferred
        } else {
            *options.choose(rng).unwrap_or(&current)
        };
    }
    if current == proc.pos { None } else { Some(current) }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::geometry::WallEdge;
    use crate::state::{Process, ShardId};
    use std::collections::BTreeMap as Walls;

    const GRID: Grid = Grid::new(20);

    fn empty_shard() -> Shard {
        Shard::new(
            ShardId(0),
            7,
            GRID,
            Walls::new(),
            Vec::new(),
            Tile::new(10, 10),
        )
    }

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(1)
    }

    fn insert(shard: &mut Shard, pos: Tile, cmd: Command) -> ProcessId {
        let mut proc = Process::new("proc", pos);
        proc.buffered = cmd;
        shard.processes.insert(proc)
    }

    #[test]
    fn same_destination_collision_idles_everyone() {
        let mut shard = empty_shard();
        let p1 = insert(&mut shard, Tile::new(1, 1), Command::Move(8));
        let p2 = insert(&mut shard, Tile::new(1, 3), Command::Move(2));
        let moves = resolve_actions(&shard, GRID, 1, &mut rng());
        assert_eq!(moves[&p1], None);
        assert_eq!(moves[&p2], None);
    }

    #[test]
    fn swap_is_legal_when_both_vacate() {
        let mut shard = empty_shard();
        let p1 = insert(&mut shard, Tile::new(1, 1), Command::Move(6));
        let p2 = insert(&mut shard, Tile::new(2, 1), Command::Move(4));
        let moves = resolve_actions(&shard, GRID, 1, &mut rng());
        assert_eq!(moves[&p1], Some(Tile::new(2, 1)));
        assert_eq!(moves[&p2], Some(Tile::new(1, 1)));
    }

    #[test]
    fn mover_idles_when_occupant_stays() {
        let mut shard = empty_shard();
        let p1 = insert(&mut shard, Tile::new(1, 1), Command::Move(8));
        let _p2 = insert(&mut shard, Tile::new(1, 2), Command::Idle);
        let moves = resolve_actions(&shard, GRID, 1, &mut rng());
        assert_eq!(moves[&p1], None);
    }

    #[test]
    fn chain_of_vacating_movers_all_advance() {
        let mut shard = empty_shard();
        let p1 = insert(&mut shard, Tile::new(1, 1), Command::Move(6));
        let p2 = insert(&mut shard, Tile::new(2, 1), Command::Move(6));
        let p3 = insert(&mut shard, Tile::new(3, 1), Command::Move(6));
        let moves = resolve_actions(&shard, GRID, 1, &mut rng());
        assert_eq!(moves[&p1], Some(Tile::new(2, 1)));
        assert_eq!(moves[&p2], Some(Tile::new(3, 1)));
        assert_eq!(moves[&p3], Some(Tile::new(4, 1)));
    }

    #[test]
    fn defragger_tile_is_impassable() {
        let mut shard = empty_shard();
        shard.defragger.pos = Tile::new(2, 1);
        let p1 = insert(&mut shard, Tile::new(1, 1), Command::Move(6));
        let moves = resolve_actions(&shard, GRID, 1, &mut rng());
        assert_eq!(moves[&p1], None);
    }

    #[test]
    fn move_into_wall_resolves_to_idle() {
        let mut shard = empty_shard();
        shard
            .walls
            .insert(0, WallEdge::new(Tile::new(1, 1), Tile::new(2, 1)));
        let p1 = insert(&mut shard, Tile::new(1, 1), Command::Move(6));
        let moves = resolve_actions(&shard, GRID, 1, &mut rng());
        assert_eq!(moves[&p1], None);
    }

    #[test]
    fn keypad_five_is_a_no_op() {
        let mut shard = empty_shard();
        let p1 = insert(&mut shard, Tile::new(1, 1), Command::Move(5));
        let moves = resolve_actions(&shard, GRID, 1, &mut rng());
        assert_eq!(moves[&p1], None);
    }

    #[test]
    fn sprint_covers_up_to_three_tiles_in_the_open() {
        let mut shard = empty_shard();
        let p1 = insert(&mut shard, Tile::new(2, 2), Command::Buffer(6));
        shard.tick = 10;
        let moves = resolve_actions(&shard, GRID, 1, &mut rng());
        assert_eq!(moves[&p1], Some(Tile::new(5, 2)));
    }

    #[test]
    fn sprint_cooldown_downgrades_to_idle() {
        let mut shard = empty_shard();
        shard.tick = 5;
        let p1 = insert(&mut shard, Tile::new(5, 5), Command::Buffer(6));
        shard.processes[p1].last_sprint_tick = 5;
        let moves = resolve_actions(&shard, GRID, 1, &mut rng());
        assert_eq!(moves[&p1], None);

        shard.tick = 7;
        let moves = resolve_actions(&shard, GRID, 1, &mut rng());
        assert_eq!(moves[&p1], Some(Tile::new(8, 5)));
    }

    #[test]
    fn committed_sprint_clears_los_lock_and_stamps_tick() {
        let mut shard = empty_shard();
        shard.tick = 9;
        let p1 = insert(&mut shard, Tile::new(2, 2), Command::Buffer(6));
        shard.processes[p1].los_lock = true;
        let moves = resolve_actions(&shard, GRID, 1, &mut rng());
        apply_moves(&mut shard, &moves);
        assert!(!shard.processes[p1].los_lock);
        assert_eq!(shard.processes[p1].last_sprint_tick, 9);
    }

    #[test]
    fn no_two_processes_share_a_tile_after_commit() {
        let mut shard = empty_shard();
        let ids: Vec<ProcessId> = (0..6)
            .map(|i| insert(&mut shard, Tile::new(i, 0), Command::Move(6)))
            .collect();
        let moves = resolve_actions(&shard, GRID, 1, &mut rng());
        apply_moves(&mut shard, &moves);
        let mut seen = std::collections::BTreeSet::new();
        for id in ids {
            assert!(seen.insert(shard.processes[id].pos));
        }
    }
}
