//! Per-process perception projection and the spectator view.
//!
//! A process sees only what its adjacency cluster can see: no global
//! coordinates, no shard counters, no foreign identity beyond "process".

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::geometry::{Grid, Tile, adjacent_tiles, bfs_path, keypad_digit};
use crate::state::{GateKind, ProcessEvent, ProcessId, Shard};

/// Flood-fill depth ceiling for clustered visibility.
const MAX_VIEW_DEPTH: usize = 4;

/// Payload returned to one process at tick commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Perception {
    pub tick: u64,
    pub grid: String,
    pub events: Vec<ProcessEvent>,
}

/// Spectator projection of a whole shard.
#[derive(Debug, Clone, Serialize)]
pub struct SpectatorView {
    pub tick: u64,
    pub grid: Vec<String>,
    pub defragger: Tile,
    pub defragger_target: Option<Tile>,
    pub defragger_preview: Vec<Tile>,
    pub watchdog_quiet_ticks: u32,
    pub watchdog_countdown: u32,
    pub watchdog_active: bool,
}

/// Transitive adjacency cluster containing `origin`, in id order.
#[must_use]
pub fn adjacent_cluster(shard: &Shard, origin: ProcessId) -> Vec<ProcessId> {
    let walls = shard.walls_set();
    let mut cluster = BTreeSet::from([origin]);
    let mut changed = true;
    while changed {
        changed = false;
        for (id, proc) in &shard.processes {
            if cluster.contains(&id) || !proc.alive {
                continue;
            }
            let joins = cluster.iter().any(|member| {
                shard
                    .processes
                    .get(*member)
                    .is_some_and(|m| crate::geometry::adjacent(proc.pos, m.pos, &walls))
            });
            if joins {
                cluster.insert(id);
                changed = true;
            }
        }
    }
    cluster.into_iter().collect()
}

/// Multi-source depth-limited flood fill; view depth grows with the cluster.
#[must_use]
pub fn visible_tiles(shard: &Shard, cluster: &[ProcessId], grid: Grid) -> BTreeSet<Tile> {
    let positions: Vec<Tile> = cluster
        .iter()
        .filter_map(|id| shard.processes.get(*id))
        .map(|p| p.pos)
        .collect();
    if positions.is_empty() {
        return BTreeSet::new();
    }
    let walls = shard.walls_set();
    let radius = positions.len().min(MAX_VIEW_DEPTH);
    let mut visited: BTreeSet<Tile> = positions.iter().copied().collect();
    let mut queue: VecDeque<(Tile, usize)> = positions.into_iter().map(|p| (p, 0)).collect();
    while let Some((tile, depth)) = queue.pop_front() {
        if depth >= radius {
            continue;
        }
        for neighbor in adjacent_tiles(tile, grid, &walls) {
            if visited.insert(neighbor) {
                queue.push_back((neighbor, depth + 1));
            }
        }
    }
    visited
}

/// Render the ASCII keypad grid a process receives each tick.
#[must_use]
pub fn render_process_grid(shard: &Shard, id: ProcessId, grid: Grid) -> String {
    let Some(proc) = shard.processes.get(id) else {
        return String::new();
    };
    let cluster = adjacent_cluster(shard, id);
    let visible = visible_tiles(shard, &cluster, grid);
    if visible.is_empty() {
        return String::new();
    }
    let min_x = visible.iter().map(|t| t.x).min().unwrap_or(0);
    let max_x = visible.iter().map(|t| t.x).max().unwrap_or(0);
    let min_y = visible.iter().map(|t| t.y).min().unwrap_or(0);
    let max_y = visible.iter().map(|t| t.y).max().unwrap_or(0);

    let mut rows = Vec::new();
    for y in min_y..=max_y {
        let mut row = String::new();
        for x in min_x..=max_x {
            let tile = Tile::new(x, y);
            if !visible.contains(&tile) {
                row.push_str(&" ".repeat(10));
                continue;
            }
            let label = tile_label(shard, id, proc.pos, tile);
            let digit = keypad_digit(proc.pos, tile)
                .map(|d| d.to_string())
                .unwrap_or_else(|| " ".to_string());
            row.push_str(&format!("[{digit} {label:<5}] "));
        }
        rows.push(row.trim_end().to_string());
    }
    rows.join("\n")
}

fn tile_label(shard: &Shard, viewer: ProcessId, viewer_pos: Tile, tile: Tile) -> &'static str {
    if tile == viewer_pos {
        return "SELF";
    }
    if shard.defragger.pos == tile {
        return "DEFRG";
    }
    let foreign = shard
        .processes
        .iter()
        .any(|(id, p)| id != viewer && p.alive && p.pos == tile);
    if foreign {
        return "PROC";
    }
    if shard.gates.iter().any(|g| g.pos == tile) {
        return "GATE";
    }
    ""
}

/// Build the spectator projection for a shard.
#[must_use]
pub fn render_spectator_view(shard: &Shard, grid: Grid) -> SpectatorView {
    let size = grid.size();
    let mut cells: Vec<Vec<char>> = vec![vec!['.'; size as usize]; size as usize];
    for gate in &shard.gates {
        cells[gate.pos.y as usize][gate.pos.x as usize] = match gate.kind {
            GateKind::Stable => 'S',
            GateKind::Ghost => 'G',
        };
    }
    for proc in shard.processes.values().filter(|p| p.alive) {
        cells[proc.pos.y as usize][proc.pos.x as usize] = 'P';
    }
    cells[shard.defragger.pos.y as usize][shard.defragger.pos.x as usize] = 'D';
    for echo in &shard.echo_tiles {
        let (x, y) = (echo.pos.x, echo.pos.y);
        if grid.in_bounds(echo.pos) && cells[y as usize][x as usize] == '.' {
            cells[y as usize][x as usize] = 'E';
        }
    }

    let target_pos = shard
        .defragger
        .target_id
        .and_then(|id| shard.processes.get(id))
        .map(|p| p.pos);
    let preview = target_pos
        .map(|goal| {
            let walls = shard.walls_set();
            bfs_path(shard.defragger.pos, goal, grid, &walls)
                .into_iter()
                .skip(1)
                .collect()
        })
        .unwrap_or_default();

    SpectatorView {
        tick: shard.tick,
        grid: cells.into_iter().map(|row| row.into_iter().collect()).collect(),
        defragger: shard.defragger.pos,
        defragger_target: target_pos,
        defragger_preview: preview,
        watchdog_quiet_ticks: shard.watchdog.quiet_ticks,
        watchdog_countdown: shard.watchdog.countdown,
        watchdog_active: shard.watchdog.active,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::state::{Process, ShardId};

    const GRID: Grid = Grid::new(20);

    fn empty_shard() -> Shard {
        Shard::new(
            ShardId(0),
            3,
            GRID,
            BTreeMap::new(),
            Vec::new(),
            Tile::new(0, 0),
        )
    }

    #[test]
    fn visibility_radius_scales_with_cluster() {
        let mut shard = empty_shard();
        let p1 = shard.processes.insert(Process::new("A", Tile::new(5, 5)));

        let cluster = adjacent_cluster(&shard, p1);
        let visible = visible_tiles(&shard, &cluster, GRID);
        assert!(visible.contains(&Tile::new(6, 5)));
        assert!(!visible.contains(&Tile::new(7, 5)));

        shard.processes.insert(Process::new("B", Tile::new(6, 5)));
        let cluster = adjacent_cluster(&shard, p1);
        let visible = visible_tiles(&shard, &cluster, GRID);
        assert!(visible.contains(&Tile::new(8, 5)));
        assert!(!visible.contains(&Tile::new(9, 5)));

        shard.processes.insert(Process::new("C", Tile::new(7, 5)));
        let cluster = adjacent_cluster(&shard, p1);
        let visible = visible_tiles(&shard, &cluster, GRID);
        assert!(visible.contains(&Tile::new(10, 5)));
        assert!(!visible.contains(&Tile::new(11, 5)));

        shard.processes.insert(Process::new("D", Tile::new(8, 5)));
        let cluster = adjacent_cluster(&shard, p1);
        let visible = visible_tiles(&shard, &cluster, GRID);
        assert!(visible.contains(&Tile::new(12, 5)));
    }

    #[test]
    fn grid_renders_keypad_digits_and_labels() {
        let mut shard = empty_shard();
        shard.defragger.pos = Tile::new(6, 5);
        let p1 = shard.processes.insert(Process::new("A", Tile::new(5, 5)));
        let rendered = render_process_grid(&shard, p1, GRID);
        assert!(rendered.contains("[5 SELF"));
        assert!(rendered.contains("[6 DEFRG"));
        // Out-of-keypad visible tiles carry no digit.
        assert!(!rendered.contains('0'));
    }

    #[test]
    fn walled_off_neighbors_are_not_rendered() {
        let mut shard = empty_shard();
        // Box the process against the corner with its east edge walled.
        shard.walls.insert(
            0,
            crate::geometry::WallEdge::new(Tile::new(0, 0), Tile::new(1, 0)),
        );
        let p1 = shard.processes.insert(Process::new("A", Tile::new(0, 0)));
        shard.defragger.pos = Tile::new(10, 10);
        let cluster = adjacent_cluster(&shard, p1);
        let visible = visible_tiles(&shard, &cluster, GRID);
        assert!(!visible.contains(&Tile::new(1, 0)));
        assert!(visible.contains(&Tile::new(0, 1)));
    }

    #[test]
    fn spectator_view_marks_every_entity_kind() {
        let mut shard = empty_shard();
        shard.gates = vec![
            crate::state::Gate {
                kind: GateKind::Stable,
                pos: Tile::new(2, 2),
            },
            crate::state::Gate {
                kind: GateKind::Ghost,
                pos: Tile::new(8, 8),
            },
        ];
        shard.defragger.pos = Tile::new(0, 0);
        shard.processes.insert(Process::new("A", Tile::new(4, 4)));
        shard.echo_tiles.push(crate::state::EchoTile {
            pos: Tile::new(6, 6),
            tick: 0,
        });
        let view = render_spectator_view(&shard, GRID);
        assert_eq!(view.grid[2].chars().nth(2), Some('S'));
        assert_eq!(view.grid[8].chars().nth(8), Some('G'));
        assert_eq!(view.grid[4].chars().nth(4), Some('P'));
        assert_eq!(view.grid[0].chars().nth(0), Some('D'));
        assert_eq!(view.grid[6].chars().nth(6), Some('E'));
    }
}
