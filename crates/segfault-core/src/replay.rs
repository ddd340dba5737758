//! Replay snapshot contract and the persistence capability.
//!
//! One snapshot per shard per tick; the key set is a bit-exact contract with
//! the persistence collaborator, which enforces uniqueness of
//! `(shard_id, tick)`.

use serde::{Deserialize, Serialize};

use crate::geometry::Grid;
use crate::state::{Broadcast, Shard, process_key};

/// Snapshot of one shard at one tick commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickSnapshot {
    pub shard_id: String,
    pub tick: u64,
    pub grid_size: i32,
    /// Wall edges as `[ax, ay, bx, by]`, sorted canonically.
    pub walls: Vec<[i32; 4]>,
    pub gates: Vec<GateSnapshot>,
    pub processes: Vec<ProcessSnapshot>,
    pub defragger: DefraggerSnapshot,
    pub watchdog: WatchdogSnapshot,
    pub broadcasts: Vec<BroadcastSnapshot>,
    pub say_events: Vec<SaySnapshot>,
    pub echo_tiles: Vec<EchoSnapshot>,
    pub events: EventsSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateSnapshot {
    pub pos: [i32; 2],
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessSnapshot {
    pub id: u64,
    pub call_sign: String,
    pub pos: [i32; 2],
    pub alive: bool,
    pub buffered_cmd: String,
    pub buffered_arg: Option<String>,
    pub los_lock: bool,
    pub last_sprint_tick: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DefraggerSnapshot {
    pub pos: [i32; 2],
    pub target_id: Option<u64>,
    pub target_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchdogSnapshot {
    pub quiet_ticks: u32,
    pub countdown: u32,
    pub active: bool,
    pub bonus_step: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BroadcastSnapshot {
    pub process_id: u64,
    pub message: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SaySnapshot {
    pub sender_id: u64,
    pub sender_pos: [i32; 2],
    pub message: String,
    pub recipients: Vec<SayRecipientSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SayRecipientSnapshot {
    pub id: u64,
    pub pos: [i32; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EchoSnapshot {
    pub pos: [i32; 2],
    pub tick: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EventsSnapshot {
    pub kills: Vec<u64>,
    pub survivals: Vec<u64>,
    pub ghosts: Vec<u64>,
    pub spawns: Vec<u64>,
}

impl TickSnapshot {
    /// Capture a shard at tick commit. `broadcasts` is the just-closed
    /// window, taken before the ledger cleared.
    #[must_use]
    pub fn capture(shard: &Shard, grid: Grid, broadcasts: &[Broadcast]) -> Self {
        let mut walls: Vec<[i32; 4]> = shard.walls.values().map(|w| w.flat()).collect();
        walls.sort_unstable();

        Self {
            shard_id: shard.shard_id.to_string(),
            tick: shard.tick,
            grid_size: grid.size(),
            walls,
            gates: shard
                .gates
                .iter()
                .map(|g| GateSnapshot {
                    pos: g.pos.into(),
                    kind: g.kind.as_str().to_string(),
                })
                .collect(),
            processes: shard
                .processes
                .iter()
                .map(|(id, p)| ProcessSnapshot {
                    id: process_key(id),
                    call_sign: p.call_sign.clone(),
                    pos: p.pos.into(),
                    alive: p.alive,
                    buffered_cmd: p.buffered.verb().to_string(),
                    buffered_arg: p.buffered.keypad_arg().map(|d| d.to_string()),
                    los_lock: p.los_lock,
                    last_sprint_tick: p.last_sprint_tick,
                })
                .collect(),
            defragger: DefraggerSnapshot {
                pos: shard.defragger.pos.into(),
                target_id: shard.defragger.target_id.map(process_key),
                target_reason: shard
                    .defragger
                    .target_reason
                    .map(|r| r.as_str().to_string()),
            },
            watchdog: WatchdogSnapshot {
                quiet_ticks: shard.watchdog.quiet_ticks,
                countdown: shard.watchdog.countdown,
                active: shard.watchdog.active,
                bonus_step: shard.watchdog.pending_bonus,
            },
            broadcasts: broadcasts
                .iter()
                .map(|b| BroadcastSnapshot {
                    process_id: process_key(b.process_id),
                    message: b.message.clone(),
                    timestamp_ms: b.timestamp_ms,
                })
                .collect(),
            say_events: shard
                .say_events
                .iter()
                .map(|ev| SaySnapshot {
                    sender_id: process_key(ev.sender),
                    sender_pos: ev.sender_pos.into(),
                    message: ev.message.clone(),
                    recipients: ev
                        .recipients
                        .iter()
                        .map(|r| SayRecipientSnapshot {
                            id: process_key(r.process_id),
                            pos: r.pos.into(),
                        })
                        .collect(),
                })
                .collect(),
            echo_tiles: shard
                .echo_tiles
                .iter()
                .map(|e| EchoSnapshot {
                    pos: e.pos.into(),
                    tick: e.tick,
                })
                .collect(),
            events: EventsSnapshot {
                kills: shard.events.kills.iter().copied().map(process_key).collect(),
                survivals: shard
                    .events
                    .survivals
                    .iter()
                    .copied()
                    .map(process_key)
                    .collect(),
                ghosts: shard.events.ghosts.iter().copied().map(process_key).collect(),
                spawns: shard.events.spawns.iter().copied().map(process_key).collect(),
            },
        }
    }
}

/// Cumulative shard counters reported when a shard is finalized.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ShardStats {
    pub total_processes: u64,
    pub total_kills: u64,
    pub total_survivals: u64,
    pub total_ghosts: u64,
    /// Diagnostic marker when the shard ended abnormally.
    pub fault: Option<String>,
}

/// Persistence capability with a small fixed surface; delivery is
/// fire-and-forget and must never block the tick loop.
pub trait ReplaySink: Send {
    fn register_shard(&mut self, shard_id: &str, started_at_ms: u64);
    fn record_tick_snapshot(&mut self, snapshot: &TickSnapshot);
    fn finalize_shard(&mut self, shard_id: &str, total_ticks: u64, stats: &ShardStats);
}

/// Sink that discards everything; used when replay logging is disabled.
#[derive(Debug, Default)]
pub struct NullSink;

impl ReplaySink for NullSink {
    fn register_shard(&mut self, _shard_id: &str, _started_at_ms: u64) {}
    fn record_tick_snapshot(&mut self, _snapshot: &TickSnapshot) {}
    fn finalize_shard(&mut self, _shard_id: &str, _total_ticks: u64, _stats: &ShardStats) {}
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::geometry::{Tile, WallEdge};
    use crate::state::{Gate, GateKind, Process, ShardId};

    #[test]
    fn snapshot_serializes_the_contract_keys() {
        let grid = Grid::new(20);
        let walls = BTreeMap::from([(0, WallEdge::new(Tile::new(1, 1), Tile::new(2, 1)))]);
        let mut shard = Shard::new(
            ShardId(7),
            1,
            grid,
            walls,
            vec![Gate {
                kind: GateKind::Stable,
                pos: Tile::new(3, 3),
            }],
            Tile::new(9, 9),
        );
        shard.tick = 5;
        shard.processes.insert(Process::new("Null-Trace", Tile::new(2, 2)));

        let snapshot = TickSnapshot::capture(&shard, grid, &[]);
        let value = serde_json::to_value(&snapshot).expect("serialize");
        for key in [
            "shard_id",
            "tick",
            "grid_size",
            "walls",
            "gates",
            "processes",
            "defragger",
            "watchdog",
            "broadcasts",
            "say_events",
            "echo_tiles",
            "events",
        ] {
            assert!(value.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(value["shard_id"], "shard-000007");
        assert_eq!(value["walls"][0], serde_json::json!([1, 1, 2, 1]));
        assert_eq!(value["gates"][0]["type"], "stable");
        let proc = &value["processes"][0];
        for key in [
            "id",
            "call_sign",
            "pos",
            "alive",
            "buffered_cmd",
            "buffered_arg",
            "los_lock",
            "last_sprint_tick",
        ] {
            assert!(proc.get(key).is_some(), "missing process key {key}");
        }
        assert_eq!(proc["buffered_cmd"], "IDLE");
        assert_eq!(proc["buffered_arg"], serde_json::Value::Null);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let grid = Grid::new(20);
        let mut shard = Shard::new(
            ShardId(1),
            2,
            grid,
            BTreeMap::new(),
            Vec::new(),
            Tile::new(0, 0),
        );
        shard.tick = 3;
        let snapshot = TickSnapshot::capture(&shard, grid, &[]);
        let text = serde_json::to_string(&snapshot).expect("serialize");
        let parsed: TickSnapshot = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(parsed, snapshot);
    }
}
