//! Plain shard state: tiles, walls, gates, processes, defragger, counters.
//!
//! Entities reference each other by id; the shard's tick pipeline is the
//! sole authority for lookup and mutation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use slotmap::{Key, SecondaryMap, SlotMap, new_key_type};

use crate::geometry::{Grid, Tile, WallEdge, WallSet, adjacent};
use crate::watchdog::Watchdog;

new_key_type! {
    /// Ephemeral per-shard process handle backed by a generational slot map.
    pub struct ProcessId;
}

/// Integer form of a process id, as exposed in replay snapshots.
#[must_use]
pub fn process_key(id: ProcessId) -> u64 {
    id.data().as_ffi()
}

/// Shard identifier, unique for the lifetime of an engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ShardId(pub u64);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{:06}", self.0)
    }
}

/// Identifier for a wall edge within a shard; lowest id wins drift contention.
pub type WallId = u32;

/// Command vocabulary accepted by the core.
///
/// Verbs with text payloads are routed immediately at intake and never land
/// in the buffered slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Move(u8),
    Buffer(u8),
    Idle,
    Broadcast(String),
    Say(String),
}

impl Command {
    /// Verb string used by the replay contract.
    #[must_use]
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Move(_) => "MOVE",
            Command::Buffer(_) => "BUFFER",
            Command::Idle => "IDLE",
            Command::Broadcast(_) => "BROADCAST",
            Command::Say(_) => "SAY",
        }
    }

    /// Keypad argument, if the verb carries one.
    #[must_use]
    pub fn keypad_arg(&self) -> Option<u8> {
        match self {
            Command::Move(d) | Command::Buffer(d) => Some(*d),
            _ => None,
        }
    }
}

/// Tile-valued exit kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateKind {
    Stable,
    Ghost,
}

impl GateKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            GateKind::Stable => "stable",
            GateKind::Ghost => "ghost",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gate {
    pub kind: GateKind,
    pub pos: Tile,
}

/// Sentinel for a process that has never sprinted.
pub const NEVER_SPRINTED: i64 = -999;

/// One participant in a shard.
#[derive(Debug, Clone)]
pub struct Process {
    /// Persistent identity key into the external identity store.
    pub call_sign: String,
    pub pos: Tile,
    pub alive: bool,
    /// Single-slot buffered command, last valid write wins.
    pub buffered: Command,
    pub los_lock: bool,
    pub last_sprint_tick: i64,
}

impl Process {
    #[must_use]
    pub fn new(call_sign: impl Into<String>, pos: Tile) -> Self {
        Self {
            call_sign: call_sign.into(),
            pos,
            alive: true,
            buffered: Command::Idle,
            los_lock: false,
            last_sprint_tick: NEVER_SPRINTED,
        }
    }
}

/// Why the defragger is heading where it is heading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetReason {
    Broadcast,
    Los,
    Watchdog,
    Patrol,
}

impl TargetReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TargetReason::Broadcast => "broadcast",
            TargetReason::Los => "los",
            TargetReason::Watchdog => "watchdog",
            TargetReason::Patrol => "patrol",
        }
    }
}

/// The shard's predator entity.
#[derive(Debug, Clone)]
pub struct Defragger {
    pub pos: Tile,
    pub target_id: Option<ProcessId>,
    pub target_reason: Option<TargetReason>,
    pub last_los_target: Option<ProcessId>,
    /// Tick on which the current LOS lock was freshly acquired; drives the
    /// one-tick grace before the first strike.
    pub target_acquired_tick: Option<u64>,
    /// Per-tile visit counts backing the under-visited patrol bias.
    visit_counts: Vec<u32>,
}

impl Defragger {
    #[must_use]
    pub fn new(pos: Tile, grid: Grid) -> Self {
        let area = (grid.size() as usize).pow(2);
        Self {
            pos,
            target_id: None,
            target_reason: None,
            last_los_target: None,
            target_acquired_tick: None,
            visit_counts: vec![0; area],
        }
    }

    #[must_use]
    pub fn visits(&self, tile: Tile, grid: Grid) -> u32 {
        self.visit_counts[tile_index(tile, grid)]
    }

    pub fn record_visit(&mut self, tile: Tile, grid: Grid) {
        let idx = tile_index(tile, grid);
        self.visit_counts[idx] = self.visit_counts[idx].saturating_add(1);
    }
}

fn tile_index(tile: Tile, grid: Grid) -> usize {
    (tile.y * grid.size() + tile.x) as usize
}

/// One broadcast received during the open tick window.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub process_id: ProcessId,
    pub message: String,
    pub timestamp_ms: u64,
}

/// Short-lived marker where a process was just terminated.
#[derive(Debug, Clone, Copy)]
pub struct EchoTile {
    pub pos: Tile,
    pub tick: u64,
}

#[derive(Debug, Clone)]
pub struct SayRecipient {
    pub process_id: ProcessId,
    pub pos: Tile,
}

/// Local-chat trace kept for spectators and the replay record.
#[derive(Debug, Clone)]
pub struct SayEvent {
    pub sender: ProcessId,
    pub sender_pos: Tile,
    pub message: String,
    pub recipients: Vec<SayRecipient>,
    pub timestamp_ms: u64,
    pub tick: u64,
}

/// Event kinds drained through the perception payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    System,
    Broadcast,
    StaticBurst,
    Noise,
    LocalChat,
}

/// One entry in a process's perception event queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub kind: EventKind,
    pub message: String,
    pub timestamp_ms: u64,
}

/// Per-tick accumulator of lifecycle events, reset at every tick start.
#[derive(Debug, Clone, Default)]
pub struct TickEvents {
    pub kills: Vec<ProcessId>,
    pub survivals: Vec<ProcessId>,
    pub ghosts: Vec<ProcessId>,
    pub spawns: Vec<ProcessId>,
}

/// Liveness observations of the in-progress tick window; the watchdog
/// consumes and resets them at the next tick boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct LivenessInputs {
    pub kill: bool,
    pub broadcast: bool,
    pub new_lock: bool,
    pub adjacency: bool,
}

impl LivenessInputs {
    #[must_use]
    pub fn is_quiet(self) -> bool {
        !(self.kill || self.broadcast || self.new_lock || self.adjacency)
    }
}

/// Cumulative per-shard counters, reported on finalize.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardTotals {
    pub processes: u64,
    pub kills: u64,
    pub survivals: u64,
    pub ghosts: u64,
}

/// One isolated game instance. All mutation happens inside the tick pipeline.
#[derive(Debug)]
pub struct Shard {
    pub shard_id: ShardId,
    pub seed: u64,
    pub tick: u64,
    pub walls: BTreeMap<WallId, WallEdge>,
    pub gates: Vec<Gate>,
    pub processes: SlotMap<ProcessId, Process>,
    pub defragger: Defragger,
    pub watchdog: Watchdog,
    pub broadcasts: Vec<Broadcast>,
    pub say_events: Vec<SayEvent>,
    pub echo_tiles: Vec<EchoTile>,
    pub events: TickEvents,
    pub totals: ShardTotals,
    pub terminated: bool,
    pub fault: Option<String>,
    pub(crate) event_queues: SecondaryMap<ProcessId, Vec<ProcessEvent>>,
    pub(crate) pending_spawn_events: Vec<ProcessId>,
    pub(crate) liveness: LivenessInputs,
    pub(crate) noise_burst_remaining: u32,
    pub(crate) below_min_ticks: u32,
    /// Wall budget fixed at creation; drift must preserve it exactly.
    pub(crate) wall_budget: usize,
}

impl Shard {
    #[must_use]
    pub fn new(
        shard_id: ShardId,
        seed: u64,
        grid: Grid,
        walls: BTreeMap<WallId, WallEdge>,
        gates: Vec<Gate>,
        defragger_pos: Tile,
    ) -> Self {
        let wall_budget = walls.len();
        Self {
            shard_id,
            seed,
            tick: 0,
            walls,
            gates,
            processes: SlotMap::with_key(),
            defragger: Defragger::new(defragger_pos, grid),
            watchdog: Watchdog::default(),
            broadcasts: Vec::new(),
            say_events: Vec::new(),
            echo_tiles: Vec::new(),
            events: TickEvents::default(),
            totals: ShardTotals::default(),
            terminated: false,
            fault: None,
            event_queues: SecondaryMap::new(),
            pending_spawn_events: Vec::new(),
            liveness: LivenessInputs::default(),
            noise_burst_remaining: 0,
            below_min_ticks: 0,
            wall_budget,
        }
    }

    /// Materialized wall set for geometric queries.
    #[must_use]
    pub fn walls_set(&self) -> WallSet {
        self.walls.values().copied().collect()
    }

    /// The live process occupying `tile`, if any.
    #[must_use]
    pub fn process_at(&self, tile: Tile) -> Option<ProcessId> {
        self.processes
            .iter()
            .find(|(_, p)| p.alive && p.pos == tile)
            .map(|(id, _)| id)
    }

    /// Ids of live processes in slot order.
    #[must_use]
    pub fn live_process_ids(&self) -> Vec<ProcessId> {
        self.processes
            .iter()
            .filter(|(_, p)| p.alive)
            .map(|(id, _)| id)
            .collect()
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.processes.values().filter(|p| p.alive).count()
    }

    /// Insert a process and queue its spawn notice for the next tick.
    pub fn spawn_process(&mut self, call_sign: impl Into<String>, pos: Tile) -> ProcessId {
        let id = self.processes.insert(Process::new(call_sign, pos));
        self.event_queues.insert(id, Vec::new());
        self.pending_spawn_events.push(id);
        self.totals.processes += 1;
        id
    }

    /// Remove a process and its event queue.
    pub fn remove_process(&mut self, id: ProcessId) -> Option<Process> {
        self.event_queues.remove(id);
        self.processes.remove(id)
    }

    /// Wall-aware adjacency between two tiles of this shard.
    #[must_use]
    pub fn tiles_adjacent(&self, a: Tile, b: Tile) -> bool {
        adjacent(a, b, &self.walls_set())
    }

    /// Append an event to one process's queue.
    pub(crate) fn push_event(&mut self, id: ProcessId, event: ProcessEvent) {
        if let Some(queue) = self.event_queues.get_mut(id) {
            queue.push(event);
        }
    }

    /// Append an event to every live process's queue.
    pub(crate) fn push_event_all(&mut self, event: &ProcessEvent) {
        let ids = self.live_process_ids();
        for id in ids {
            self.push_event(id, event.clone());
        }
    }

    /// Drain the perception event queue for a process.
    pub fn drain_events(&mut self, id: ProcessId) -> Vec<ProcessEvent> {
        self.event_queues
            .get_mut(id)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}
