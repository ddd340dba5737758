//! Shard lifecycle, command intake, and the parallel tick fan-out.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::SmallRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::geometry::{Grid, Tile, WallEdge, WallSet, edge_slots, exit_count, is_fully_connected};
use crate::perception::{Perception, SpectatorView, render_process_grid, render_spectator_view};
use crate::replay::{NullSink, ReplaySink, ShardStats, TickSnapshot};
use crate::shard::{StepCtx, StepOutcome, TransferRequest};
use crate::state::{Command, Gate, GateKind, ProcessId, Shard, ShardId, WallId};

/// Broadcast and SAY payloads are clipped to this many code points.
const MESSAGE_LIMIT: usize = 256;
/// Placement attempts before a spawn is rejected.
const PLACEMENT_ATTEMPTS: u32 = 100;
/// Attempts at the full wall budget before thinning the density.
const WALL_LAYOUT_ATTEMPTS: usize = 500;

/// Monotonic time capability; tests inject a manual clock to keep replay
/// snapshots byte-identical across runs.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall-clock milliseconds since the Unix epoch.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Hand-cranked clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self(AtomicU64::new(start_ms))
    }

    pub fn advance(&self, delta_ms: u64) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Errors surfaced to the command intake; core state stays untouched.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("unknown session token")]
    UnknownSession,
    #[error("session expired")]
    SessionExpired,
    #[error("global process capacity exhausted")]
    CapacityExhausted,
    #[error("unknown shard {0}")]
    UnknownShard(ShardId),
    #[error("no free tile found after {0} attempts")]
    NoFreeTile(u32),
    #[error("failed to generate a valid wall layout")]
    WallGeneration,
}

/// Everything a successful join hands back to the boundary layer.
#[derive(Debug, Clone)]
pub struct JoinTicket {
    pub shard_id: ShardId,
    pub process_id: ProcessId,
    pub session_token: String,
}

#[derive(Debug, Clone)]
struct Session {
    shard: ShardId,
    process: ProcessId,
    issued_at_s: u64,
}

/// The engine supervisor: owns every shard, shares them only for read-only
/// projection, and mutates them exclusively inside the tick pipeline.
pub struct Engine {
    config: EngineConfig,
    rng: SmallRng,
    shards: BTreeMap<ShardId, Shard>,
    sessions: BTreeMap<String, Session>,
    next_shard: u64,
    clock: Arc<dyn Clock>,
    sink: Box<dyn ReplaySink>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("shards", &self.shards.len())
            .field("sessions", &self.sessions.len())
            .field("next_shard", &self.next_shard)
            .finish()
    }
}

impl Engine {
    /// Engine with no persistence, on the system clock.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_sink(config, Box::new(NullSink), Arc::new(SystemClock))
    }

    /// Engine wired to a replay sink and a time capability.
    pub fn with_sink(
        config: EngineConfig,
        sink: Box<dyn ReplaySink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let rng = SmallRng::seed_from_u64(config.rng_seed);
        Ok(Self {
            config,
            rng,
            shards: BTreeMap::new(),
            sessions: BTreeMap::new(),
            next_shard: 1,
            clock,
            sink,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn grid(&self) -> Grid {
        Grid::new(self.config.grid_size)
    }

    #[must_use]
    pub fn shard(&self, id: ShardId) -> Option<&Shard> {
        self.shards.get(&id)
    }

    /// Mutable shard access for harnesses; production mutation goes through
    /// the tick pipeline.
    pub fn shard_mut(&mut self, id: ShardId) -> Option<&mut Shard> {
        self.shards.get_mut(&id)
    }

    #[must_use]
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.keys().copied().collect()
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[must_use]
    pub fn process_count(&self) -> usize {
        self.shards.values().map(Shard::live_count).sum()
    }

    /// Create and register an empty shard with generated walls and gates.
    pub fn create_shard(&mut self) -> Result<ShardId, EngineError> {
        let grid = self.grid();
        let id = ShardId(self.next_shard);
        self.next_shard += 1;
        let walls = self.generate_walls(grid)?;
        let gates = self.generate_gates(grid)?;
        let gate_tiles: BTreeSet<Tile> = gates.iter().map(|g| g.pos).collect();
        let defragger_pos = self.random_empty_tile(grid, &BTreeSet::new(), &gate_tiles)?;
        let seed = self.rng.random::<u64>();
        let shard = Shard::new(id, seed, grid, walls, gates, defragger_pos);
        info!(shard = %id, "shard created");
        if self.config.replay_logging_enabled {
            self.sink.register_shard(&id.to_string(), self.clock.now_ms());
        }
        self.shards.insert(id, shard);
        Ok(id)
    }

    /// Place a new process into some shard under its population cap.
    pub fn join(&mut self, call_sign: &str) -> Result<JoinTicket, EngineError> {
        if let Some(max) = self.config.max_total_processes {
            if self.process_count() >= max {
                return Err(EngineError::CapacityExhausted);
            }
        }
        let shard_id = self.find_or_create_shard()?;
        let process_id = self.place_process(shard_id, call_sign)?;
        let session_token = self.mint_token();
        let issued_at_s = self.clock.now_ms() / 1000;
        self.sessions.insert(
            session_token.clone(),
            Session {
                shard: shard_id,
                process: process_id,
                issued_at_s,
            },
        );
        debug!(shard = %shard_id, call_sign, "process joined");
        Ok(JoinTicket {
            shard_id,
            process_id,
            session_token,
        })
    }

    /// Route one command: text verbs fire immediately, movement verbs land
    /// in the single-slot buffer under last-valid-wins.
    pub fn submit(&mut self, token: &str, command: Command) -> Result<(), EngineError> {
        let (shard_id, process_id) = self.resolve_session(token)?;
        let now_ms = self.clock.now_ms();
        let shard = self
            .shards
            .get_mut(&shard_id)
            .ok_or(EngineError::UnknownSession)?;
        if !shard.processes.get(process_id).is_some_and(|p| p.alive) {
            return Err(EngineError::UnknownSession);
        }
        match command {
            Command::Broadcast(text) => {
                shard.handle_broadcast(process_id, clip_message(&text), now_ms);
            }
            Command::Say(text) => {
                let message = clip_message(&text);
                shard.handle_local_chat(process_id, message, now_ms, &mut self.rng);
            }
            buffered => {
                if let Some(proc) = shard.processes.get_mut(process_id) {
                    proc.buffered = buffered;
                }
            }
        }
        Ok(())
    }

    /// Project the locally-knowable view for one process, draining its
    /// event queue.
    pub fn perceive(&mut self, token: &str) -> Result<Perception, EngineError> {
        let (shard_id, process_id) = self.resolve_session(token)?;
        let grid = self.grid();
        let shard = self
            .shards
            .get_mut(&shard_id)
            .ok_or(EngineError::UnknownSession)?;
        let grid_text = render_process_grid(shard, process_id, grid);
        let events = shard.drain_events(process_id);
        Ok(Perception {
            tick: shard.tick,
            grid: grid_text,
            events,
        })
    }

    /// Spectator projection of one shard.
    #[must_use]
    pub fn spectate(&self, shard_id: ShardId) -> Option<SpectatorView> {
        let shard = self.shards.get(&shard_id)?;
        Some(render_spectator_view(shard, self.grid()))
    }

    /// Advance every live shard one tick: parallel across shards, serial
    /// within each, with per-shard panic containment.
    pub fn tick_all(&mut self) {
        let now_ms = self.clock.now_ms();
        let results: Vec<(ShardId, Result<StepOutcome, ()>)> = {
            let config = &self.config;
            let ctx = StepCtx { config, now_ms };
            let mut live: Vec<(ShardId, &mut Shard)> = self
                .shards
                .iter_mut()
                .filter(|(_, shard)| !shard.terminated)
                .map(|(id, shard)| (*id, shard))
                .collect();
            live.par_iter_mut()
                .map(|(id, shard)| {
                    let outcome = catch_unwind(AssertUnwindSafe(|| shard.step(&ctx)));
                    (*id, outcome.map_err(|_| ()))
                })
                .collect()
        };

        let mut transfers: Vec<TransferRequest> = Vec::new();
        for (id, result) in results {
            match result {
                Ok(outcome) => {
                    if self.config.replay_logging_enabled {
                        self.sink.record_tick_snapshot(&outcome.snapshot);
                    }
                    transfers.extend(outcome.transfers);
                }
                Err(()) => {
                    error!(shard = %id, "tick pipeline panicked; containing failure to this shard");
                    if let Some(shard) = self.shards.get_mut(&id) {
                        shard.fault = Some("panic in tick pipeline".into());
                        shard.terminated = true;
                    }
                }
            }
        }

        for request in transfers {
            if let Err(err) = self.place_transfer(&request) {
                warn!(from = %request.from_shard, call_sign = %request.call_sign, %err,
                    "ghost transfer could not be placed");
            }
        }
        self.reap_terminated_shards();
        self.prune_dead_sessions();
    }

    /// Admin termination of a shard: finalize counters and publish the
    /// terminal replay marker.
    pub fn shutdown(&mut self, shard_id: ShardId) -> Result<(), EngineError> {
        let shard = self
            .shards
            .get_mut(&shard_id)
            .ok_or(EngineError::UnknownShard(shard_id))?;
        shard.terminated = true;
        self.reap_terminated_shards();
        self.prune_dead_sessions();
        Ok(())
    }

    /// Capture one snapshot per shard without ticking; used by harnesses.
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<TickSnapshot> {
        let grid = self.grid();
        self.shards
            .values()
            .map(|shard| TickSnapshot::capture(shard, grid, &shard.broadcasts))
            .collect()
    }

    fn resolve_session(&mut self, token: &str) -> Result<(ShardId, ProcessId), EngineError> {
        let session = self
            .sessions
            .get(token)
            .cloned()
            .ok_or(EngineError::UnknownSession)?;
        if let Some(ttl) = self.config.session_ttl_seconds {
            let now_s = self.clock.now_ms() / 1000;
            if now_s.saturating_sub(session.issued_at_s) > ttl {
                self.sessions.remove(token);
                return Err(EngineError::SessionExpired);
            }
        }
        Ok((session.shard, session.process))
    }

    fn find_or_create_shard(&mut self) -> Result<ShardId, EngineError> {
        let cap = self.config.max_processes_per_shard;
        let existing = self
            .shards
            .iter()
            .find(|(_, shard)| !shard.terminated && shard.live_count() < cap)
            .map(|(id, _)| *id);
        match existing {
            Some(id) => Ok(id),
            None => self.create_shard(),
        }
    }

    /// Spawn onto a random walkable tile away from gates and the defragger.
    fn place_process(
        &mut self,
        shard_id: ShardId,
        call_sign: &str,
    ) -> Result<ProcessId, EngineError> {
        let grid = self.grid();
        let shard = self
            .shards
            .get_mut(&shard_id)
            .ok_or(EngineError::UnknownShard(shard_id))?;
        let occupied: BTreeSet<Tile> = shard
            .processes
            .values()
            .filter(|p| p.alive)
            .map(|p| p.pos)
            .collect();
        let mut forbidden: BTreeSet<Tile> = shard.gates.iter().map(|g| g.pos).collect();
        let dpos = shard.defragger.pos;
        for dy in -1..=1 {
            for dx in -1..=1 {
                forbidden.insert(dpos.offset(dx, dy));
            }
        }
        let pos = random_empty_tile(&mut self.rng, grid, &occupied, &forbidden)?;
        Ok(shard.spawn_process(call_sign, pos))
    }

    fn place_transfer(&mut self, request: &TransferRequest) -> Result<(), EngineError> {
        let cap = self.config.max_processes_per_shard;
        let destination = self
            .shards
            .iter()
            .find(|(id, shard)| {
                **id != request.from_shard && !shard.terminated && shard.live_count() < cap
            })
            .map(|(id, _)| *id);
        let destination = match destination {
            Some(id) => id,
            None => self.create_shard()?,
        };
        let new_process = self.place_process(destination, &request.call_sign)?;
        // Carry surviving sessions over to the reincarnated process.
        for session in self.sessions.values_mut() {
            if session.shard == request.from_shard && session.process == request.old_process {
                session.shard = destination;
                session.process = new_process;
            }
        }
        debug!(from = %request.from_shard, to = %destination, call_sign = %request.call_sign,
            "ghost transfer placed");
        Ok(())
    }

    fn reap_terminated_shards(&mut self) {
        let finished: Vec<ShardId> = self
            .shards
            .iter()
            .filter(|(_, shard)| shard.terminated)
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            let Some(shard) = self.shards.remove(&id) else {
                continue;
            };
            info!(shard = %id, ticks = shard.tick, fault = shard.fault.as_deref().unwrap_or("none"),
                "shard finalized");
            if self.config.replay_logging_enabled {
                let stats = ShardStats {
                    total_processes: shard.totals.processes,
                    total_kills: shard.totals.kills,
                    total_survivals: shard.totals.survivals,
                    total_ghosts: shard.totals.ghosts,
                    fault: shard.fault.clone(),
                };
                self.sink
                    .finalize_shard(&id.to_string(), shard.tick, &stats);
            }
        }
    }

    fn prune_dead_sessions(&mut self) {
        let shards = &self.shards;
        self.sessions.retain(|_, session| {
            shards
                .get(&session.shard)
                .is_some_and(|shard| shard.processes.contains_key(session.process))
        });
    }

    fn mint_token(&mut self) -> String {
        format!(
            "{:016x}{:016x}",
            self.rng.random::<u64>(),
            self.rng.random::<u64>()
        )
    }

    /// Sample wall layouts until one is connected with no dead cells,
    /// thinning the density if the full budget never validates.
    fn generate_walls(&mut self, grid: Grid) -> Result<BTreeMap<WallId, WallEdge>, EngineError> {
        let slots = edge_slots(grid);
        let target = self.config.wall_count.min(slots.len());
        for _ in 0..WALL_LAYOUT_ATTEMPTS {
            if let Some(walls) = self.try_wall_sample(&slots, target, grid) {
                return Ok(walls);
            }
        }
        let mut count = target.saturating_sub(10);
        loop {
            for _ in 0..200 {
                if let Some(walls) = self.try_wall_sample(&slots, count, grid) {
                    warn!(target, settled = count, "wall layout thinned to satisfy invariants");
                    return Ok(walls);
                }
            }
            if count == 0 {
                return Err(EngineError::WallGeneration);
            }
            count = count.saturating_sub(10);
        }
    }

    fn try_wall_sample(
        &mut self,
        slots: &[WallEdge],
        count: usize,
        grid: Grid,
    ) -> Option<BTreeMap<WallId, WallEdge>> {
        let selected: Vec<WallEdge> = slots
            .choose_multiple(&mut self.rng, count)
            .copied()
            .collect();
        let walls_set: WallSet = selected.iter().copied().collect();
        if walls_set.len() != selected.len() || !walls_valid(grid, &walls_set) {
            return None;
        }
        Some(
            selected
                .into_iter()
                .enumerate()
                .map(|(i, e)| (i as WallId, e))
                .collect(),
        )
    }

    /// One stable gate plus 1..=3 ghost gates, spaced apart.
    fn generate_gates(&mut self, grid: Grid) -> Result<Vec<Gate>, EngineError> {
        let mut gates = vec![Gate {
            kind: GateKind::Stable,
            pos: random_empty_tile(&mut self.rng, grid, &BTreeSet::new(), &BTreeSet::new())?,
        }];
        let ghost_count = self.rng.random_range(1..=3);
        for _ in 0..ghost_count {
            let pos = self.spaced_gate_tile(grid, &gates)?;
            gates.push(Gate {
                kind: GateKind::Ghost,
                pos,
            });
        }
        Ok(gates)
    }

    fn spaced_gate_tile(&mut self, grid: Grid, gates: &[Gate]) -> Result<Tile, EngineError> {
        for _ in 0..PLACEMENT_ATTEMPTS {
            let tile = Tile::new(
                self.rng.random_range(0..grid.size()),
                self.rng.random_range(0..grid.size()),
            );
            if gates.iter().all(|g| tile.chebyshev(g.pos) >= 3) {
                return Ok(tile);
            }
        }
        Err(EngineError::NoFreeTile(PLACEMENT_ATTEMPTS))
    }

    fn random_empty_tile(
        &mut self,
        grid: Grid,
        occupied: &BTreeSet<Tile>,
        forbidden: &BTreeSet<Tile>,
    ) -> Result<Tile, EngineError> {
        random_empty_tile(&mut self.rng, grid, occupied, forbidden)
    }
}

fn clip_message(text: &str) -> String {
    text.chars().take(MESSAGE_LIMIT).collect()
}

fn random_empty_tile(
    rng: &mut SmallRng,
    grid: Grid,
    occupied: &BTreeSet<Tile>,
    forbidden: &BTreeSet<Tile>,
) -> Result<Tile, EngineError> {
    for _ in 0..PLACEMENT_ATTEMPTS {
        let tile = Tile::new(
            rng.random_range(0..grid.size()),
            rng.random_range(0..grid.size()),
        );
        if !occupied.contains(&tile) && !forbidden.contains(&tile) {
            return Ok(tile);
        }
    }
    Err(EngineError::NoFreeTile(PLACEMENT_ATTEMPTS))
}

fn walls_valid(grid: Grid, walls: &WallSet) -> bool {
    if !is_fully_connected(grid, walls) {
        return false;
    }
    grid.tiles().all(|tile| exit_count(tile, grid, walls) > 0)
}
