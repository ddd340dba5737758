//! Per-shard tick pipeline and out-of-band intake handlers.

use rand::Rng;
use rand::rngs::SmallRng;
use rand::{SeedableRng, seq::IndexedRandom};
use tracing::{debug, error};

use crate::config::EngineConfig;
use crate::defragger;
use crate::drift;
use crate::geometry::{Grid, Tile, keypad_digit};
use crate::movement;
use crate::replay::TickSnapshot;
use crate::state::{
    Broadcast, EchoTile, EventKind, GateKind, LivenessInputs, ProcessEvent, ProcessId,
    SayEvent, SayRecipient, Shard, ShardId, TargetReason, TickEvents, process_key,
};
use crate::watchdog::WatchdogTransition;

/// Probability that a local-chat delivery corrupts into line noise.
const CHAT_ARTIFACT_PROB: f64 = 0.012;
const CHAT_ARTIFACTS: [&str; 2] = ["...", "[STATIC]"];
const CHAT_ARTIFACT_BURST_MAX: u32 = 3;

/// Inputs a tick step needs beyond the shard itself.
#[derive(Debug, Clone, Copy)]
pub struct StepCtx<'a> {
    pub config: &'a EngineConfig,
    /// Wall-clock milliseconds sampled once by the supervisor for this tick.
    pub now_ms: u64,
}

/// A ghost-gate crossing awaiting placement into another shard.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub call_sign: String,
    pub from_shard: ShardId,
    pub old_process: ProcessId,
}

/// What one tick produced for the supervisor.
#[derive(Debug)]
pub struct StepOutcome {
    pub snapshot: TickSnapshot,
    pub transfers: Vec<TransferRequest>,
}

impl Shard {
    /// Deterministic per-tick RNG derived from (shard seed, tick number).
    #[must_use]
    pub fn tick_rng(&self) -> SmallRng {
        let mut mixed = self.seed ^ self.tick.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        mixed ^= mixed >> 30;
        mixed = mixed.wrapping_mul(0xBF58_476D_1CE4_E5B9);
        mixed ^= mixed >> 27;
        SmallRng::seed_from_u64(mixed)
    }

    /// Advance this shard by one tick. Runs to completion; never suspends.
    pub fn step(&mut self, ctx: &StepCtx<'_>) -> StepOutcome {
        self.tick += 1;
        let grid = Grid::new(ctx.config.grid_size);
        let mut rng = self.tick_rng();

        // Spawn notices queued since the last commit surface as this tick's
        // spawn events.
        self.events = TickEvents {
            spawns: std::mem::take(&mut self.pending_spawn_events),
            ..TickEvents::default()
        };

        // Watchdog runs on the previous window's liveness inputs; tick-start
        // adjacency seeds the new window.
        let previous = std::mem::take(&mut self.liveness);
        self.advance_watchdog(previous, ctx.now_ms);
        let walls = self.walls_set();
        if self
            .processes
            .values()
            .any(|p| p.alive && crate::geometry::adjacent(p.pos, self.defragger.pos, &walls))
        {
            self.liveness.adjacency = true;
        }

        // Simultaneous movement against pre-drift topology.
        let moves =
            movement::resolve_actions(self, grid, ctx.config.sprint_cooldown_ticks, &mut rng);
        let echo_movers = movement::apply_moves(self, &moves);
        for id in echo_movers {
            self.push_event(
                id,
                ProcessEvent {
                    kind: EventKind::Noise,
                    message: "[NOISE]: RESIDUAL STATIC.".into(),
                    timestamp_ms: ctx.now_ms,
                },
            );
        }

        // Gate resolution before the map shifts underfoot.
        let transfers = self.resolve_gates();

        drift::drift_walls(self, grid, &mut rng);
        drift::drift_gates(self, grid, &mut rng);

        self.resolve_defragger(grid, &mut rng, ctx);

        // Close the broadcast window; escalation counts reset with it.
        let broadcasts_closed = std::mem::take(&mut self.broadcasts);

        self.trim_old_say_events(ctx.config.say_retention_ticks);
        self.trim_old_echo_tiles(ctx.config.echo_retention_ticks);

        if self.live_count() < ctx.config.min_active_processes {
            self.below_min_ticks += 1;
        } else {
            self.below_min_ticks = 0;
        }
        if self.below_min_ticks >= ctx.config.shard_termination_quiet_threshold {
            debug!(shard = %self.shard_id, tick = self.tick, "shard below minimum population, terminating");
            self.terminated = true;
        }

        if let Err(violation) = self.verify_invariants(grid) {
            error!(shard = %self.shard_id, tick = self.tick, %violation, "invariant violation, terminating shard");
            self.fault = Some(violation);
            self.terminated = true;
        }

        let snapshot = TickSnapshot::capture(self, grid, &broadcasts_closed);
        StepOutcome {
            snapshot,
            transfers,
        }
    }

    /// Record a broadcast into the open window and fan it out immediately.
    /// Retargeting waits for the next tick boundary.
    pub fn handle_broadcast(&mut self, sender: ProcessId, message: String, timestamp_ms: u64) {
        self.broadcasts.push(Broadcast {
            process_id: sender,
            message: message.clone(),
            timestamp_ms,
        });
        self.liveness.broadcast = true;
        self.push_event_all(&ProcessEvent {
            kind: EventKind::Broadcast,
            message: format!("[BCAST] {message}"),
            timestamp_ms,
        });
    }

    /// Deliver a local chat line to adjacent processes, corrupting the odd
    /// delivery into noise.
    pub fn handle_local_chat(
        &mut self,
        sender: ProcessId,
        message: String,
        timestamp_ms: u64,
        rng: &mut SmallRng,
    ) {
        let Some(sender_pos) = self.processes.get(sender).map(|p| p.pos) else {
            return;
        };
        let walls = self.walls_set();
        let mut recipients: Vec<(ProcessId, Tile)> = self
            .processes
            .iter()
            .filter(|(id, p)| {
                *id != sender && p.alive && crate::geometry::adjacent(sender_pos, p.pos, &walls)
            })
            .map(|(id, p)| (id, p.pos))
            .collect();

        let mut by_spatial = recipients.clone();
        by_spatial.sort_by_key(|(_, pos)| keypad_digit(sender_pos, *pos).unwrap_or(99));
        self.say_events.push(SayEvent {
            sender,
            sender_pos,
            message: message.clone(),
            recipients: by_spatial
                .into_iter()
                .map(|(process_id, pos)| SayRecipient { process_id, pos })
                .collect(),
            timestamp_ms,
            tick: self.tick,
        });

        recipients.sort_by_key(|(id, _)| *id);
        for (id, _) in recipients {
            let event = if self.should_emit_chat_artifact(rng) {
                ProcessEvent {
                    kind: EventKind::Noise,
                    message: (*CHAT_ARTIFACTS.choose(rng).unwrap_or(&CHAT_ARTIFACTS[0]))
                        .to_string(),
                    timestamp_ms,
                }
            } else {
                ProcessEvent {
                    kind: EventKind::LocalChat,
                    message: format!("[ADJACENT: {}] {message}", process_key(sender)),
                    timestamp_ms,
                }
            };
            self.push_event(id, event);
        }
    }

    fn should_emit_chat_artifact(&mut self, rng: &mut SmallRng) -> bool {
        if self.noise_burst_remaining > 0 {
            self.noise_burst_remaining -= 1;
            return true;
        }
        if rng.random::<f64>() < CHAT_ARTIFACT_PROB {
            self.noise_burst_remaining = rng.random_range(1..=CHAT_ARTIFACT_BURST_MAX) - 1;
            return true;
        }
        false
    }

    fn advance_watchdog(&mut self, inputs: LivenessInputs, now_ms: u64) {
        match self.watchdog.observe(inputs.is_quiet()) {
            WatchdogTransition::Idle => {}
            WatchdogTransition::Armed { countdown } => {
                self.emit_global(EventKind::System, "[WARN]: SCHEDULER LIVENESS DEGRADED.", now_ms);
                self.emit_global(
                    EventKind::System,
                    &format!("[WARN]: DEADLOCK MITIGATION IN: {countdown:02} TICKS"),
                    now_ms,
                );
            }
            WatchdogTransition::Counting { countdown } => {
                self.emit_global(
                    EventKind::System,
                    &format!("[WARN]: DEADLOCK MITIGATION IN: {countdown:02} TICKS"),
                    now_ms,
                );
            }
            WatchdogTransition::Fired => {
                self.emit_global(EventKind::System, "[CRITICAL]: WATCHDOG TRIGGERED.", now_ms);
                self.emit_global(
                    EventKind::System,
                    "[CRITICAL]: EXECUTION REBALANCE APPLIED.",
                    now_ms,
                );
            }
            WatchdogTransition::Restored => {
                self.emit_global(EventKind::System, "[OK]: LIVENESS RESTORED.", now_ms);
            }
        }
    }

    /// Resolve processes standing on gates: stable exits, ghost transfers.
    fn resolve_gates(&mut self) -> Vec<TransferRequest> {
        let mut transfers = Vec::new();
        let gate_map: Vec<(Tile, GateKind)> = self.gates.iter().map(|g| (g.pos, g.kind)).collect();
        let ids = self.live_process_ids();
        for id in ids {
            let Some(pos) = self.processes.get(id).map(|p| p.pos) else {
                continue;
            };
            let Some((_, kind)) = gate_map.iter().find(|(gpos, _)| *gpos == pos) else {
                continue;
            };
            match kind {
                GateKind::Stable => {
                    self.events.survivals.push(id);
                    self.totals.survivals += 1;
                    self.remove_process(id);
                }
                GateKind::Ghost => {
                    self.events.ghosts.push(id);
                    self.totals.ghosts += 1;
                    if let Some(proc) = self.remove_process(id) {
                        transfers.push(TransferRequest {
                            call_sign: proc.call_sign,
                            from_shard: self.shard_id,
                            old_process: id,
                        });
                    }
                }
            }
        }
        transfers
    }

    fn resolve_defragger(&mut self, grid: Grid, rng: &mut SmallRng, ctx: &StepCtx<'_>) {
        let choice = defragger::select_target(self, grid);
        self.defragger.target_id = choice.target;
        self.defragger.target_reason = Some(choice.reason);

        let steps = 1 + choice.bonus_steps;
        for _ in 0..steps {
            let Some(next) = defragger::next_step(self, grid, rng) else {
                break;
            };
            // One-tick grace on a freshly acquired LOS lock.
            if choice.reason == TargetReason::Los
                && self.defragger.target_acquired_tick == Some(self.tick)
                && self
                    .defragger
                    .target_id
                    .and_then(|id| self.processes.get(id))
                    .is_some_and(|p| p.pos == next)
            {
                break;
            }
            self.defragger.pos = next;
            self.defragger.record_visit(next, grid);
            if let Some(victim) = self.process_at(next) {
                self.kill_process(victim, ctx.now_ms);
                break;
            }
        }
    }

    /// Terminate a process under the defragger: echo, static burst, removal.
    pub(crate) fn kill_process(&mut self, id: ProcessId, now_ms: u64) {
        let Some(pos) = self.processes.get(id).map(|p| p.pos) else {
            return;
        };
        if let Some(proc) = self.processes.get_mut(id) {
            proc.alive = false;
        }
        self.events.kills.push(id);
        self.totals.kills += 1;
        self.liveness.kill = true;
        self.echo_tiles.push(EchoTile {
            pos,
            tick: self.tick,
        });
        self.emit_global(EventKind::System, "[WARN]: SECTOR CORRUPTED.", now_ms);
        self.emit_global(
            EventKind::StaticBurst,
            "[GLOBAL_ALRT]: ######## STATIC BURST DETECTED ########",
            now_ms,
        );
        self.remove_process(id);
    }

    fn emit_global(&mut self, kind: EventKind, message: &str, timestamp_ms: u64) {
        self.push_event_all(&ProcessEvent {
            kind,
            message: message.to_string(),
            timestamp_ms,
        });
    }

    fn trim_old_say_events(&mut self, max_age: u64) {
        let tick = self.tick;
        self.say_events.retain(|ev| tick - ev.tick <= max_age);
    }

    fn trim_old_echo_tiles(&mut self, max_age: u64) {
        let tick = self.tick;
        self.echo_tiles.retain(|echo| tick - echo.tick <= max_age);
    }

    /// Hard invariants; breaking any of these ends the shard abnormally.
    fn verify_invariants(&self, grid: Grid) -> Result<(), String> {
        let mut seen = std::collections::BTreeSet::new();
        for proc in self.processes.values().filter(|p| p.alive) {
            if !grid.in_bounds(proc.pos) {
                return Err(format!("process out of bounds at {:?}", proc.pos));
            }
            if !seen.insert(proc.pos) {
                return Err(format!("tile shared by two processes at {:?}", proc.pos));
            }
        }
        if self.walls.len() != self.wall_budget {
            return Err(format!(
                "wall count drifted: {} != budget {}",
                self.walls.len(),
                self.wall_budget
            ));
        }
        let walls = self.walls_set();
        if walls.len() != self.walls.len() {
            return Err("two walls occupy one edge slot".into());
        }
        if !crate::geometry::is_fully_connected(grid, &walls) {
            return Err("walkable graph lost connectivity".into());
        }
        Ok(())
    }
}
