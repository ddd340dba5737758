//! Core simulation for SEGFAULT: a tick-synchronous, multi-shard grid
//! horror game in which processes navigate a drifting maze while the
//! Defragmenter hunts them.
//!
//! The engine is deterministic: a seed plus an ordered, timestamped command
//! stream reproduces byte-identical replay snapshots. Shards tick in
//! parallel but are strictly serial inside, and never observe each other.

pub mod config;
pub mod defragger;
pub mod drift;
pub mod engine;
pub mod geometry;
pub mod movement;
pub mod perception;
pub mod replay;
pub mod shard;
pub mod state;
pub mod watchdog;

pub use config::{ConfigError, EngineConfig};
pub use defragger::{FIBONACCI_ESCALATION, escalation_bonus};
pub use engine::{Clock, Engine, EngineError, JoinTicket, ManualClock, SystemClock};
pub use geometry::{Grid, Tile, WallEdge, WallSet};
pub use perception::{Perception, SpectatorView};
pub use replay::{NullSink, ReplaySink, ShardStats, TickSnapshot};
pub use shard::{StepCtx, StepOutcome, TransferRequest};
pub use state::{
    Broadcast, Command, Defragger, EchoTile, EventKind, Gate, GateKind, Process, ProcessEvent,
    ProcessId, SayEvent, Shard, ShardId, TargetReason, TickEvents, process_key,
};
pub use watchdog::{QUIET_TICKS_WARNING, WATCHDOG_COUNTDOWN, Watchdog, WatchdogTransition};
