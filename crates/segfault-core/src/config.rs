//! Engine configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation failures for [`EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("grid_size must be at least 4, got {0}")]
    GridTooSmall(i32),
    #[error("wall_count {wall_count} exceeds the {slots} interior edge slots")]
    TooManyWalls { wall_count: usize, slots: usize },
    #[error("tick cadence range is inverted: {min}..{max}")]
    InvertedCadence { min: u64, max: u64 },
    #[error("max_processes_per_shard must be non-zero")]
    ZeroShardCap,
}

/// Tunable knobs consumed by the core engine.
///
/// The app shell layers `SEGFAULT_*` environment overrides on top of these
/// defaults; the core only ever sees the merged result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Side length of the square tile lattice.
    pub grid_size: i32,
    /// Number of wall edges per shard; invariant across drifts.
    pub wall_count: usize,
    /// Population cap per shard; a join beyond every cap creates a shard.
    pub max_processes_per_shard: usize,
    /// Below this live count a shard starts its termination countdown.
    pub min_active_processes: usize,
    /// Consecutive below-minimum ticks before a shard terminates.
    pub shard_termination_quiet_threshold: u32,
    /// Optional global population ceiling across all shards.
    pub max_total_processes: Option<usize>,
    /// How many ticks an echo tile lingers after the death that made it.
    pub echo_retention_ticks: u64,
    /// How many ticks a local-say trace stays visible to spectators.
    pub say_retention_ticks: u64,
    /// Minimum gap in ticks between two sprints by the same process.
    pub sprint_cooldown_ticks: u64,
    /// Session token lifetime; `None` disables expiry.
    pub session_ttl_seconds: Option<u64>,
    /// Whether tick snapshots are dispatched to the replay sink.
    pub replay_logging_enabled: bool,
    /// Master seed for the supervisor RNG and derived shard seeds.
    pub rng_seed: u64,
    /// Inclusive bounds, in seconds, for the randomized tick cadence.
    pub tick_cadence_seconds: (u64, u64),
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grid_size: 20,
            wall_count: 80,
            max_processes_per_shard: 8,
            min_active_processes: 1,
            shard_termination_quiet_threshold: 12,
            max_total_processes: None,
            echo_retention_ticks: 3,
            say_retention_ticks: 3,
            sprint_cooldown_ticks: 1,
            session_ttl_seconds: None,
            replay_logging_enabled: true,
            rng_seed: 42,
            tick_cadence_seconds: (30, 60),
        }
    }
}

impl EngineConfig {
    /// Check internal consistency before the engine is built from this.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grid_size < 4 {
            return Err(ConfigError::GridTooSmall(self.grid_size));
        }
        let side = self.grid_size as usize;
        let slots = 2 * side * (side - 1);
        if self.wall_count > slots {
            return Err(ConfigError::TooManyWalls {
                wall_count: self.wall_count,
                slots,
            });
        }
        let (min, max) = self.tick_cadence_seconds;
        if min > max {
            return Err(ConfigError::InvertedCadence { min, max });
        }
        if self.max_processes_per_shard == 0 {
            return Err(ConfigError::ZeroShardCap);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        EngineConfig::default().validate().expect("default config");
    }

    #[test]
    fn rejects_wall_overflow() {
        let config = EngineConfig {
            grid_size: 4,
            wall_count: 1000,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooManyWalls { .. })
        ));
    }

    #[test]
    fn rejects_inverted_cadence() {
        let config = EngineConfig {
            tick_cadence_seconds: (60, 30),
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvertedCadence { .. })
        ));
    }
}
