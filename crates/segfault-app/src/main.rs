//! Headless SEGFAULT shell: wires the engine to DuckDB persistence, runs the
//! randomized tick cadence, and optionally drives a handful of demo
//! processes so a local run has something to hunt.

use std::sync::Arc;
use std::time::Duration;
use std::{env, fs, path::Path, thread};

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use segfault_core::{Command, Engine, EngineConfig, JoinTicket, SystemClock};
use segfault_storage::RecorderPipeline;

#[derive(Parser, Debug)]
#[command(name = "segfault", version, about = "SEGFAULT simulation shell")]
struct AppCli {
    /// Replay database path; SEGFAULT_DB_PATH overrides.
    #[arg(long)]
    db: Option<String>,

    /// Master RNG seed; SEGFAULT_RANDOM_SEED overrides.
    #[arg(long)]
    seed: Option<u64>,

    /// Number of ticks to run; 0 runs until interrupted.
    #[arg(long, default_value_t = 0)]
    ticks: u64,

    /// Demo processes to keep alive in the grid.
    #[arg(long, default_value_t = 4)]
    demo_processes: usize,

    /// Skip the tick cadence sleep (useful for soak runs).
    #[arg(long, default_value_t = false)]
    fast: bool,
}

fn main() -> Result<()> {
    let cli = AppCli::parse();
    init_tracing();

    let config = compose_config(&cli)?;
    let db_path = cli
        .db
        .clone()
        .or_else(|| env::var("SEGFAULT_DB_PATH").ok())
        .unwrap_or_else(|| "segfault.duckdb".to_string());
    if let Some(parent) = Path::new(&db_path)
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
    {
        fs::create_dir_all(parent)?;
    }

    let pipeline = RecorderPipeline::new(&db_path)
        .with_context(|| format!("opening replay store at {db_path}"))?;
    let storage = pipeline.storage();
    let cadence = config.tick_cadence_seconds;
    let seed = config.rng_seed;
    let mut engine = Engine::with_sink(config, Box::new(pipeline), Arc::new(SystemClock))
        .context("building engine")?;
    info!(db = %db_path, seed, "SEGFAULT engine online");

    let mut driver = DemoDriver::new(cli.demo_processes, seed);
    let mut cadence_rng = SmallRng::seed_from_u64(seed ^ 0x5E6A);
    let mut tick = 0u64;
    loop {
        driver.drive(&mut engine);
        engine.tick_all();
        tick += 1;

        let (kills, survivals, ghosts) = engine
            .shard_ids()
            .into_iter()
            .filter_map(|id| engine.shard(id))
            .fold((0, 0, 0), |acc, shard| {
                (
                    acc.0 + shard.totals.kills,
                    acc.1 + shard.totals.survivals,
                    acc.2 + shard.totals.ghosts,
                )
            });
        info!(
            tick,
            shards = engine.shard_count(),
            processes = engine.process_count(),
            kills,
            survivals,
            ghosts,
            "tick committed"
        );

        if cli.ticks > 0 && tick >= cli.ticks {
            break;
        }
        if !cli.fast {
            let (min, max) = cadence;
            let pause = cadence_rng.random_range(min..=max);
            thread::sleep(Duration::from_secs(pause));
        }
    }
    drop(engine);

    if let Ok(mut guard) = storage.lock() {
        match guard.list_shards(10, 0) {
            Ok(shards) => {
                for shard in shards {
                    info!(
                        shard = %shard.shard_id,
                        ticks = shard.total_ticks,
                        kills = shard.total_kills,
                        "recorded shard"
                    );
                }
            }
            Err(err) => warn!(%err, "could not summarize replay store"),
        }
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Defaults, then `SEGFAULT_*` environment overrides, then CLI flags.
fn compose_config(cli: &AppCli) -> Result<EngineConfig> {
    let mut config = EngineConfig::default();
    if let Some(value) = env_parse::<i32>("SEGFAULT_GRID_SIZE") {
        config.grid_size = value;
    }
    if let Some(value) = env_parse::<usize>("SEGFAULT_WALL_COUNT") {
        config.wall_count = value;
    }
    if let Some(value) = env_parse::<usize>("SEGFAULT_MIN_ACTIVE_PROCESSES") {
        config.min_active_processes = value;
    }
    if let Some(value) = env_parse::<u32>("SEGFAULT_EMPTY_SHARD_TICKS") {
        config.shard_termination_quiet_threshold = value;
    }
    if let Some(value) = env_parse::<u64>("SEGFAULT_RANDOM_SEED") {
        config.rng_seed = value;
    }
    if let Some(min) = env_parse::<u64>("SEGFAULT_TICK_MIN_SECONDS") {
        config.tick_cadence_seconds.0 = min;
    }
    if let Some(max) = env_parse::<u64>("SEGFAULT_TICK_MAX_SECONDS") {
        config.tick_cadence_seconds.1 = max;
    }
    if let Some(value) = env_parse::<bool>("SEGFAULT_REPLAY_LOGGING") {
        config.replay_logging_enabled = value;
    }
    if let Some(seed) = cli.seed {
        config.rng_seed = seed;
    }
    config.validate().context("validating configuration")?;
    Ok(config)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, raw, "ignoring unparseable environment override");
            None
        }
    }
}

const CALL_SIGN_ADJECTIVES: [&str; 5] = ["Static", "Ghost", "Null", "Cache", "Wired"];
const CALL_SIGN_NOUNS: [&str; 5] = ["Runner", "Process", "Echo", "Trace", "Fork"];

/// Keeps a small population of scripted processes wandering the grid.
struct DemoDriver {
    target_population: usize,
    sessions: Vec<JoinTicket>,
    rng: SmallRng,
    minted: u64,
}

impl DemoDriver {
    fn new(target_population: usize, seed: u64) -> Self {
        Self {
            target_population,
            sessions: Vec::new(),
            rng: SmallRng::seed_from_u64(seed ^ 0xD21F),
            minted: 0,
        }
    }

    fn drive(&mut self, engine: &mut Engine) {
        // Top the population back up after deaths and exits.
        while self.sessions.len() < self.target_population {
            let call_sign = self.mint_call_sign();
            match engine.join(&call_sign) {
                Ok(ticket) => {
                    debug!(call_sign, shard = %ticket.shard_id, "demo process joined");
                    self.sessions.push(ticket);
                }
                Err(err) => {
                    warn!(%err, "demo join rejected");
                    break;
                }
            }
        }

        self.sessions.retain(|ticket| {
            let command = Self::pick_command(&mut self.rng);
            match engine.submit(&ticket.session_token, command) {
                Ok(()) => true,
                Err(_) => false,
            }
        });
    }

    fn pick_command(rng: &mut SmallRng) -> Command {
        const DIGITS: [u8; 8] = [1, 2, 3, 4, 6, 7, 8, 9];
        let digit = DIGITS[rng.random_range(0..DIGITS.len())];
        match rng.random_range(0..100u32) {
            0..=69 => Command::Move(digit),
            70..=84 => Command::Buffer(digit),
            85..=92 => Command::Idle,
            93..=96 => Command::Say("anyone out there?".into()),
            _ => Command::Broadcast("marco".into()),
        }
    }

    fn mint_call_sign(&mut self) -> String {
        self.minted += 1;
        let adjective = CALL_SIGN_ADJECTIVES[self.rng.random_range(0..CALL_SIGN_ADJECTIVES.len())];
        let noun = CALL_SIGN_NOUNS[self.rng.random_range(0..CALL_SIGN_NOUNS.len())];
        format!("{adjective}-{noun}-{:03}", self.minted)
    }
}
