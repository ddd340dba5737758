//! DuckDB-backed replay persistence for SEGFAULT.
//!
//! [`ReplayStore`] owns the database and the read surface; [`RecorderPipeline`]
//! is the fire-and-forget [`ReplaySink`] the engine writes through. The tick
//! loop never waits on storage: snapshots land in a bounded queue drained by
//! a dedicated writer thread, and when the queue is full the oldest entry is
//! shed with a diagnostic counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use crossfire::TrySendError;
use crossfire::mpmc::{self, MRx, MTx};
use duckdb::{Connection, params};
use segfault_core::{ReplaySink, ShardStats, TickSnapshot};
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_QUEUE_CAPACITY: usize = 256;
/// Send retries before a snapshot is abandoned outright.
const MAX_ENQUEUE_ATTEMPTS: usize = 8;

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to spawn the recorder thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

/// Summary row for one recorded shard.
#[derive(Debug, Clone)]
pub struct ShardSummary {
    pub shard_id: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub total_ticks: i64,
    pub total_processes: i64,
    pub total_kills: i64,
    pub total_survivals: i64,
    pub total_ghosts: i64,
    pub fault: Option<String>,
}

/// One recorded tick, decoded.
#[derive(Debug, Clone)]
pub struct ReplayTick {
    pub tick: u64,
    pub snapshot: TickSnapshot,
}

/// Synchronous replay database. Writers go through [`RecorderPipeline`];
/// readers may hold this directly.
pub struct ReplayStore {
    conn: Connection,
}

impl ReplayStore {
    /// Open or create the replay database at `path`.
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let mut store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    /// In-memory store for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&mut self) -> Result<(), StorageError> {
        self.conn.execute(
            "create table if not exists replay_shards (
                shard_id text primary key,
                started_at bigint not null,
                ended_at bigint,
                total_ticks bigint not null default 0,
                total_processes bigint not null default 0,
                total_kills bigint not null default 0,
                total_survivals bigint not null default 0,
                total_ghosts bigint not null default 0,
                fault text
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists replay_ticks (
                shard_id text not null,
                tick bigint not null,
                snapshot text not null,
                created_at bigint not null,
                primary key (shard_id, tick)
            )",
            [],
        )?;
        Ok(())
    }

    /// Register a shard the moment it starts ticking.
    pub fn register_shard(&mut self, shard_id: &str, started_at_ms: u64) -> Result<(), StorageError> {
        self.conn.execute(
            "insert or ignore into replay_shards (shard_id, started_at) values (?, ?)",
            params![shard_id, started_at_ms as i64],
        )?;
        Ok(())
    }

    /// Record one tick snapshot. Uniqueness of `(shard_id, tick)` is
    /// enforced here; replays of the same tick are ignored.
    pub fn record_tick(&mut self, snapshot: &TickSnapshot) -> Result<(), StorageError> {
        let payload = serde_json::to_string(snapshot)?;
        self.conn.execute(
            "insert or ignore into replay_ticks (shard_id, tick, snapshot, created_at)
             values (?, ?, ?, ?)",
            params![
                snapshot.shard_id,
                snapshot.tick as i64,
                payload,
                unix_seconds()
            ],
        )?;
        Ok(())
    }

    /// Close out a shard's summary row with its cumulative counters.
    pub fn finalize_shard(
        &mut self,
        shard_id: &str,
        total_ticks: u64,
        stats: &ShardStats,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "update replay_shards set ended_at = ?, total_ticks = ?, total_processes = ?,
                total_kills = ?, total_survivals = ?, total_ghosts = ?, fault = ?
             where shard_id = ?",
            params![
                unix_seconds(),
                total_ticks as i64,
                stats.total_processes as i64,
                stats.total_kills as i64,
                stats.total_survivals as i64,
                stats.total_ghosts as i64,
                stats.fault,
                shard_id
            ],
        )?;
        Ok(())
    }

    /// Page through recorded shards, newest first.
    pub fn list_shards(
        &mut self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ShardSummary>, StorageError> {
        let mut stmt = self.conn.prepare(
            "select shard_id, started_at, ended_at, total_ticks, total_processes,
                    total_kills, total_survivals, total_ghosts, fault
             from replay_shards order by started_at desc, shard_id limit ? offset ?",
        )?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], |row| {
            Ok(ShardSummary {
                shard_id: row.get(0)?,
                started_at: row.get(1)?,
                ended_at: row.get(2)?,
                total_ticks: row.get(3)?,
                total_processes: row.get(4)?,
                total_kills: row.get(5)?,
                total_survivals: row.get(6)?,
                total_ghosts: row.get(7)?,
                fault: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Fetch decoded ticks for a shard from `start_tick`, ascending.
    pub fn fetch_ticks(
        &mut self,
        shard_id: &str,
        start_tick: u64,
        limit: usize,
    ) -> Result<Vec<ReplayTick>, StorageError> {
        let mut stmt = self.conn.prepare(
            "select tick, snapshot from replay_ticks
             where shard_id = ? and tick >= ? order by tick asc limit ?",
        )?;
        let rows = stmt.query_map(
            params![shard_id, start_tick as i64, limit as i64],
            |row| {
                let tick: i64 = row.get(0)?;
                let payload: String = row.get(1)?;
                Ok((tick, payload))
            },
        )?;
        let mut ticks = Vec::new();
        for row in rows {
            let (tick, payload) = row?;
            ticks.push(ReplayTick {
                tick: tick as u64,
                snapshot: serde_json::from_str(&payload)?,
            });
        }
        Ok(ticks)
    }
}

fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

enum RecorderMessage {
    Register {
        shard_id: String,
        started_at_ms: u64,
    },
    Snapshot(Box<TickSnapshot>),
    Finalize {
        shard_id: String,
        total_ticks: u64,
        stats: ShardStats,
    },
}

/// Bounded fire-and-forget bridge between the tick loop and the store.
pub struct RecorderPipeline {
    tx: Option<MTx<RecorderMessage>>,
    reclaim: MRx<RecorderMessage>,
    dropped: Arc<AtomicU64>,
    store: Arc<Mutex<ReplayStore>>,
    worker: Option<JoinHandle<()>>,
}

impl RecorderPipeline {
    /// Pipeline over a database at `path` with the default queue depth.
    pub fn new(path: &str) -> Result<Self, StorageError> {
        Self::with_capacity(path, DEFAULT_QUEUE_CAPACITY)
    }

    /// Pipeline with an explicit queue depth; exposed for tests.
    pub fn with_capacity(path: &str, capacity: usize) -> Result<Self, StorageError> {
        let store = Arc::new(Mutex::new(ReplayStore::open(path)?));
        let (tx, rx) = mpmc::bounded_blocking(capacity);
        let worker_rx = rx.clone();
        let worker_store = Arc::clone(&store);
        let worker = thread::Builder::new()
            .name("replay-recorder".into())
            .spawn(move || writer_loop(worker_rx, worker_store))?;
        Ok(Self {
            tx: Some(tx),
            reclaim: rx,
            dropped: Arc::new(AtomicU64::new(0)),
            store,
            worker: Some(worker),
        })
    }

    /// Shared handle for the read surface.
    #[must_use]
    pub fn storage(&self) -> Arc<Mutex<ReplayStore>> {
        Arc::clone(&self.store)
    }

    /// Snapshots shed because the writer could not keep up.
    #[must_use]
    pub fn dropped_snapshots(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Non-blocking enqueue: on a full queue the oldest entry is shed so the
    /// newest state wins.
    fn enqueue(&self, message: RecorderMessage) {
        let Some(tx) = self.tx.as_ref() else { return };
        let mut message = message;
        for _ in 0..MAX_ENQUEUE_ATTEMPTS {
            match tx.try_send(message) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    if self.reclaim.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    message = returned;
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("replay recorder is gone; snapshot dropped");
                    return;
                }
            }
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!("replay queue thrashing; snapshot dropped");
    }
}

impl Drop for RecorderPipeline {
    fn drop(&mut self) {
        // Disconnect the sender so the writer drains and exits.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl ReplaySink for RecorderPipeline {
    fn register_shard(&mut self, shard_id: &str, started_at_ms: u64) {
        self.enqueue(RecorderMessage::Register {
            shard_id: shard_id.to_string(),
            started_at_ms,
        });
    }

    fn record_tick_snapshot(&mut self, snapshot: &TickSnapshot) {
        self.enqueue(RecorderMessage::Snapshot(Box::new(snapshot.clone())));
    }

    fn finalize_shard(&mut self, shard_id: &str, total_ticks: u64, stats: &ShardStats) {
        self.enqueue(RecorderMessage::Finalize {
            shard_id: shard_id.to_string(),
            total_ticks,
            stats: stats.clone(),
        });
    }
}

fn writer_loop(rx: MRx<RecorderMessage>, store: Arc<Mutex<ReplayStore>>) {
    while let Ok(message) = rx.recv() {
        let Ok(mut guard) = store.lock() else {
            warn!("replay store poisoned; writer exiting");
            return;
        };
        let result = match message {
            RecorderMessage::Register {
                shard_id,
                started_at_ms,
            } => guard.register_shard(&shard_id, started_at_ms),
            RecorderMessage::Snapshot(snapshot) => guard.record_tick(&snapshot),
            RecorderMessage::Finalize {
                shard_id,
                total_ticks,
                stats,
            } => guard.finalize_shard(&shard_id, total_ticks, &stats),
        };
        if let Err(err) = result {
            // Best effort only; the engine must never notice.
            warn!(%err, "replay write failed");
        }
    }
    debug!("replay recorder drained and stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use segfault_core::{Gate, GateKind, Grid, Shard, ShardId, Tile};

    use super::*;

    fn sample_snapshot(shard_id: u64, tick: u64) -> TickSnapshot {
        let grid = Grid::new(20);
        let mut shard = Shard::new(
            ShardId(shard_id),
            1,
            grid,
            BTreeMap::new(),
            vec![Gate {
                kind: GateKind::Stable,
                pos: Tile::new(3, 3),
            }],
            Tile::new(9, 9),
        );
        shard.tick = tick;
        TickSnapshot::capture(&shard, grid, &[])
    }

    #[test]
    fn tick_rows_are_unique_per_shard_and_tick() {
        let mut store = ReplayStore::open_in_memory().expect("store");
        store.register_shard("shard-000001", 0).expect("register");
        let snapshot = sample_snapshot(1, 1);
        store.record_tick(&snapshot).expect("record");
        store.record_tick(&snapshot).expect("duplicate record");
        let ticks = store.fetch_ticks("shard-000001", 0, 10).expect("fetch");
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].snapshot, snapshot);
    }

    #[test]
    fn fetch_respects_start_tick_and_limit() {
        let mut store = ReplayStore::open_in_memory().expect("store");
        store.register_shard("shard-000001", 0).expect("register");
        for tick in 1..=6 {
            store
                .record_tick(&sample_snapshot(1, tick))
                .expect("record");
        }
        let ticks = store.fetch_ticks("shard-000001", 3, 2).expect("fetch");
        let numbers: Vec<u64> = ticks.iter().map(|t| t.tick).collect();
        assert_eq!(numbers, vec![3, 4]);
    }

    #[test]
    fn finalize_updates_the_summary_row() {
        let mut store = ReplayStore::open_in_memory().expect("store");
        store.register_shard("shard-000002", 5_000).expect("register");
        let open = store.list_shards(10, 0).expect("list");
        assert_eq!(open.len(), 1);
        assert!(open[0].ended_at.is_none());

        let stats = ShardStats {
            total_processes: 4,
            total_kills: 2,
            total_survivals: 1,
            total_ghosts: 1,
            fault: None,
        };
        store
            .finalize_shard("shard-000002", 42, &stats)
            .expect("finalize");
        let closed = store.list_shards(10, 0).expect("list");
        assert!(closed[0].ended_at.is_some());
        assert_eq!(closed[0].total_ticks, 42);
        assert_eq!(closed[0].total_kills, 2);
        assert_eq!(closed[0].fault, None);
    }

    #[test]
    fn fault_marker_round_trips() {
        let mut store = ReplayStore::open_in_memory().expect("store");
        store.register_shard("shard-000003", 0).expect("register");
        let stats = ShardStats {
            fault: Some("panic in tick pipeline".into()),
            ..ShardStats::default()
        };
        store
            .finalize_shard("shard-000003", 7, &stats)
            .expect("finalize");
        let rows = store.list_shards(10, 0).expect("list");
        assert_eq!(rows[0].fault.as_deref(), Some("panic in tick pipeline"));
    }
}
