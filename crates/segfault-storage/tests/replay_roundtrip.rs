use std::sync::Arc;

use segfault_core::{Command, Engine, EngineConfig, ManualClock, ReplaySink};
use segfault_storage::RecorderPipeline;

fn temp_db(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path()
        .join(name)
        .to_str()
        .expect("utf8 path")
        .to_string()
}

#[test]
fn engine_ticks_land_in_the_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pipeline = RecorderPipeline::new(&temp_db(&dir, "replay.duckdb")).expect("pipeline");
    let storage = pipeline.storage();

    let config = EngineConfig {
        rng_seed: 17,
        ..EngineConfig::default()
    };
    let clock = Arc::new(ManualClock::new(1_000));
    let mut engine =
        Engine::with_sink(config, Box::new(pipeline), clock.clone()).expect("engine");
    let ticket = engine.join("Cache-Fork").expect("join");
    let shard_name = ticket.shard_id.to_string();
    engine
        .submit(&ticket.session_token, Command::Move(6))
        .expect("submit");
    for _ in 0..4 {
        clock.advance(1_000);
        engine.tick_all();
    }
    // Dropping the engine drops the sink, which drains the writer.
    drop(engine);

    let mut guard = storage.lock().expect("storage lock");
    let shards = guard.list_shards(10, 0).expect("list shards");
    assert_eq!(shards.len(), 1);
    assert_eq!(shards[0].shard_id, shard_name);
    assert!(shards[0].ended_at.is_none());

    let ticks = guard.fetch_ticks(&shard_name, 1, 100).expect("fetch ticks");
    assert_eq!(ticks.len(), 4);
    assert_eq!(ticks[0].tick, 1);
    assert_eq!(ticks[0].snapshot.grid_size, 20);
    assert_eq!(ticks[0].snapshot.walls.len(), 80);
    assert!(
        ticks[0]
            .snapshot
            .processes
            .iter()
            .any(|p| p.call_sign == "Cache-Fork")
    );
}

#[test]
fn terminated_shard_is_finalized_in_the_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pipeline = RecorderPipeline::new(&temp_db(&dir, "finalize.duckdb")).expect("pipeline");
    let storage = pipeline.storage();

    let config = EngineConfig {
        rng_seed: 23,
        shard_termination_quiet_threshold: 2,
        ..EngineConfig::default()
    };
    let clock = Arc::new(ManualClock::new(0));
    let mut engine = Engine::with_sink(config, Box::new(pipeline), clock).expect("engine");
    let id = engine.create_shard().expect("shard");
    engine.tick_all();
    engine.tick_all();
    assert_eq!(engine.shard_count(), 0);
    drop(engine);

    let mut guard = storage.lock().expect("storage lock");
    let shards = guard.list_shards(10, 0).expect("list shards");
    let row = shards
        .iter()
        .find(|s| s.shard_id == id.to_string())
        .expect("summary row");
    assert!(row.ended_at.is_some());
    assert_eq!(row.total_ticks, 2);
    assert!(row.fault.is_none());
}

#[test]
fn overflowing_queue_sheds_oldest_with_a_counter() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut pipeline =
        RecorderPipeline::with_capacity(&temp_db(&dir, "overflow.duckdb"), 2).expect("pipeline");
    let storage = pipeline.storage();

    // Park the writer on the store lock so the queue backs up.
    let guard = storage.lock().expect("storage lock");
    for tick in 1..=8 {
        pipeline.register_shard(&format!("shard-{tick:06}"), tick);
    }
    assert!(pipeline.dropped_snapshots() > 0);
    drop(guard);
}
