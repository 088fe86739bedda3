//! tessera-bench: drives the schedulers with a synthetic tile workload.
//!
//! Scenarios:
//! - `flat`: independent tiles, one scatter/gather from the main thread
//! - `recursive`: each tile gathers its two children down to level 0
//! - `prioritized`: the recursive workload ordered by tile level
//! - `batched`: leaf tiles acquire their neighbours into one invocation
//! - `no-future`: fire-and-forget runs with duplicate submissions
//!
//! Every scenario logs its wall time and a JSON metrics snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use tessera_core::{load_dotenv, SchedulerConfig};
use tessera_scheduler::{
    work_fn, AcquisitionStrategy, ApproximatelyPrioritizedSharedFutureScheduler, CollectingErrorSink,
    NoFutureScheduler, Scheduler, SchedulerMetrics, SchedulerResult, SharedFutureScheduler, WorkCallback,
    WorkerGroupBuilder,
};

// ── CLI ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    Flat,
    Recursive,
    Prioritized,
    Batched,
    NoFuture,
}

/// Synthetic workload runner for the tessera schedulers.
#[derive(Parser, Debug)]
#[command(name = "tessera-bench", version, about)]
struct Cli {
    /// Workload to run.
    #[arg(long, value_enum, default_value_t = Scenario::Flat)]
    scenario: Scenario,

    /// Number of top-level tiles.
    #[arg(long, env = "BENCH_COUNT", default_value_t = 1000)]
    count: u64,

    /// Worker threads (overrides the configured value).
    #[arg(long)]
    threads: Option<usize>,

    /// Path to a scheduler TOML config; the environment is used otherwise.
    #[arg(long, env = "TESSERA_CONFIG")]
    config: Option<String>,

    /// Level of the top-level tiles in the recursive scenarios (at most 20).
    #[arg(long, default_value_t = 6, value_parser = clap::value_parser!(u8).range(0..=MAX_LEVEL))]
    levels: u8,
}

// ── Workload ────────────────────────────────────────────────────────

/// Deepest pyramid the bench builds; a level-20 tile already has a million leaves.
const MAX_LEVEL: i64 = 20;

/// One tile of a quadtree-like pyramid, flattened to a binary split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Tile {
    level: u8,
    x: u64,
}

impl Tile {
    fn children(&self) -> [Tile; 2] {
        [
            Tile { level: self.level - 1, x: self.x * 2 },
            Tile { level: self.level - 1, x: self.x * 2 + 1 },
        ]
    }

    /// Leaves below this tile, i.e. the value every scenario computes.
    fn expected(&self) -> u64 {
        1 << self.level
    }
}

fn leaf_value(tile: &Tile) -> u64 {
    // stand-in for real per-tile work
    std::hint::black_box(tile.x.wrapping_mul(0x9e37_79b9_7f4a_7c15));
    1
}

fn build_tile(tile: &Tile, cb: &mut WorkCallback<'_, Tile, u64>) -> SchedulerResult<()> {
    let value = if tile.level == 0 {
        leaf_value(tile)
    } else {
        cb.scatter_gather(tile.children().to_vec())?.iter().sum()
    };
    cb.complete(tile, value)
}

fn build_batch(tile: &Tile, cb: &mut WorkCallback<'_, Tile, u64>) -> SchedulerResult<()> {
    if tile.level > 0 {
        return build_tile(tile, cb);
    }
    let neighbours = (1..4).map(|dx| Tile { level: 0, x: tile.x + dx }).collect();
    cb.acquire(neighbours, AcquisitionStrategy::TryStealExisting)?;

    let owned: Vec<Tile> = cb.owned().copied().collect();
    for leaf in &owned {
        cb.complete(leaf, leaf_value(leaf))?;
    }
    Ok(())
}

fn top_tiles(level: u8, count: u64) -> Vec<Tile> {
    (0..count).map(|x| Tile { level, x }).collect()
}

fn check(tiles: &[Tile], values: &[u64]) -> anyhow::Result<()> {
    ensure!(tiles.len() == values.len(), "got {} results for {} tiles", values.len(), tiles.len());
    for (tile, value) in tiles.iter().zip(values) {
        ensure!(*value == tile.expected(), "{tile:?} computed {value}, expected {}", tile.expected());
    }
    Ok(())
}

// ── Scenarios ───────────────────────────────────────────────────────

fn run_shared(scheduler: &impl Scheduler<Tile, u64>, tiles: Vec<Tile>) -> anyhow::Result<()> {
    let values = scheduler.scatter_gather(tiles.clone())?;
    check(&tiles, &values)
}

fn run(cli: &Cli, builder: WorkerGroupBuilder) -> anyhow::Result<SchedulerMetrics> {
    match cli.scenario {
        Scenario::Flat => {
            let scheduler = SharedFutureScheduler::new(work_fn::from_fn(build_tile), builder)?;
            run_shared(&scheduler, top_tiles(0, cli.count))?;
            scheduler.close()?;
            Ok(scheduler.metrics())
        }
        Scenario::Recursive => {
            let scheduler = SharedFutureScheduler::new(work_fn::from_fn(build_tile), builder)?;
            run_shared(&scheduler, top_tiles(cli.levels, cli.count))?;
            scheduler.close()?;
            Ok(scheduler.metrics())
        }
        Scenario::Prioritized => {
            let scheduler = ApproximatelyPrioritizedSharedFutureScheduler::new(
                work_fn::from_fn(build_tile),
                builder,
                |a: &Tile, b: &Tile| a.level.cmp(&b.level),
            )?;
            run_shared(&scheduler, top_tiles(cli.levels, cli.count))?;
            scheduler.close()?;
            Ok(scheduler.metrics())
        }
        Scenario::Batched => {
            let scheduler = SharedFutureScheduler::new(work_fn::from_fn(build_batch), builder)?;
            run_shared(&scheduler, top_tiles(cli.levels, cli.count))?;
            scheduler.close()?;
            Ok(scheduler.metrics())
        }
        Scenario::NoFuture => {
            let runs = Arc::new(AtomicU64::new(0));
            let scheduler = {
                let runs = Arc::clone(&runs);
                NoFutureScheduler::new(
                    move |tile: &Tile| {
                        leaf_value(tile);
                        runs.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    },
                    builder,
                )?
            };
            for tile in top_tiles(0, cli.count) {
                scheduler.schedule(tile);
                scheduler.schedule(tile);
            }

            let deadline = Instant::now() + Duration::from_secs(60);
            while scheduler.metrics().queue_len > 0 || runs.load(Ordering::Relaxed) < cli.count {
                ensure!(Instant::now() < deadline, "no-future runs did not drain");
                std::thread::sleep(Duration::from_millis(5));
            }
            scheduler.close()?;
            Ok(scheduler.metrics())
        }
    }
}

// ── main ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => SchedulerConfig::from_file(path).with_context(|| format!("loading {path}"))?,
        None => {
            load_dotenv();
            SchedulerConfig::from_env()
        }
    };
    config.validate().context("invalid scheduler config")?;
    config.log_summary();

    let sink = CollectingErrorSink::new();
    let mut builder = WorkerGroupBuilder::from_config(&config).error_sink(sink.clone());
    if let Some(threads) = cli.threads {
        builder = builder.threads(threads);
    }

    info!(scenario = ?cli.scenario, count = cli.count, "tessera-bench starting");
    let started = Instant::now();
    let metrics = run(&cli, builder)?;
    let elapsed = started.elapsed();

    if !sink.is_empty() {
        warn!(errors = sink.len(), first = ?sink.errors().first(), "work functions reported errors");
    }
    info!(
        scenario = ?cli.scenario,
        elapsed_ms = elapsed.as_millis() as u64,
        executions = metrics.executions,
        "tessera-bench finished"
    );
    info!(metrics = %serde_json::to_string(&metrics)?, "scheduler metrics");
    Ok(())
}
