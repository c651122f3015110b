//! Workload generator for the tessera client.
//!
//! Drives concurrent write sessions against an in-process cluster, then
//! verifies the result with a snapshot scan. Useful for eyeballing
//! throughput of the batching modes and for shaking out concurrency bugs
//! under load.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tessera_client::mem::MemCluster;
use tessera_client::{
    Client, ClientError, ColumnSchema, DataType, FlushMode, ReadMode, Schema, Table, Value,
};
use tracing::{info, warn};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "tessera-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FlushModeArg {
    Sync,
    Background,
    Manual,
}

impl From<FlushModeArg> for FlushMode {
    fn from(mode: FlushModeArg) -> Self {
        match mode {
            FlushModeArg::Sync => FlushMode::AutoFlushSync,
            FlushModeArg::Background => FlushMode::AutoFlushBackground,
            FlushModeArg::Manual => FlushMode::ManualFlush,
        }
    }
}

impl std::fmt::Display for FlushModeArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FlushModeArg::Sync => "sync",
            FlushModeArg::Background => "background",
            FlushModeArg::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of concurrent writer sessions.
    #[arg(long, default_value_t = 8)]
    clients: usize,

    /// Size of the hot key space.
    #[arg(long, default_value_t = 10_000)]
    keys: i64,

    /// Number of tablets the table is pre-split into.
    #[arg(long, default_value_t = 4)]
    tablets: usize,

    /// Session flush mode under test.
    #[arg(long, value_enum, default_value_t = FlushModeArg::Background)]
    flush_mode: FlushModeArg,

    /// In manual mode, flush after this many applies.
    #[arg(long, default_value_t = 64)]
    flush_every: usize,

    /// Percent of operations that are inserts (rest are updates).
    #[arg(long, default_value_t = 50)]
    insert_pct: u8,

    /// Total runtime of the write phase.
    #[arg(long, default_value = "10s")]
    duration: humantime::Duration,

    /// Per-request timeout.
    #[arg(long, default_value = "5s")]
    op_timeout: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Skip the snapshot verification pass.
    #[arg(long, default_value_t = false)]
    no_verify: bool,

    /// Write the JSON summary here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

/// Counters shared by all writer tasks.
#[derive(Default)]
struct Stats {
    attempted: AtomicU64,
    rejected: AtomicU64,
    row_errors: AtomicU64,
    ambiguous: AtomicU64,
    overflowed: AtomicU64,
}

/// Run summary, serialized as JSON.
#[derive(serde::Serialize, Debug)]
struct Summary {
    clients: usize,
    keys: i64,
    tablets: usize,
    flush_mode: String,
    seed: u64,
    elapsed_ms: u64,
    ops_attempted: u64,
    ops_rejected: u64,
    row_errors: u64,
    ambiguous_failures: u64,
    collector_overflows: u64,
    ops_per_sec: f64,
    rows_at_end: Option<u64>,
    snapshot_repeatable: Option<bool>,
}

const TABLE: &str = "load";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(run) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("build tokio runtime")?;
            runtime.block_on(run_workload(run))
        }
    }
}

async fn run_workload(args: RunArgs) -> anyhow::Result<()> {
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };

    let cluster = Arc::new(MemCluster::new(3));
    cluster
        .create_table(TABLE, load_schema(), &split_rows(args.keys, args.tablets))
        .context("create load table")?;

    let client = Client::builder()
        .locator(cluster.clone())
        .transport(cluster.clone())
        .default_timeout(*args.op_timeout)
        .build()
        .context("build client")?;
    let table = client.open_table(TABLE).await.context("open load table")?;

    info!(
        clients = args.clients,
        keys = args.keys,
        tablets = cluster.tablet_count(TABLE),
        mode = ?args.flush_mode,
        seed,
        "starting write phase"
    );

    let stats = Arc::new(Stats::default());
    let started = Instant::now();
    let deadline = started + *args.duration;

    let mut workers = Vec::with_capacity(args.clients);
    for worker in 0..args.clients {
        let client = client.clone();
        let table = table.clone();
        let stats = stats.clone();
        let args = args.clone();
        let rng = SmallRng::seed_from_u64(seed.wrapping_add(worker as u64));
        workers.push(tokio::spawn(async move {
            write_loop(client, table, stats, args, rng, deadline).await
        }));
    }
    for worker in workers {
        worker.await.context("writer task panicked")??;
    }

    let elapsed = started.elapsed();
    let attempted = stats.attempted.load(Ordering::Relaxed);

    let (rows_at_end, snapshot_repeatable) = if args.no_verify {
        (None, None)
    } else {
        let (count, repeatable) = verify(&cluster, &table).await?;
        (Some(count), Some(repeatable))
    };

    let summary = Summary {
        clients: args.clients,
        keys: args.keys,
        tablets: args.tablets,
        flush_mode: format!("{:?}", args.flush_mode),
        seed,
        elapsed_ms: elapsed.as_millis() as u64,
        ops_attempted: attempted,
        ops_rejected: stats.rejected.load(Ordering::Relaxed),
        row_errors: stats.row_errors.load(Ordering::Relaxed),
        ambiguous_failures: stats.ambiguous.load(Ordering::Relaxed),
        collector_overflows: stats.overflowed.load(Ordering::Relaxed),
        ops_per_sec: attempted as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        rows_at_end,
        snapshot_repeatable,
    };

    let rendered = serde_json::to_string_pretty(&summary).context("serialize summary")?;
    match &args.out {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            std::fs::write(path, rendered).with_context(|| format!("write {}", path.display()))?;
            info!(path = %path.display(), "summary written");
        }
        None => println!("{rendered}"),
    }

    if summary.snapshot_repeatable == Some(false) {
        anyhow::bail!("snapshot verification failed: scans at one timestamp disagreed");
    }
    Ok(())
}

async fn write_loop(
    client: Client,
    table: Table,
    stats: Arc<Stats>,
    args: RunArgs,
    mut rng: SmallRng,
    deadline: Instant,
) -> anyhow::Result<()> {
    let session = client.new_session();
    session.set_flush_mode(args.flush_mode.into())?;

    let mut since_flush = 0usize;
    while Instant::now() < deadline {
        let id = rng.gen_range(0..args.keys.max(1));
        let op = if rng.gen_range(0..100u8) < args.insert_pct {
            let mut op = table.new_insert();
            op.row_mut().set("id", Value::Int64(id))?;
            op.row_mut()
                .set("val", Value::String(format!("w{id}")))?;
            op
        } else {
            let mut op = table.new_update();
            op.row_mut().set("id", Value::Int64(id))?;
            op.row_mut()
                .set("val", Value::String(format!("u{id}")))?;
            op
        };

        stats.attempted.fetch_add(1, Ordering::Relaxed);
        match session.apply(op).await {
            Ok(()) => {}
            // Expected contention: duplicate inserts and updates of
            // missing rows.
            Err(ClientError::Row { .. }) => {}
            Err(ClientError::SomeOperationsFailed { .. }) => {}
            Err(ClientError::BufferSpaceExhausted(_)) => {
                stats.rejected.fetch_add(1, Ordering::Relaxed);
                let _ = session.flush().await;
                since_flush = 0;
            }
            Err(err) => {
                warn!(error = %err, "unexpected apply failure");
                anyhow::bail!("apply failed: {err}");
            }
        }

        since_flush += 1;
        if matches!(args.flush_mode, FlushModeArg::Manual) && since_flush >= args.flush_every {
            let _ = session.flush().await;
            since_flush = 0;
        }
        drain_stats(&session, &stats);
    }

    let _ = session.flush().await;
    drain_stats(&session, &stats);
    session.close().map_err(|err| anyhow::anyhow!("close session: {err}"))?;
    Ok(())
}

fn drain_stats(session: &tessera_client::Session, stats: &Stats) {
    if session.count_pending_errors() == 0 {
        return;
    }
    let (errors, overflowed) = session.pending_errors();
    stats
        .row_errors
        .fetch_add(errors.len() as u64, Ordering::Relaxed);
    stats.ambiguous.fetch_add(
        errors.iter().filter(|e| e.was_possibly_successful()).count() as u64,
        Ordering::Relaxed,
    );
    if overflowed {
        stats.overflowed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Scan the table twice at one snapshot: counts must agree.
async fn verify(cluster: &MemCluster, table: &Table) -> anyhow::Result<(u64, bool)> {
    let snapshot = cluster.now_micros();
    let first = count_rows(table, snapshot).await?;
    let second = count_rows(table, snapshot).await?;
    info!(rows = first, repeatable = (first == second), "verification scan done");
    Ok((first, first == second))
}

async fn count_rows(table: &Table, snapshot: u64) -> anyhow::Result<u64> {
    let mut scanner = table.new_scanner();
    scanner.set_read_mode(ReadMode::ReadAtSnapshot)?;
    scanner.set_snapshot_micros(snapshot)?;
    scanner.set_projection(&["id"])?;
    scanner.open().await?;

    let mut count = 0u64;
    let mut rows = Vec::new();
    while scanner.has_more_rows() {
        scanner.next_batch(&mut rows).await?;
        count += rows.len() as u64;
    }
    scanner.close();
    Ok(count)
}

fn load_schema() -> Schema {
    Schema::new(
        vec![
            ColumnSchema::new("id", DataType::Int64, false),
            ColumnSchema::new("val", DataType::String, true),
        ],
        1,
    )
    .expect("static schema is valid")
}

fn split_rows(keys: i64, tablets: usize) -> Vec<Vec<Value>> {
    let tablets = tablets.max(1) as i64;
    (1..tablets)
        .map(|idx| vec![Value::Int64(idx * keys.max(1) / tablets)])
        .collect()
}
