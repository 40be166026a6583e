#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `taxi-stats`: creates range-sharded tasks for a month's shard, runs
//! them as a one-shot job or a long-running queue consumer, and prints
//! the resulting aggregate.
//!
//! # Environment Variables
//!
//! | Variable | Required | Description |
//! |---|---|---|
//! | `TASKS_DATABASE_URL` | No | `SQLite` file backing the task queue and result store (default `taxi_stats.db`) |
//! | `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` | For object-store `--src` | S3-compatible credentials |
//! | `AWS_ENDPOINT_URL` | For non-AWS object stores | S3-compatible endpoint override |
//! | `AWS_REGION` | For object-store `--src` | S3 region |

mod progress;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{ArgAction, Parser, Subcommand};
use taxi_stats_geo::{GeoError, GeoIndex};
use taxi_stats_mapper::map_line;
use taxi_stats_models::{Borough, Color, DEFAULT_TIMEOUT_SECONDS, RECORD_LENGTH, StatCounter, Task, UnknownColor, cut};
use taxi_stats_queue::{QueueError, SqlTaskQueue, TaskQueue};
use taxi_stats_reader::{LocalFileStore, ObjectStore, ReaderError, RecordReader, S3ObjectStore};
use taxi_stats_store::{ResultStore, SqlResultStore, StoreError};
use taxi_stats_worker::WorkerError;
use taxi_stats_worker::progress::ProgressCallback;
use thiserror::Error;

/// Published record range per color. A stand-in for the ingest
/// collaborator's `[MIN_DATE, MAX_DATE]` window (§6), which is out of
/// scope here; NYC TLC's actual publication history for each color.
const YELLOW_RANGE: ((i32, u32), (i32, u32)) = ((2009, 1), (2016, 12));
const GREEN_RANGE: ((i32, u32), (i32, u32)) = ((2013, 8), (2016, 12));

#[derive(Debug, Error)]
enum CoordinatorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Color(#[from] UnknownColor),
    #[error(transparent)]
    Geo(#[from] GeoError),
    #[error(transparent)]
    Reader(#[from] ReaderError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Parser)]
#[command(name = "taxi-stats", about = "Monthly taxi trip aggregate map-reduce pipeline")]
struct Cli {
    /// Shard source: `-` (stdin), `file://<dir>`, or `<scheme>://<bucket>`
    #[arg(long, default_value = "-")]
    src: String,

    /// Shard color
    #[arg(short = 'c', long)]
    color: String,

    /// Shard year
    #[arg(short = 'y', long)]
    year: i32,

    /// Shard month (1-12)
    #[arg(short = 'm', long)]
    month: u32,

    /// Record-index subrange start (default: 0)
    #[arg(short = 's', long)]
    start: Option<u64>,

    /// Record-index subrange end (default: full shard)
    #[arg(short = 'e', long)]
    end: Option<u64>,

    /// Intra-worker parallelism
    #[arg(short = 'p', long, default_value_t = 4)]
    procs: u64,

    /// Run as a long-running queue consumer instead of a one-shot job
    #[arg(short = 'w', long)]
    worker: bool,

    /// Idle poll interval in worker mode, in seconds
    #[arg(long, default_value_t = 10)]
    sleep: u64,

    /// Pretty-print the aggregate after completion
    #[arg(short = 'r', long)]
    report: bool,

    /// Increase log verbosity (repeatable: -v info, -vv debug); ignored if `RUST_LOG` is set
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,

    /// Print what would be done without mutating the queue or store
    #[arg(long)]
    dryrun: bool,

    /// Path to the community-district `GeoJSON` boundary file
    #[arg(long)]
    districts: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Shard a month's records into `n_tasks` range-sharded work units and enqueue them
    CreateTasks {
        /// Number of tasks to create
        #[arg(short = 'n', long, default_value_t = 4)]
        n_tasks: u64,
    },
}

/// Resolved shard backend. Stdin bypasses [`ObjectStore`] entirely
/// (§4.1 of the reader crate), so the coordinator keeps a separate
/// code path for it rather than forcing it through the trait.
enum ShardBackend {
    Stdin,
    Object(Arc<dyn ObjectStore>),
}

impl ShardBackend {
    async fn resolve(src: &str) -> Result<Self, CoordinatorError> {
        if src == "-" {
            return Ok(Self::Stdin);
        }
        if let Some(dir) = src.strip_prefix("file://") {
            return Ok(Self::Object(Arc::new(LocalFileStore::new(PathBuf::from(dir)))));
        }
        if let Some((_, bucket)) = src.split_once("://") {
            let store = S3ObjectStore::from_env(bucket).await;
            store.check_bucket().await?;
            return Ok(Self::Object(Arc::new(store)));
        }
        Err(CoordinatorError::InvalidArgument(format!("unrecognized shard source URI: {src}")))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Sets `RUST_LOG` from the `-v` count when the user hasn't already
/// set it, then installs the logger. `-v` = info, `-vv` or more =
/// debug, unset = warn (§10.6, mirroring `common.py`'s `VAction`).
fn init_logging(verbose: u8) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = match verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        };
        // SAFETY: single-threaded at this point, before any other env reads.
        unsafe {
            std::env::set_var("RUST_LOG", level);
        }
    }
    pretty_env_logger::init();
}

async fn run(cli: &Cli) -> Result<(), CoordinatorError> {
    let color: Color = cli.color.parse()?;
    validate_date_range(color, cli.year, cli.month)?;

    let geo = Arc::new(GeoIndex::load(&std::fs::read_to_string(&cli.districts)?)?);
    let backend = ShardBackend::resolve(&cli.src).await?;

    let db_path = PathBuf::from(std::env::var("TASKS_DATABASE_URL").unwrap_or_else(|_| "taxi_stats.db".to_string()));

    if let Some(Command::CreateTasks { n_tasks }) = &cli.command {
        let queue = SqlTaskQueue::open(&db_path).await?;
        return create_tasks(&backend, &queue, color, cli.year, cli.month, *n_tasks, DEFAULT_TIMEOUT_SECONDS, cli.dryrun)
            .await;
    }

    if cli.worker {
        let queue = Arc::new(SqlTaskQueue::open(&db_path).await?);
        let store = Arc::new(SqlResultStore::open(&db_path).await?);
        return run_worker_loop(cli, backend, geo, queue, store).await;
    }

    let (stat, elapsed) = run_one_shot(cli, color, &backend, &geo).await?;
    if cli.report {
        print_report(&stat, elapsed, cli.procs);
    }
    Ok(())
}

fn validate_date_range(color: Color, year: i32, month: u32) -> Result<(), CoordinatorError> {
    if !(1..=12).contains(&month) {
        return Err(CoordinatorError::InvalidArgument(format!("month {month} is out of range 1..=12")));
    }
    let (min, max) = match color {
        Color::Yellow => YELLOW_RANGE,
        Color::Green => GREEN_RANGE,
    };
    let ym = (year, month);
    if ym < min || ym > max {
        return Err(CoordinatorError::InvalidArgument(format!(
            "{color} {year}-{month:02} is outside the published range {}-{:02}..{}-{:02}",
            min.0, min.1, max.0, max.1
        )));
    }
    Ok(())
}

async fn shard_record_count(store: &dyn ObjectStore, key: &str) -> Result<u64, CoordinatorError> {
    let size = store.size(key).await?;
    if size % RECORD_LENGTH != 0 {
        return Err(CoordinatorError::InvalidArgument(format!(
            "shard {key} size {size} is not a multiple of record length {RECORD_LENGTH}"
        )));
    }
    Ok(size / RECORD_LENGTH)
}

/// Cuts a month's shard into `n_tasks` range-sharded tasks and enqueues
/// them. Fails fast against the shard's existence/alignment before
/// writing a single task, mirroring `tasks.py::create_tasks`'s
/// `head_bucket` check (§10.6).
async fn create_tasks(
    backend: &ShardBackend,
    queue: &dyn TaskQueue,
    color: Color,
    year: i32,
    month: u32,
    n_tasks: u64,
    timeout_seconds: u64,
    dryrun: bool,
) -> Result<(), CoordinatorError> {
    let ShardBackend::Object(store) = backend else {
        return Err(CoordinatorError::InvalidArgument(
            "create-tasks requires an object-store or local-file --src, not stdin".to_string(),
        ));
    };

    let key = Task::new(color, year, month, 0, 0, timeout_seconds).shard_key();
    let total_records = shard_record_count(store.as_ref(), &key).await?;

    if total_records == 0 {
        log::warn!("{key} has zero records; no tasks created");
        return Ok(());
    }
    if n_tasks > total_records {
        return Err(CoordinatorError::InvalidArgument(format!(
            "n_tasks ({n_tasks}) must not exceed total_records ({total_records})"
        )));
    }

    for (start, end) in cut(0, total_records - 1, n_tasks) {
        let task = Task::new(color, year, month, start, end, timeout_seconds);
        if dryrun {
            println!("would enqueue {task}");
        } else {
            queue.enqueue(&task).await?;
            log::info!("created {task}");
        }
    }
    Ok(())
}

async fn process_task(
    task: &Task,
    backend: &ShardBackend,
    geo: &Arc<GeoIndex>,
    procs: u64,
    progress: Arc<dyn ProgressCallback>,
) -> Result<StatCounter, CoordinatorError> {
    match backend {
        ShardBackend::Stdin => {
            let reader = RecordReader::from_stdin(task.start, task.end)?;
            let mut counter = StatCounter::for_key(task.color, task.year, task.month);
            for line in reader {
                map_line(&line, geo, &mut counter);
            }
            counter.recompute_borough_rollups();
            Ok(counter)
        }
        ShardBackend::Object(store) => {
            let stat = taxi_stats_worker::run(task, Arc::clone(store), Arc::clone(geo), procs, progress).await?;
            Ok(stat)
        }
    }
}

async fn run_one_shot(
    cli: &Cli,
    color: Color,
    backend: &ShardBackend,
    geo: &Arc<GeoIndex>,
) -> Result<(StatCounter, Duration), CoordinatorError> {
    let start = cli.start.unwrap_or(0);
    let end = match cli.end {
        Some(end) => end,
        None => match backend {
            ShardBackend::Stdin => {
                return Err(CoordinatorError::InvalidArgument(
                    "stdin source requires an explicit --end".to_string(),
                ));
            }
            ShardBackend::Object(store) => {
                let key = Task::new(color, cli.year, cli.month, 0, 0, 0).shard_key();
                shard_record_count(store.as_ref(), &key).await?
            }
        },
    };

    let task = Task::new(color, cli.year, cli.month, start, end, DEFAULT_TIMEOUT_SECONDS);
    let progress: Arc<dyn ProgressCallback> = Arc::new(progress::IndicatifProgress::new());

    let began = Instant::now();
    let stat = process_task(&task, backend, geo, cli.procs, progress).await?;
    Ok((stat, began.elapsed()))
}

/// Long-running queue consumer (`-w`). Per §5's cancellation rule, an
/// interrupt received while a task is in flight discards the partial
/// counter and does not ack — the task's lease simply expires and the
/// next puller redelivers it.
async fn run_worker_loop(
    cli: &Cli,
    backend: ShardBackend,
    geo: Arc<GeoIndex>,
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn ResultStore>,
) -> Result<(), CoordinatorError> {
    log::info!("worker loop starting; idle poll interval {}s", cli.sleep);
    loop {
        let Some(task) = queue.pull(true).await? else {
            log::debug!("queue empty; sleeping {}s", cli.sleep);
            tokio::time::sleep(Duration::from_secs(cli.sleep)).await;
            continue;
        };
        log::info!("pulled {task}");

        let progress: Arc<dyn ProgressCallback> = Arc::new(progress::IndicatifProgress::new());
        tokio::select! {
            result = process_task(&task, &backend, &geo, cli.procs, progress) => {
                match result {
                    Ok(stat) => match store.merge(&stat, &task.encode()).await {
                        Ok(()) => match queue.ack(&task).await {
                            Ok(()) => log::info!("acked {task}"),
                            Err(e) => log::error!("failed to ack {task}: {e}; leaving for lease expiry"),
                        },
                        Err(e) => log::error!("failed to commit {task}: {e}; leaving for lease expiry"),
                    },
                    Err(e) => {
                        log::error!("task {task} failed: {e}; leaving for lease expiry");
                    }
                }
            }
            () = ctrl_c() => {
                log::warn!("interrupted; discarding in-flight task {task}, not acking");
                return Ok(());
            }
        }
    }
}

async fn ctrl_c() {
    let _ = tokio::signal::ctrl_c().await;
}

fn print_report(stat: &StatCounter, elapsed: Duration, workers: u64) {
    let color = stat.color.map(|c| c.to_string()).unwrap_or_default();
    println!("== {color} {}-{:02} ==", stat.year.unwrap_or_default(), stat.month.unwrap_or_default());
    println!("total: {}  invalid: {}", stat.total, stat.invalid);
    println!();

    println!("borough pickups:");
    for (&code, &count) in &stat.borough_pickups {
        println!("  {:<15} {count}", borough_name(code));
    }
    println!("borough dropoffs:");
    for (&code, &count) in &stat.borough_dropoffs {
        println!("  {:<15} {count}", borough_name(code));
    }

    println!("pickup hour histogram:");
    for (&hour, &count) in &stat.hour {
        println!("  {hour:02}:00  {count}");
    }

    println!("trip distance buckets (mi):");
    for (&bucket, &count) in &stat.distance {
        println!("  >= {bucket:<4} {count}");
    }

    println!("trip time buckets (s):");
    for (&bucket, &count) in &stat.trip_time {
        println!("  >= {bucket:<4} {count}");
    }

    println!("fare buckets ($):");
    for (&bucket, &count) in &stat.fare {
        println!("  >= {bucket:<4} {count}");
    }

    println!();
    println!("elapsed: {:.1}s  workers: {workers}", elapsed.as_secs_f64());
}

fn borough_name(code: u8) -> &'static str {
    Borough::from_district_index(u32::from(code) * 10000).map_or("unknown", Borough::name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_month_out_of_range() {
        let err = validate_date_range(Color::Yellow, 2016, 13).unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_date_before_color_was_published() {
        let err = validate_date_range(Color::Green, 2012, 1).unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidArgument(_)));
    }

    #[test]
    fn accepts_date_within_published_range() {
        assert!(validate_date_range(Color::Yellow, 2016, 1).is_ok());
        assert!(validate_date_range(Color::Green, 2016, 1).is_ok());
    }

    #[test]
    fn borough_name_falls_back_to_unknown_for_unmapped_code() {
        assert_eq!(borough_name(1), "Manhattan");
        assert_eq!(borough_name(9), "unknown");
    }
}
