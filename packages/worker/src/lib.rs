#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Fans a single task's record range out across `workers` parallel
//! sub-workers, each streaming and mapping its own disjoint sub-range,
//! then reduces the partial [`StatCounter`]s into one.
//!
//! Per §4.4, a task either fully succeeds or fully fails: if any
//! sub-worker hits a shard-level error (missing shard, I/O failure,
//! misaligned shard), the whole task fails and every partial counter is
//! discarded rather than merged, so the caller never acks a task whose
//! result is incomplete.

pub mod progress;

use std::sync::Arc;

use progress::ProgressCallback;
use taxi_stats_geo::GeoIndex;
use taxi_stats_mapper::map_line;
use taxi_stats_models::{StatCounter, Task};
use taxi_stats_reader::{ObjectStore, ReaderError, RecordReader};
use thiserror::Error;

/// Errors produced while running a task's sub-workers.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A sub-worker failed to read its shard range.
    #[error("sub-worker {index} failed: {source}")]
    SubWorker {
        /// Index of the failing sub-worker.
        index: u64,
        /// Underlying shard read error.
        source: ReaderError,
    },

    /// A sub-worker task panicked or was cancelled.
    #[error("sub-worker {index} did not complete: {source}")]
    Join {
        /// Index of the failing sub-worker.
        index: u64,
        /// Underlying join error.
        source: tokio::task::JoinError,
    },
}

/// Runs `task` across `workers` parallel sub-workers and returns the
/// merged, borough-rolled-up [`StatCounter`].
///
/// # Errors
///
/// Returns [`WorkerError`] if any sub-worker fails; on error, no
/// partial result is returned — the caller should leave the task's
/// lease to expire (or explicitly extend/abandon it) so it is
/// redelivered.
pub async fn run(
    task: &Task,
    store: Arc<dyn ObjectStore>,
    geo: Arc<GeoIndex>,
    workers: u64,
    progress: Arc<dyn ProgressCallback>,
) -> Result<StatCounter, WorkerError> {
    progress.set_total(workers);
    progress.set_message(&format!("mapping {task}"));

    let key = task.shard_key();
    let mut handles = Vec::with_capacity(workers as usize);

    for index in 0..workers {
        let store = Arc::clone(&store);
        let geo = Arc::clone(&geo);
        let key = key.clone();
        let start = task.start;
        let end = task.end;
        let color = task.color;
        let year = task.year;
        let month = task.month;

        handles.push(tokio::spawn(async move {
            let reader = RecordReader::open(store.as_ref(), &key, start, end, workers, index).await?;
            let mut counter = StatCounter::for_key(color, year, month);
            for line in reader {
                map_line(&line, &geo, &mut counter);
            }
            Ok::<StatCounter, ReaderError>(counter)
        }));
    }

    let mut total = StatCounter::for_key(task.color, task.year, task.month);
    for (index, handle) in handles.into_iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let index = index as u64;
        let counter = handle
            .await
            .map_err(|source| WorkerError::Join { index, source })?
            .map_err(|source| WorkerError::SubWorker { index, source })?;
        total.merge(&counter);
        progress.inc(1);
    }

    total.recompute_borough_rollups();
    progress.finish_and_clear();
    Ok(total)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use taxi_stats_models::{Color, RECORD_LENGTH};
    use taxi_stats_reader::LocalFileStore;

    use super::*;

    fn tempdir() -> PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("taxi_stats_worker_test_{}_{n}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn record(line: &str) -> String {
        format!("{line:<width$}", width = RECORD_LENGTH as usize)
    }

    fn manhattan_geo() -> GeoIndex {
        let geojson = r#"{
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": { "boro_cd": 101 },
                "geometry": {
                    "type": "MultiPolygon",
                    "coordinates": [[[[-74.05,40.68],[-73.90,40.68],[-73.90,40.88],[-74.05,40.88],[-74.05,40.68]]]]
                }
            }]
        }"#;
        GeoIndex::load(geojson).unwrap()
    }

    #[tokio::test]
    async fn splits_work_across_sub_workers_and_merges() {
        let dir = tempdir();
        let line = "28800,29250,-74.00,40.75,-74.00,40.75,1.5,7.0,";
        let bytes: Vec<u8> = (0..8).map(|_| record(line)).collect::<Vec<_>>().join("").into_bytes();
        tokio::fs::write(dir.join("yellow-2016-01.csv"), bytes).await.unwrap();

        let store: Arc<dyn ObjectStore> = Arc::new(LocalFileStore::new(&dir));
        let geo = Arc::new(manhattan_geo());
        let task = Task::new(Color::Yellow, 2016, 1, 0, 8, 3600);

        let result = run(&task, store, geo, 4, progress::null_progress()).await.unwrap();
        assert_eq!(result.total, 8);
        assert_eq!(result.invalid, 0);
        assert_eq!(result.pickups.get(&10101), Some(&8));
        assert_eq!(result.borough_pickups.get(&1), Some(&8));
    }

    #[tokio::test]
    async fn missing_shard_fails_the_whole_task_without_partial_result() {
        let dir = tempdir();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalFileStore::new(&dir));
        let geo = Arc::new(manhattan_geo());
        let task = Task::new(Color::Yellow, 2016, 1, 0, 8, 3600);

        let err = run(&task, store, geo, 2, progress::null_progress()).await.unwrap_err();
        assert!(matches!(err, WorkerError::SubWorker { .. }));
    }

    #[tokio::test]
    async fn single_worker_over_empty_range_returns_empty_counter() {
        let dir = tempdir();
        tokio::fs::write(dir.join("yellow-2016-01.csv"), Vec::<u8>::new()).await.unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalFileStore::new(&dir));
        let geo = Arc::new(manhattan_geo());
        let task = Task::new(Color::Yellow, 2016, 1, 0, 0, 3600);

        let result = run(&task, store, geo, 1, progress::null_progress()).await.unwrap();
        assert_eq!(result.total, 0);
    }
}
