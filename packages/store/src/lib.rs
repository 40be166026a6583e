#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Keyed additive-merge aggregate sink.
//!
//! §9 leaves the at-least-once double-commit problem as an open
//! question and names its own remedy: "add a per-task idempotency
//! token to the row key." This crate takes that route. [`ResultStore::merge`]
//! takes a `contribution_key` identifying the unit of work a
//! [`StatCounter`] came from (in practice, the owning task's
//! [`Task::encode`] body, which is stable across redeliveries because
//! the queue never rewrites a task's addressing fields). Each
//! contribution is recorded in a dedup ledger keyed by
//! `(row key, contribution_key)` before it is folded into the
//! aggregate row; a redelivered task's second commit finds its key
//! already present and is silently skipped, making the additive merge
//! exactly-once in effect despite the queue's at-least-once delivery.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use moosicbox_json_utils::database::ToValue as _;
use switchy_database::{Database, DatabaseValue};
use switchy_database_connection::init_sqlite_rusqlite;
use taxi_stats_models::{Color, StatCounter};
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors returned by a [`ResultStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing database rejected a query or command.
    #[error("result store database error: {0}")]
    Database(String),

    /// A stored counter's JSON histogram column failed to decode.
    #[error("stored aggregate row is corrupt: {0}")]
    Json(#[from] serde_json::Error),

    /// Local filesystem I/O failed while opening the database file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Keyed additive-merge sink for per-`(color, year-month)` aggregates.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Atomically folds `stat` into the row keyed by `stat.row_key()`,
    /// unless `contribution_key` has already been applied to that row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the underlying store rejects the
    /// read-modify-write.
    async fn merge(&self, stat: &StatCounter, contribution_key: &str) -> Result<(), StoreError>;

    /// Returns the current aggregate row, or `None` if nothing has
    /// been merged into `(color, year, month)` yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the underlying store rejects the read.
    async fn get(&self, color: Color, year: i32, month: u32) -> Result<Option<StatCounter>, StoreError>;
}

/// In-process, `Mutex`-guarded store for tests and single-node runs.
#[derive(Default)]
pub struct InMemoryResultStore {
    rows: Mutex<HashMap<(Color, i32), StatCounter>>,
    seen: Mutex<HashSet<(Color, i32, String)>>,
}

impl InMemoryResultStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn merge(&self, stat: &StatCounter, contribution_key: &str) -> Result<(), StoreError> {
        let key = stat.row_key();
        let seen_key = (key.0, key.1, contribution_key.to_string());

        let mut seen = self.seen.lock().await;
        if !seen.insert(seen_key) {
            log::info!("duplicate contribution {contribution_key} for {key:?} ignored");
            return Ok(());
        }
        drop(seen);

        let mut rows = self.rows.lock().await;
        rows.entry(key)
            .or_insert_with(|| StatCounter::for_key(key.0, key.1 / 100, u32::try_from(key.1 % 100).unwrap_or(1)))
            .merge(stat);
        Ok(())
    }

    async fn get(&self, color: Color, year: i32, month: u32) -> Result<Option<StatCounter>, StoreError> {
        let key = (color, year * 100 + i32::try_from(month).unwrap_or_default());
        Ok(self.rows.lock().await.get(&key).cloned())
    }
}

/// `SQLite`-backed store, durable across process restarts.
pub struct SqlResultStore {
    db: Box<dyn Database>,
}

impl SqlResultStore {
    /// Opens (or creates) the store database at `path` and ensures its
    /// schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be created or the
    /// schema cannot be applied.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = init_sqlite_rusqlite(Some(path)).map_err(|e| StoreError::Database(e.to_string()))?;
        ensure_schema(db.as_ref()).await?;
        Ok(Self { db })
    }
}

async fn ensure_schema(db: &dyn Database) -> Result<(), StoreError> {
    db.exec_raw(
        "CREATE TABLE IF NOT EXISTS aggregates (
            color             TEXT NOT NULL,
            ym                INTEGER NOT NULL,
            total             INTEGER NOT NULL,
            invalid           INTEGER NOT NULL,
            pickups           TEXT NOT NULL,
            dropoffs          TEXT NOT NULL,
            hour              TEXT NOT NULL,
            distance          TEXT NOT NULL,
            trip_time         TEXT NOT NULL,
            fare              TEXT NOT NULL,
            borough_pickups   TEXT NOT NULL,
            borough_dropoffs  TEXT NOT NULL,
            PRIMARY KEY (color, ym)
        )",
    )
    .await
    .map_err(|e| StoreError::Database(e.to_string()))?;

    db.exec_raw(
        "CREATE TABLE IF NOT EXISTS contributions (
            color    TEXT NOT NULL,
            ym       INTEGER NOT NULL,
            task_key TEXT NOT NULL,
            PRIMARY KEY (color, ym, task_key)
        )",
    )
    .await
    .map_err(|e| StoreError::Database(e.to_string()))?;

    Ok(())
}

async fn load_row(db: &dyn Database, color: Color, ym: i32) -> Result<Option<StatCounter>, StoreError> {
    let rows = db
        .query_raw_params(
            "SELECT * FROM aggregates WHERE color = $1 AND ym = $2",
            &[DatabaseValue::String(color.to_string()), DatabaseValue::Int64(i64::from(ym))],
        )
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

    let Some(row) = rows.first() else {
        return Ok(None);
    };

    let total: i64 = row.to_value("total").unwrap_or_default();
    let invalid: i64 = row.to_value("invalid").unwrap_or_default();
    let pickups: String = row.to_value("pickups").unwrap_or_default();
    let dropoffs: String = row.to_value("dropoffs").unwrap_or_default();
    let hour: String = row.to_value("hour").unwrap_or_default();
    let distance: String = row.to_value("distance").unwrap_or_default();
    let trip_time: String = row.to_value("trip_time").unwrap_or_default();
    let fare: String = row.to_value("fare").unwrap_or_default();
    let borough_pickups: String = row.to_value("borough_pickups").unwrap_or_default();
    let borough_dropoffs: String = row.to_value("borough_dropoffs").unwrap_or_default();

    Ok(Some(StatCounter {
        color: Some(color),
        year: Some(ym / 100),
        month: Some(u32::try_from(ym % 100).unwrap_or(1)),
        total: u64::try_from(total).unwrap_or_default(),
        invalid: u64::try_from(invalid).unwrap_or_default(),
        pickups: serde_json::from_str(&pickups)?,
        dropoffs: serde_json::from_str(&dropoffs)?,
        hour: serde_json::from_str(&hour)?,
        distance: serde_json::from_str(&distance)?,
        trip_time: serde_json::from_str(&trip_time)?,
        fare: serde_json::from_str(&fare)?,
        borough_pickups: serde_json::from_str(&borough_pickups)?,
        borough_dropoffs: serde_json::from_str(&borough_dropoffs)?,
    }))
}

async fn upsert_row(db: &dyn Database, stat: &StatCounter) -> Result<(), StoreError> {
    let (color, ym) = stat.row_key();
    db.exec_raw_params(
        "INSERT INTO aggregates
            (color, ym, total, invalid, pickups, dropoffs, hour, distance, trip_time, fare,
             borough_pickups, borough_dropoffs)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
         ON CONFLICT (color, ym) DO UPDATE SET
            total = excluded.total,
            invalid = excluded.invalid,
            pickups = excluded.pickups,
            dropoffs = excluded.dropoffs,
            hour = excluded.hour,
            distance = excluded.distance,
            trip_time = excluded.trip_time,
            fare = excluded.fare,
            borough_pickups = excluded.borough_pickups,
            borough_dropoffs = excluded.borough_dropoffs",
        &[
            DatabaseValue::String(color.to_string()),
            DatabaseValue::Int64(i64::from(ym)),
            DatabaseValue::Int64(i64::try_from(stat.total).unwrap_or(i64::MAX)),
            DatabaseValue::Int64(i64::try_from(stat.invalid).unwrap_or(i64::MAX)),
            DatabaseValue::String(serde_json::to_string(&stat.pickups)?),
            DatabaseValue::String(serde_json::to_string(&stat.dropoffs)?),
            DatabaseValue::String(serde_json::to_string(&stat.hour)?),
            DatabaseValue::String(serde_json::to_string(&stat.distance)?),
            DatabaseValue::String(serde_json::to_string(&stat.trip_time)?),
            DatabaseValue::String(serde_json::to_string(&stat.fare)?),
            DatabaseValue::String(serde_json::to_string(&stat.borough_pickups)?),
            DatabaseValue::String(serde_json::to_string(&stat.borough_dropoffs)?),
        ],
    )
    .await
    .map_err(|e| StoreError::Database(e.to_string()))?;
    Ok(())
}

#[async_trait]
impl ResultStore for SqlResultStore {
    async fn merge(&self, stat: &StatCounter, contribution_key: &str) -> Result<(), StoreError> {
        let (color, ym) = stat.row_key();
        let txn = self
            .db
            .begin_transaction()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let inserted = txn
            .exec_raw_params(
                "INSERT OR IGNORE INTO contributions (color, ym, task_key) VALUES ($1, $2, $3)",
                &[
                    DatabaseValue::String(color.to_string()),
                    DatabaseValue::Int64(i64::from(ym)),
                    DatabaseValue::String(contribution_key.to_string()),
                ],
            )
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if inserted == 0 {
            txn.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
            log::info!("duplicate contribution {contribution_key} for {color}:{ym} ignored");
            return Ok(());
        }

        let mut merged = load_row(txn.as_ref(), color, ym)
            .await?
            .unwrap_or_else(|| StatCounter::for_key(color, ym / 100, u32::try_from(ym % 100).unwrap_or(1)));
        merged.merge(stat);
        upsert_row(txn.as_ref(), &merged).await?;

        txn.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, color: Color, year: i32, month: u32) -> Result<Option<StatCounter>, StoreError> {
        let ym = year * 100 + i32::try_from(month).unwrap_or_default();
        load_row(self.db.as_ref(), color, ym).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn merge_accumulates_across_calls() {
        let store = InMemoryResultStore::new();
        let mut a = StatCounter::for_key(Color::Yellow, 2016, 1);
        a.total = 3;
        a.pickups.insert(10101, 2);
        let mut b = StatCounter::for_key(Color::Yellow, 2016, 1);
        b.total = 5;
        b.pickups.insert(10101, 1);
        b.pickups.insert(30201, 4);

        store.merge(&a, "task-a").await.unwrap();
        store.merge(&b, "task-b").await.unwrap();

        let row = store.get(Color::Yellow, 2016, 1).await.unwrap().unwrap();
        assert_eq!(row.total, 8);
        assert_eq!(row.pickups.get(&10101), Some(&3));
        assert_eq!(row.pickups.get(&30201), Some(&4));
    }

    #[tokio::test]
    async fn redelivered_contribution_is_not_double_counted() {
        let store = InMemoryResultStore::new();
        let mut stat = StatCounter::for_key(Color::Green, 2016, 1);
        stat.total = 1000;

        store.merge(&stat, "green,2016,1,[0,1000):3600").await.unwrap();
        store.merge(&stat, "green,2016,1,[0,1000):3600").await.unwrap();

        let row = store.get(Color::Green, 2016, 1).await.unwrap().unwrap();
        assert_eq!(row.total, 1000, "second commit with the same contribution key must be a no-op");
    }

    #[tokio::test]
    async fn distinct_contribution_keys_both_count() {
        let store = InMemoryResultStore::new();
        let mut stat = StatCounter::for_key(Color::Green, 2016, 1);
        stat.total = 1000;

        store.merge(&stat, "green,2016,1,[0,1000):3600").await.unwrap();
        store.merge(&stat, "green,2016,1,[1000,2000):3600").await.unwrap();

        let row = store.get(Color::Green, 2016, 1).await.unwrap().unwrap();
        assert_eq!(row.total, 2000);
    }

    #[tokio::test]
    async fn unknown_row_returns_none() {
        let store = InMemoryResultStore::new();
        assert!(store.get(Color::Yellow, 1999, 1).await.unwrap().is_none());
    }
}
