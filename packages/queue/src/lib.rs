#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Persistent, visibility-leased work queue of range-sharded tasks.
//!
//! Backed by `SQLite` through `switchy_database`, following the same
//! open/ensure-schema/exec-params shape as the conversation store: one
//! row per task, a nullable `leased_until`/`lease_token` pair standing
//! in for the lease, and ordinary `UPDATE ... WHERE` guards doing the
//! work a message broker would otherwise do for us. An in-memory
//! implementation behind the same trait backs unit tests and
//! single-node runs that don't need durability across restarts.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use moosicbox_json_utils::database::ToValue as _;
use switchy_database::{Database, DatabaseValue};
use switchy_database_connection::init_sqlite_rusqlite;
use taxi_stats_models::{Color, Task, TaskDecodeError};
use thiserror::Error;
use tokio::sync::Mutex;

pub use taxi_stats_models::{cut, cut_nth};

/// How long [`TaskQueue::pull`] is willing to long-poll for a task
/// before returning `None` when `hold` is set.
const POLL_WINDOW: std::time::Duration = std::time::Duration::from_millis(1000);

/// Interval between retries while long-polling.
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// Errors returned by a [`TaskQueue`] implementation.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing database rejected a query or command.
    #[error("queue database error: {0}")]
    Database(String),

    /// A stored task body failed to decode.
    #[error("stored task body is corrupt: {0}")]
    Decode(#[from] TaskDecodeError),

    /// `ack`/`extend` was called on a task with no lease tokens.
    #[error("task has no lease to act on")]
    NotLeased,

    /// `ack`/`extend` was called with a lease token that no longer
    /// matches the current holder (the lease expired and was reissued,
    /// or the task was already acknowledged).
    #[error("lease mismatch: task {0} is no longer held by this caller")]
    LeaseMismatch(String),

    /// Local filesystem I/O failed while opening the database file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistent FIFO-ish queue of range-sharded work units.
///
/// `pull`'s visibility lease is the pipeline's sole retry mechanism
/// (§5): a worker that crashes before `ack` simply lets the lease
/// expire, and the next `pull` redelivers the same task.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Appends `task` to the queue, unleased.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the underlying store rejects the write.
    async fn enqueue(&self, task: &Task) -> Result<(), QueueError>;

    /// Pulls and leases one task. If `hold` is `true`, polls for up to
    /// a bounded window before giving up; if `false`, checks once.
    ///
    /// On success the returned [`Task`] has `lease_id`/`lease_handle`
    /// set; callers must pass the same task back to [`Self::ack`] or
    /// [`Self::extend`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the underlying store rejects the read.
    async fn pull(&self, hold: bool) -> Result<Option<Task>, QueueError>;

    /// Permanently deletes a leased task. Must only be called after the
    /// corresponding `ResultStore` commit has succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotLeased`] if `task` carries no lease
    /// tokens, [`QueueError::LeaseMismatch`] if the lease has since
    /// expired and been reissued to another puller.
    async fn ack(&self, task: &Task) -> Result<(), QueueError>;

    /// Extends a leased task's visibility window by `timeout_seconds`
    /// from now.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Self::ack`].
    async fn extend(&self, task: &Task, timeout_seconds: u64) -> Result<(), QueueError>;
}

/// In-process, `Mutex`-guarded queue for tests and single-node runs.
#[derive(Default)]
pub struct InMemoryTaskQueue {
    tasks: Mutex<Vec<Entry>>,
    next_id: Mutex<u64>,
}

struct Entry {
    id: u64,
    task: Task,
    leased_until: Option<i64>,
    lease_token: Option<String>,
}

impl InMemoryTaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        let mut next_id = self.next_id.lock().await;
        let id = *next_id;
        *next_id += 1;
        drop(next_id);

        self.tasks.lock().await.push(Entry {
            id,
            task: task.clone(),
            leased_until: None,
            lease_token: None,
        });
        Ok(())
    }

    async fn pull(&self, hold: bool) -> Result<Option<Task>, QueueError> {
        let deadline = std::time::Instant::now() + POLL_WINDOW;
        loop {
            let now = now_millis();
            let mut tasks = self.tasks.lock().await;
            let found = tasks.iter_mut().find(|e| {
                e.leased_until.is_none_or(|until| until < now)
            });

            if let Some(entry) = found {
                let token = uuid::Uuid::new_v4().to_string();
                entry.leased_until =
                    Some(now + i64::try_from(entry.task.timeout_seconds).unwrap_or(i64::MAX) * 1000);
                entry.lease_token = Some(token.clone());
                let mut leased = entry.task.clone();
                leased.lease_id = Some(entry.id.to_string());
                leased.lease_handle = Some(token);
                return Ok(Some(leased));
            }
            drop(tasks);

            if !hold || std::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, task: &Task) -> Result<(), QueueError> {
        let (id, token) = lease_tokens(task)?;
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|e| !(e.id == id && e.lease_token.as_deref() == Some(token.as_str())));
        if tasks.len() == before {
            return Err(QueueError::LeaseMismatch(task.encode()));
        }
        Ok(())
    }

    async fn extend(&self, task: &Task, timeout_seconds: u64) -> Result<(), QueueError> {
        let (id, token) = lease_tokens(task)?;
        let mut tasks = self.tasks.lock().await;
        let entry = tasks
            .iter_mut()
            .find(|e| e.id == id && e.lease_token.as_deref() == Some(token.as_str()))
            .ok_or_else(|| QueueError::LeaseMismatch(task.encode()))?;
        let now = now_millis();
        entry.leased_until = Some(now + i64::try_from(timeout_seconds).unwrap_or(i64::MAX) * 1000);
        Ok(())
    }
}

/// Current time in milliseconds since the Unix epoch, used for lease
/// arithmetic. Millisecond resolution (rather than `chrono`'s
/// second-resolution `timestamp()`) avoids two leases issued within
/// the same wall-clock second comparing as simultaneously expired.
fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn lease_tokens(task: &Task) -> Result<(u64, String), QueueError> {
    let id = task
        .lease_id
        .as_ref()
        .and_then(|s| s.parse().ok())
        .ok_or(QueueError::NotLeased)?;
    let token = task.lease_handle.clone().ok_or(QueueError::NotLeased)?;
    Ok((id, token))
}

/// `SQLite`-backed queue, durable across process restarts.
pub struct SqlTaskQueue {
    db: Arc<Box<dyn Database>>,
}

impl SqlTaskQueue {
    /// Opens (or creates) the queue database at `path` and ensures its
    /// schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the file cannot be created or the
    /// schema cannot be applied.
    pub async fn open(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = init_sqlite_rusqlite(Some(path))
            .map_err(|e| QueueError::Database(e.to_string()))?;
        ensure_schema(db.as_ref()).await?;
        Ok(Self { db: Arc::new(db) })
    }
}

async fn ensure_schema(db: &dyn Database) -> Result<(), QueueError> {
    db.exec_raw(
        "CREATE TABLE IF NOT EXISTS tasks (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            color           TEXT NOT NULL,
            year            INTEGER NOT NULL,
            month           INTEGER NOT NULL,
            start_record    INTEGER NOT NULL,
            end_record      INTEGER NOT NULL,
            timeout_seconds INTEGER NOT NULL,
            leased_until    INTEGER,
            lease_token     TEXT
        )",
    )
    .await
    .map_err(|e| QueueError::Database(e.to_string()))?;

    db.exec_raw("CREATE INDEX IF NOT EXISTS idx_tasks_leased_until ON tasks (leased_until)")
        .await
        .map_err(|e| QueueError::Database(e.to_string()))?;

    Ok(())
}

#[async_trait]
impl TaskQueue for SqlTaskQueue {
    async fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        self.db
            .exec_raw_params(
                "INSERT INTO tasks
                    (color, year, month, start_record, end_record, timeout_seconds)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    DatabaseValue::String(task.color.to_string()),
                    DatabaseValue::Int64(i64::from(task.year)),
                    DatabaseValue::Int64(i64::from(task.month)),
                    DatabaseValue::Int64(i64::try_from(task.start).unwrap_or(i64::MAX)),
                    DatabaseValue::Int64(i64::try_from(task.end).unwrap_or(i64::MAX)),
                    DatabaseValue::Int64(i64::try_from(task.timeout_seconds).unwrap_or(i64::MAX)),
                ],
            )
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;
        Ok(())
    }

    async fn pull(&self, hold: bool) -> Result<Option<Task>, QueueError> {
        let deadline = std::time::Instant::now() + POLL_WINDOW;
        loop {
            if let Some(task) = self.try_pull_once().await? {
                return Ok(Some(task));
            }
            if !hold || std::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, task: &Task) -> Result<(), QueueError> {
        let (id, token) = lease_tokens(task)?;
        let affected = self
            .db
            .exec_raw_params(
                "DELETE FROM tasks WHERE id = $1 AND lease_token = $2",
                &[
                    DatabaseValue::Int64(i64::try_from(id).unwrap_or(i64::MAX)),
                    DatabaseValue::String(token),
                ],
            )
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;

        if affected == 0 {
            return Err(QueueError::LeaseMismatch(task.encode()));
        }
        Ok(())
    }

    async fn extend(&self, task: &Task, timeout_seconds: u64) -> Result<(), QueueError> {
        let (id, token) = lease_tokens(task)?;
        let now = now_millis();
        let until = now + i64::try_from(timeout_seconds).unwrap_or(i64::MAX) * 1000;

        let affected = self
            .db
            .exec_raw_params(
                "UPDATE tasks SET leased_until = $1 WHERE id = $2 AND lease_token = $3",
                &[
                    DatabaseValue::Int64(until),
                    DatabaseValue::Int64(i64::try_from(id).unwrap_or(i64::MAX)),
                    DatabaseValue::String(token),
                ],
            )
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;

        if affected == 0 {
            return Err(QueueError::LeaseMismatch(task.encode()));
        }
        Ok(())
    }
}

impl SqlTaskQueue {
    async fn try_pull_once(&self) -> Result<Option<Task>, QueueError> {
        let now = now_millis();

        let rows = self
            .db
            .query_raw_params(
                "SELECT id, color, year, month, start_record, end_record, timeout_seconds
                 FROM tasks
                 WHERE leased_until IS NULL OR leased_until < $1
                 ORDER BY id
                 LIMIT 1",
                &[DatabaseValue::Int64(now)],
            )
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;

        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let id: i64 = row.to_value("id").unwrap_or_default();
        let color: String = row.to_value("color").unwrap_or_default();
        let year: i64 = row.to_value("year").unwrap_or_default();
        let month: i64 = row.to_value("month").unwrap_or_default();
        let start: i64 = row.to_value("start_record").unwrap_or_default();
        let end: i64 = row.to_value("end_record").unwrap_or_default();
        let timeout_seconds: i64 = row.to_value("timeout_seconds").unwrap_or_default();

        let token = uuid::Uuid::new_v4().to_string();
        let until = now + timeout_seconds * 1000;

        let affected = self
            .db
            .exec_raw_params(
                "UPDATE tasks SET leased_until = $1, lease_token = $2
                 WHERE id = $3 AND (leased_until IS NULL OR leased_until < $4)",
                &[
                    DatabaseValue::Int64(until),
                    DatabaseValue::String(token.clone()),
                    DatabaseValue::Int64(id),
                    DatabaseValue::Int64(now),
                ],
            )
            .await
            .map_err(|e| QueueError::Database(e.to_string()))?;

        if affected == 0 {
            // Lost the race to another puller; caller's poll loop retries.
            return Ok(None);
        }

        let color: Color = color.parse().map_err(TaskDecodeError::from)?;
        #[allow(clippy::cast_possible_truncation)]
        let mut task = Task::new(
            color,
            i32::try_from(year).unwrap_or_default(),
            u32::try_from(month).unwrap_or_default(),
            u64::try_from(start).unwrap_or_default(),
            u64::try_from(end).unwrap_or_default(),
            u64::try_from(timeout_seconds).unwrap_or_default(),
        );
        task.lease_id = Some(id.to_string());
        task.lease_handle = Some(token);
        Ok(Some(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxi_stats_models::Color;

    #[tokio::test]
    async fn enqueue_then_pull_leases_the_task() {
        let queue = InMemoryTaskQueue::new();
        let task = Task::new(Color::Yellow, 2016, 1, 0, 1000, 60);
        queue.enqueue(&task).await.unwrap();

        let pulled = queue.pull(false).await.unwrap().unwrap();
        assert_eq!(pulled.color, Color::Yellow);
        assert!(pulled.lease_id.is_some());
        assert!(pulled.lease_handle.is_some());

        assert!(queue.pull(false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_removes_the_task_permanently() {
        let queue = InMemoryTaskQueue::new();
        queue
            .enqueue(&Task::new(Color::Green, 2016, 1, 0, 10, 60))
            .await
            .unwrap();
        let pulled = queue.pull(false).await.unwrap().unwrap();
        queue.ack(&pulled).await.unwrap();

        assert!(queue.pull(true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let queue = InMemoryTaskQueue::new();
        queue
            .enqueue(&Task::new(Color::Green, 2016, 1, 0, 1000, 0))
            .await
            .unwrap();
        let first = queue.pull(false).await.unwrap().unwrap();
        // timeout_seconds = 0: lease is immediately expired.
        let second = queue.pull(false).await.unwrap();
        assert!(second.is_some());
        assert_eq!(first.encode(), second.unwrap().encode());
    }

    #[tokio::test]
    async fn ack_without_lease_tokens_is_rejected() {
        let queue = InMemoryTaskQueue::new();
        let unleased = Task::new(Color::Yellow, 2016, 1, 0, 1, 60);
        assert!(matches!(queue.ack(&unleased).await, Err(QueueError::NotLeased)));
    }

    #[tokio::test]
    async fn stale_lease_token_is_rejected_on_ack() {
        let queue = InMemoryTaskQueue::new();
        queue
            .enqueue(&Task::new(Color::Yellow, 2016, 1, 0, 10, 0))
            .await
            .unwrap();
        let first = queue.pull(false).await.unwrap().unwrap();
        let _second = queue.pull(false).await.unwrap().unwrap(); // reissued after expiry
        assert!(matches!(queue.ack(&first).await, Err(QueueError::LeaseMismatch(_))));
    }
}
