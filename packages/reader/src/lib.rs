#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shard access and fixed-width record streaming.
//!
//! A shard is a flat file of `RECORD_LENGTH`-byte records, addressed by
//! key (`{color}-{year}-{month}.csv`) under an [`ObjectStore`]. A
//! [`RecordReader`] opens a shard, clamps the caller's `[start, end)`
//! record range to the shard's actual size, re-cuts that clamped range
//! into `workers` equal sub-ranges via the same [`taxi_stats_models::cut`]
//! helper used for task partitioning, and yields the lines belonging to
//! one of those sub-ranges.

use std::io::BufRead;
use std::path::PathBuf;

use async_trait::async_trait;
use taxi_stats_models::{RECORD_LENGTH, cut_nth};
use thiserror::Error;

/// Errors that can occur while resolving or streaming a shard.
#[derive(Debug, Error)]
pub enum ReaderError {
    /// Local filesystem I/O failed.
    #[error("I/O error for {key}: {source}")]
    Io {
        /// Shard key being accessed.
        key: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// An S3 request failed.
    #[error("S3 request failed for {key}: {source}")]
    S3 {
        /// Shard key being accessed.
        key: String,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The shard does not exist in the backing store.
    #[error("shard {key} not found")]
    MissingShard {
        /// Shard key that could not be located.
        key: String,
    },

    /// The shard's byte length is not a multiple of [`RECORD_LENGTH`].
    #[error("shard {key} size {size} is not a multiple of record length {record_length}")]
    MisalignedShard {
        /// Shard key.
        key: String,
        /// Observed size in bytes.
        size: u64,
        /// Expected record length.
        record_length: u64,
    },

    /// `start` exceeds the (possibly clamped) `end` of the requested range.
    #[error("invalid range: start {start} > end {end}")]
    InvalidRange {
        /// Requested start record index.
        start: u64,
        /// Clamped end record index.
        end: u64,
    },

    /// A record's bytes did not decode as UTF-8.
    #[error("record at byte offset {offset} is not valid UTF-8")]
    InvalidEncoding {
        /// Byte offset of the offending record.
        offset: u64,
    },
}

/// Abstracts the byte-addressable backing store a shard lives in.
///
/// Mirrors the R2/S3 access pattern used elsewhere in this workspace,
/// generalized to any S3-compatible endpoint and to a local-disk
/// implementation for tests and single-node runs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns the size of `key` in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::MissingShard`] if the key does not exist,
    /// or a backend-specific I/O/S3 error otherwise.
    async fn size(&self, key: &str) -> Result<u64, ReaderError>;

    /// Reads the half-open byte range `[start, end)` of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::MissingShard`] if the key does not exist,
    /// or a backend-specific I/O/S3 error otherwise.
    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>, ReaderError>;
}

/// Reads shards from a local directory; one file per shard key.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// Creates a store rooted at `root`; shard keys resolve to `root/key`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for LocalFileStore {
    async fn size(&self, key: &str) -> Result<u64, ReaderError> {
        let path = self.root.join(key);
        let meta = tokio::fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ReaderError::MissingShard { key: key.to_string() }
            } else {
                ReaderError::Io { key: key.to_string(), source: e }
            }
        })?;
        Ok(meta.len())
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>, ReaderError> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        let path = self.root.join(key);
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ReaderError::MissingShard { key: key.to_string() }
            } else {
                ReaderError::Io { key: key.to_string(), source: e }
            }
        })?;

        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|e| ReaderError::Io { key: key.to_string(), source: e })?;

        let mut buf = vec![0_u8; (end - start) as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| ReaderError::Io { key: key.to_string(), source: e })?;
        Ok(buf)
    }
}

/// Reads shards from an S3-compatible bucket over the AWS SDK.
///
/// Works against AWS S3 itself or any compatible endpoint (R2, MinIO,
/// ...) configured through the standard AWS environment variables
/// (`AWS_ENDPOINT_URL`, `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
/// `AWS_REGION`).
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Builds a client from the ambient AWS environment/config chain.
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket: bucket.into(),
        }
    }

    /// Checks that the bucket itself is reachable, without touching any
    /// particular key. Used by the coordinator to fail fast at
    /// task-creation time rather than at the first worker pull.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::S3`] if the bucket does not exist or is
    /// not accessible with the current credentials.
    pub async fn check_bucket(&self) -> Result<(), ReaderError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| ReaderError::S3 {
                key: String::new(),
                source: Box::new(e),
            })?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn size(&self, key: &str) -> Result<u64, ReaderError> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service_err = e.as_service_error();
                if service_err.is_some_and(|e| e.is_not_found()) {
                    ReaderError::MissingShard { key: key.to_string() }
                } else {
                    ReaderError::S3 { key: key.to_string(), source: Box::new(e) }
                }
            })?;

        output
            .content_length()
            .map(|n| u64::try_from(n).unwrap_or(0))
            .ok_or_else(|| ReaderError::MissingShard { key: key.to_string() })
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>, ReaderError> {
        let range = format!("bytes={start}-{}", end.saturating_sub(1));
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(range)
            .send()
            .await
            .map_err(|e| {
                let service_err = e.as_service_error();
                if service_err.is_some_and(|e| e.is_no_such_key()) {
                    ReaderError::MissingShard { key: key.to_string() }
                } else {
                    ReaderError::S3 { key: key.to_string(), source: Box::new(e) }
                }
            })?;

        let bytes = output.body.collect().await.map_err(|e| ReaderError::S3 {
            key: key.to_string(),
            source: Box::new(e),
        })?;
        Ok(bytes.into_bytes().to_vec())
    }
}

/// A bounded stream of decoded record lines, one per fixed-width row.
#[derive(Debug)]
pub struct RecordReader {
    lines: std::vec::IntoIter<String>,
}

impl RecordReader {
    /// Opens the `worker_index`-th of `workers` equal sub-ranges of the
    /// shard `key`'s `[task_start, task_end)` record range.
    ///
    /// `task_end` is clamped to the shard's actual record count before
    /// the sub-range cut, so a task created against stale size
    /// information never reads past the end of the file.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::MisalignedShard`] if the shard's byte
    /// length is not a multiple of [`RECORD_LENGTH`], [`ReaderError::InvalidRange`]
    /// if `task_start` exceeds the clamped end, or a backend I/O/S3
    /// error while reading.
    pub async fn open(
        store: &dyn ObjectStore,
        key: &str,
        task_start: u64,
        task_end: u64,
        workers: u64,
        worker_index: u64,
    ) -> Result<Self, ReaderError> {
        let size = store.size(key).await?;
        if size % RECORD_LENGTH != 0 {
            return Err(ReaderError::MisalignedShard {
                key: key.to_string(),
                size,
                record_length: RECORD_LENGTH,
            });
        }
        let total = size / RECORD_LENGTH;
        let end = task_end.min(total);
        if task_start > end {
            return Err(ReaderError::InvalidRange { start: task_start, end });
        }
        if end == task_start {
            return Ok(Self { lines: Vec::new().into_iter() });
        }

        let (s, e) = cut_nth(task_start, end - 1, workers, worker_index);
        if s == e {
            return Ok(Self { lines: Vec::new().into_iter() });
        }

        let byte_start = s * RECORD_LENGTH;
        let byte_end = e * RECORD_LENGTH;
        let bytes = store.get_range(key, byte_start, byte_end).await?;
        Self::from_aligned_bytes(&bytes, byte_start)
    }

    /// Reads from standard input, skipping the first `start` lines and
    /// yielding at most `end - start` of the lines that follow.
    ///
    /// Stdin has no addressable length, so it bypasses [`ObjectStore`]
    /// entirely; it exists for local testing against a pre-extracted,
    /// already-delimited record stream rather than a raw fixed-width
    /// shard.
    ///
    /// # Errors
    ///
    /// Returns [`ReaderError::Io`] if reading from stdin fails.
    pub fn from_stdin(start: u64, end: u64) -> Result<Self, ReaderError> {
        if start > end {
            return Err(ReaderError::InvalidRange { start, end });
        }
        let stdin = std::io::stdin();
        let count = (end - start) as usize;
        let lines = stdin
            .lock()
            .lines()
            .skip(usize::try_from(start).unwrap_or(usize::MAX))
            .take(count)
            .collect::<Result<Vec<String>, std::io::Error>>()
            .map_err(|e| ReaderError::Io { key: "-".to_string(), source: e })?;
        Ok(Self { lines: lines.into_iter() })
    }

    fn from_aligned_bytes(bytes: &[u8], byte_start: u64) -> Result<Self, ReaderError> {
        let mut lines = Vec::with_capacity(bytes.len() / RECORD_LENGTH as usize);
        for (i, chunk) in bytes.chunks(RECORD_LENGTH as usize).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let offset = byte_start + i as u64 * RECORD_LENGTH;
            let line = std::str::from_utf8(chunk)
                .map_err(|_| ReaderError::InvalidEncoding { offset })?;
            lines.push(line.trim_end().to_string());
        }
        Ok(Self { lines: lines.into_iter() })
    }
}

impl Iterator for RecordReader {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        self.lines.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u64) -> String {
        format!("{n:0>width$}", width = RECORD_LENGTH as usize)
    }

    fn shard_bytes(n: u64) -> Vec<u8> {
        (0..n).map(record).collect::<Vec<_>>().join("").into_bytes()
    }

    #[tokio::test]
    async fn reads_one_worker_full_range() {
        let dir = tempfile();
        tokio::fs::write(dir.join("yellow-2016-01.csv"), shard_bytes(10))
            .await
            .unwrap();
        let store = LocalFileStore::new(&dir);
        let reader = RecordReader::open(&store, "yellow-2016-01.csv", 0, 10, 1, 0)
            .await
            .unwrap();
        let lines: Vec<String> = reader.collect();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[0], record(0));
        assert_eq!(lines[9], record(9));
    }

    #[tokio::test]
    async fn splits_range_across_workers_without_overlap() {
        let dir = tempfile();
        tokio::fs::write(dir.join("yellow-2016-01.csv"), shard_bytes(10))
            .await
            .unwrap();
        let store = LocalFileStore::new(&dir);

        let mut seen = Vec::new();
        for worker in 0..4 {
            let reader = RecordReader::open(&store, "yellow-2016-01.csv", 0, 10, 4, worker)
                .await
                .unwrap();
            seen.extend(reader);
        }
        seen.sort();
        let expected: Vec<String> = (0..10).map(record).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn clamps_end_to_shard_size() {
        let dir = tempfile();
        tokio::fs::write(dir.join("yellow-2016-01.csv"), shard_bytes(5))
            .await
            .unwrap();
        let store = LocalFileStore::new(&dir);
        let reader = RecordReader::open(&store, "yellow-2016-01.csv", 0, 1000, 1, 0)
            .await
            .unwrap();
        assert_eq!(reader.count(), 5);
    }

    #[tokio::test]
    async fn misaligned_shard_is_rejected() {
        let dir = tempfile();
        let mut bytes = shard_bytes(3);
        bytes.truncate(bytes.len() - 1);
        tokio::fs::write(dir.join("yellow-2016-01.csv"), bytes)
            .await
            .unwrap();
        let store = LocalFileStore::new(&dir);
        let err = RecordReader::open(&store, "yellow-2016-01.csv", 0, 3, 1, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::MisalignedShard { .. }));
    }

    #[tokio::test]
    async fn missing_shard_reports_missing_shard_error() {
        let dir = tempfile();
        let store = LocalFileStore::new(&dir);
        let err = RecordReader::open(&store, "nope.csv", 0, 1, 1, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::MissingShard { .. }));
    }

    fn tempfile() -> PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "taxi_stats_reader_test_{}_{n}",
            std::process::id(),
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
