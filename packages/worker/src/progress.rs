//! Progress reporting hook for long-running tasks.
//!
//! Mirrors the callback shape used elsewhere in this workspace for
//! long-running fetch/ingest jobs, generalized so the coordinator can
//! plug in a terminal progress bar without `taxi_stats_worker` knowing
//! anything about how it's rendered.

use std::sync::Arc;

/// Receives position updates while a [`crate::run`] call is in flight.
///
/// Implementations must be cheap to call from multiple sub-worker tasks
/// concurrently.
pub trait ProgressCallback: Send + Sync {
    /// Sets the total unit count a task will report progress against.
    fn set_total(&self, total: u64);
    /// Sets the current absolute position.
    fn set_position(&self, position: u64);
    /// Advances the current position by `delta`.
    fn inc(&self, delta: u64);
    /// Sets a short status message.
    fn set_message(&self, message: &str);
    /// Marks the task complete, leaving any rendered output in place.
    fn finish(&self);
    /// Marks the task complete and clears any rendered output.
    fn finish_and_clear(&self);
}

/// A [`ProgressCallback`] that does nothing.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn set_position(&self, _position: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _message: &str) {}
    fn finish(&self) {}
    fn finish_and_clear(&self) {}
}

/// Returns a shared no-op [`ProgressCallback`].
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
