//! `indicatif`-backed [`ProgressCallback`] for the sub-worker fan-out bar.

use indicatif::{ProgressBar, ProgressStyle};
use taxi_stats_worker::progress::ProgressCallback;

/// Wraps an [`indicatif::ProgressBar`] behind the worker crate's
/// progress trait so `taxi_stats_worker` stays decoupled from how
/// progress is rendered.
pub struct IndicatifProgress {
    bar: ProgressBar,
}

impl IndicatifProgress {
    /// Creates a bar for one task's sub-worker fan-out.
    #[must_use]
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("  {msg} {wide_bar:.cyan/dim} {pos}/{len} [{elapsed_precise}]")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        Self { bar }
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCallback for IndicatifProgress {
    fn set_total(&self, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(0);
    }

    fn set_position(&self, position: u64) {
        self.bar.set_position(position);
    }

    fn inc(&self, delta: u64) {
        self.bar.inc(delta);
    }

    fn set_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    fn finish(&self) {
        self.bar.finish();
    }

    fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}
