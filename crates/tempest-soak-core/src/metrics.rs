//! Global atomic counters for tempest-soak observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    crs_submitted: AtomicU64,
    crs_timed_out: AtomicU64,
    snapshots_taken: AtomicU64,
    test_events: AtomicU64,
    error_lines: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            crs_submitted: AtomicU64::new(0),
            crs_timed_out: AtomicU64::new(0),
            snapshots_taken: AtomicU64::new(0),
            test_events: AtomicU64::new(0),
            error_lines: AtomicU64::new(0),
        }
    }

    pub fn inc_crs_submitted(&self) {
        self.crs_submitted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "crs_submitted", "counter incremented");
    }

    pub fn inc_crs_timed_out(&self) {
        self.crs_timed_out.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "crs_timed_out", "counter incremented");
    }

    pub fn add_snapshots(&self, n: u64) {
        self.snapshots_taken.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_test_events(&self, n: u64) {
        self.test_events.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_error_lines(&self, n: u64) {
        self.error_lines.fetch_add(n, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            crs_submitted = self.crs_submitted(),
            crs_timed_out = self.crs_timed_out(),
            snapshots_taken = self.snapshots_taken(),
            test_events = self.test_events(),
            error_lines = self.error_lines(),
        );
    }

    pub fn crs_submitted(&self) -> u64 {
        self.crs_submitted.load(Ordering::Relaxed)
    }

    pub fn crs_timed_out(&self) -> u64 {
        self.crs_timed_out.load(Ordering::Relaxed)
    }

    pub fn snapshots_taken(&self) -> u64 {
        self.snapshots_taken.load(Ordering::Relaxed)
    }

    pub fn test_events(&self) -> u64 {
        self.test_events.load(Ordering::Relaxed)
    }

    pub fn error_lines(&self) -> u64 {
        self.error_lines.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.crs_submitted.store(0, Ordering::Relaxed);
        self.crs_timed_out.store(0, Ordering::Relaxed);
        self.snapshots_taken.store(0, Ordering::Relaxed);
        self.test_events.store(0, Ordering::Relaxed);
        self.error_lines.store(0, Ordering::Relaxed);
    }
}
