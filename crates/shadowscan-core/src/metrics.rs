//! Atomic counters for detector observability.
//!
//! All counters use relaxed ordering. They are diagnostic, never used for
//! synchronization. Counting happens whether or not a report is printed.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-detector operation counters.
pub struct DetectorMetrics {
    /// Access checks requested.
    pub accesses_checked: AtomicU64,
    /// Checks skipped because the thread was already reporting.
    pub checks_skipped: AtomicU64,
    /// Faults detected (reported or not).
    pub faults_detected: AtomicU64,
    /// Reports handed to the sink.
    pub reports_emitted: AtomicU64,
    /// Reports dropped by the one-shot latch.
    pub suppressed_latched: AtomicU64,
    /// Reports refused because the thread was already reporting.
    pub suppressed_recursion: AtomicU64,
    /// Reports abandoned while being composed.
    pub reports_aborted: AtomicU64,
    /// Sink write failures.
    pub sink_failures: AtomicU64,
    pub allocations: AtomicU64,
    pub frees: AtomicU64,
    pub double_frees: AtomicU64,
    pub invalid_frees: AtomicU64,
}

impl DetectorMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            accesses_checked: AtomicU64::new(0),
            checks_skipped: AtomicU64::new(0),
            faults_detected: AtomicU64::new(0),
            reports_emitted: AtomicU64::new(0),
            suppressed_latched: AtomicU64::new(0),
            suppressed_recursion: AtomicU64::new(0),
            reports_aborted: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            double_frees: AtomicU64::new(0),
            invalid_frees: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            accesses_checked: Self::get(&self.accesses_checked),
            checks_skipped: Self::get(&self.checks_skipped),
            faults_detected: Self::get(&self.faults_detected),
            reports_emitted: Self::get(&self.reports_emitted),
            suppressed_latched: Self::get(&self.suppressed_latched),
            suppressed_recursion: Self::get(&self.suppressed_recursion),
            reports_aborted: Self::get(&self.reports_aborted),
            sink_failures: Self::get(&self.sink_failures),
            allocations: Self::get(&self.allocations),
            frees: Self::get(&self.frees),
            double_frees: Self::get(&self.double_frees),
            invalid_frees: Self::get(&self.invalid_frees),
        }
    }
}

impl Default for DetectorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub accesses_checked: u64,
    pub checks_skipped: u64,
    pub faults_detected: u64,
    pub reports_emitted: u64,
    pub suppressed_latched: u64,
    pub suppressed_recursion: u64,
    pub reports_aborted: u64,
    pub sink_failures: u64,
    pub allocations: u64,
    pub frees: u64,
    pub double_frees: u64,
    pub invalid_frees: u64,
}

impl MetricsSnapshot {
    /// Faults that never reached the sink.
    #[must_use]
    pub fn suppressed(&self) -> u64 {
        self.suppressed_latched + self.suppressed_recursion
    }
}
