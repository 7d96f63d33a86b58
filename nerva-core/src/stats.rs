use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// EWMA smoothing factor: new = old + (sample - old) * ALPHA.
const EWMA_ALPHA: f64 = 0.2;

/// Monotonic dispatch counters for one subsystem's processor.
///
/// Counters may be read concurrently with eventually-consistent semantics;
/// they are never reset.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    accepted: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,
    queue_full: AtomicU64,
    /// EWMA of handler wall time, stored as whole microseconds.
    avg_processing_micros: AtomicU64,
}

impl ProcessorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let sample = elapsed.as_micros() as f64;
        // Load-update-store race loses an occasional sample; acceptable for
        // an advisory average.
        let old = self.avg_processing_micros.load(Ordering::Relaxed) as f64;
        let next = if self.processed.load(Ordering::Relaxed) <= 1 {
            sample
        } else {
            old + (sample - old) * EWMA_ALPHA
        };
        self.avg_processing_micros
            .store(next as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_full(&self) {
        self.queue_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            avg_processing_micros: self.avg_processing_micros.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`ProcessorStats`], serializable for the kernel's
/// statistics routes.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub processed: u64,
    pub errors: u64,
    pub queue_full: u64,
    pub avg_processing_micros: u64,
}
