//! Global cooperative scheduler for the Nerva message kernel.
//!
//! One scheduler loop time-slices dispatch across every registered
//! subsystem. Each pass asks the configured [`ScheduleStrategy`] to pick a
//! subsystem, hands it a slice, and yields. Stopping is cooperative:
//! [`GlobalScheduler::stop`] ends the loop after the current slice and
//! never aborts an in-flight handler.

mod strategy;

pub use strategy::{
    strategy_for, Adaptive, LoadBased, Priority, RoundRobin, ScheduleStrategy, StrategyContext,
};

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use nerva_core::Subsystem;
use tokio_util::sync::CancellationToken;

/// The scheduler's contract with the things it drives.
///
/// [`Subsystem`] implements this by draining its queue through the
/// processor; anything else that wants scheduler time can implement it too.
pub trait Schedulable: Send + Sync {
    fn name(&self) -> &str;
    fn queue_size(&self) -> usize;
    fn priority(&self) -> i32;
    fn is_paused(&self) -> bool;

    /// Make forward progress for up to `slice` or until idle; returns the
    /// number of messages processed.
    fn process<'a>(&'a self, slice: Duration) -> Pin<Box<dyn Future<Output = usize> + Send + 'a>>;
}

impl Schedulable for Subsystem {
    fn name(&self) -> &str {
        Subsystem::name(self)
    }

    fn queue_size(&self) -> usize {
        Subsystem::queue_size(self)
    }

    fn priority(&self) -> i32 {
        Subsystem::priority(self)
    }

    fn is_paused(&self) -> bool {
        Subsystem::is_paused(self)
    }

    fn process<'a>(&'a self, slice: Duration) -> Pin<Box<dyn Future<Output = usize> + Send + 'a>> {
        Box::pin(self.process_slice(slice))
    }
}

/// Scheduler tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// Sleep between passes when there is nothing to do.
    pub tick: Duration,
    /// Wall-time budget handed to the picked subsystem per pass.
    pub slice: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            slice: Duration::from_millis(25),
        }
    }
}

/// Aggregate scheduler counters. Monotonic, eventually consistent.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    slices: AtomicU64,
    processed: AtomicU64,
    /// EWMA of busy-ratio per slice, stored as f64 bits.
    utilisation_bits: AtomicU64,
}

impl SchedulerStats {
    const ALPHA: f64 = 0.2;

    pub fn slices(&self) -> u64 {
        self.slices.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Smoothed fraction of each slice spent doing work, `0.0..=1.0`.
    pub fn utilisation(&self) -> f64 {
        f64::from_bits(self.utilisation_bits.load(Ordering::Relaxed))
    }

    fn record_slice(&self, processed: usize, busy: Duration, slice: Duration) {
        self.slices.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(processed as u64, Ordering::Relaxed);
        let ratio = if slice.is_zero() {
            0.0
        } else {
            (busy.as_secs_f64() / slice.as_secs_f64()).min(1.0)
        };
        let old = self.utilisation();
        let next = old + (ratio - old) * Self::ALPHA;
        self.utilisation_bits
            .store(next.to_bits(), Ordering::Relaxed);
    }
}

/// Cloneable handle to a running scheduler loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    cancel: CancellationToken,
}

impl SchedulerHandle {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Stop the loop after the current slice.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Owns the registered subsystems and the cooperative dispatch loop.
///
/// Scheduling is strictly single-loop: one pass at a time picks one
/// subsystem and awaits its slice. Parallelism only appears inside
/// handlers' own awaited operations.
pub struct GlobalScheduler {
    subsystems: RwLock<Vec<Arc<dyn Schedulable>>>,
    strategy: Mutex<Box<dyn ScheduleStrategy>>,
    config: SchedulerConfig,
    cancel: CancellationToken,
    stats: Arc<SchedulerStats>,
    running: AtomicBool,
}

impl GlobalScheduler {
    /// Round-robin scheduler with the given config.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_strategy(config, Box::new(RoundRobin::new()))
    }

    pub fn with_strategy(config: SchedulerConfig, strategy: Box<dyn ScheduleStrategy>) -> Self {
        Self {
            subsystems: RwLock::new(Vec::new()),
            strategy: Mutex::new(strategy),
            config,
            cancel: CancellationToken::new(),
            stats: Arc::new(SchedulerStats::default()),
            running: AtomicBool::new(false),
        }
    }

    /// Register a subsystem for scheduling. A subsystem already registered
    /// under the same name is replaced.
    pub fn register(&self, subsystem: Arc<dyn Schedulable>) {
        let mut subsystems = self.subsystems.write().expect("scheduler registry poisoned");
        subsystems.retain(|s| s.name() != subsystem.name());
        subsystems.push(subsystem);
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut subsystems = self.subsystems.write().expect("scheduler registry poisoned");
        let before = subsystems.len();
        subsystems.retain(|s| s.name() != name);
        subsystems.len() != before
    }

    pub fn subsystem_names(&self) -> Vec<String> {
        self.subsystems
            .read()
            .expect("scheduler registry poisoned")
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subsystems
            .read()
            .expect("scheduler registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        Arc::clone(&self.stats)
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::new(self.cancel.clone())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// One scheduling pass: pick a subsystem, hand it a slice, record
    /// stats. Returns how many messages the pass processed (0 when the
    /// registry is empty or everything is idle).
    pub async fn run_once(&self) -> usize {
        let subsystems: Vec<Arc<dyn Schedulable>> = self
            .subsystems
            .read()
            .expect("scheduler registry poisoned")
            .clone();
        if subsystems.is_empty() {
            return 0;
        }

        let pick = {
            let ctx = StrategyContext {
                utilisation: self.stats.utilisation(),
            };
            let mut strategy = self.strategy.lock().expect("strategy poisoned");
            strategy.select(&subsystems, &ctx)
        };
        let Some(index) = pick else {
            return 0;
        };

        let slice = self.config.slice;
        let start = tokio::time::Instant::now();
        let processed = subsystems[index].process(slice).await;
        self.stats.record_slice(processed, start.elapsed(), slice);
        processed
    }

    /// Spawn the cooperative loop. Returns a handle whose
    /// [`cancel`](SchedulerHandle::cancel) stops the loop after the
    /// current slice; in-flight handlers are never interrupted.
    pub fn start(self: &Arc<Self>) -> SchedulerHandle {
        let handle = self.handle();
        if self.running.swap(true, Ordering::SeqCst) {
            return handle;
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(
                strategy = scheduler.strategy.lock().expect("strategy poisoned").name(),
                "scheduler started"
            );
            loop {
                if scheduler.cancel.is_cancelled() {
                    break;
                }
                let processed = scheduler.run_once().await;
                if processed == 0 {
                    tokio::select! {
                        _ = scheduler.cancel.cancelled() => break,
                        _ = tokio::time::sleep(scheduler.config.tick) => {}
                    }
                } else {
                    tokio::task::yield_now().await;
                }
            }
            scheduler.running.store(false, Ordering::SeqCst);
            tracing::info!("scheduler stopped");
        });
        handle
    }

    /// Cooperative stop; see [`start`](Self::start).
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_utilisation_moves_with_samples() {
        let stats = SchedulerStats::default();
        assert_eq!(stats.utilisation(), 0.0);
        stats.record_slice(5, Duration::from_millis(25), Duration::from_millis(25));
        assert!(stats.utilisation() > 0.0);
        let high = stats.utilisation();
        stats.record_slice(0, Duration::ZERO, Duration::from_millis(25));
        assert!(stats.utilisation() < high);
    }

    #[test]
    fn handle_cancel_is_idempotent() {
        let handle = SchedulerHandle::new(CancellationToken::new());
        assert!(!handle.is_cancelled());
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn run_once_on_empty_registry_is_a_noop() {
        let scheduler = GlobalScheduler::new(SchedulerConfig::default());
        assert_eq!(scheduler.run_once().await, 0);
    }
}
