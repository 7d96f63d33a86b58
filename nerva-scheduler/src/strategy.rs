use std::sync::Arc;

use crate::Schedulable;

/// Read-only view the scheduler hands to a strategy on every pick.
#[derive(Clone, Copy, Debug)]
pub struct StrategyContext {
    /// EWMA of slice busy-time ratio across the whole scheduler, in
    /// `0.0..=1.0`.
    pub utilisation: f64,
}

/// Picks the next subsystem to receive a time slice.
///
/// Strategies are first-class and own whatever state they need (the
/// round-robin cursor lives in the strategy, not the scheduler). `select`
/// returns an index into the supplied slice, or `None` when nothing is
/// eligible.
pub trait ScheduleStrategy: Send {
    fn name(&self) -> &'static str;

    fn select(
        &mut self,
        subsystems: &[Arc<dyn Schedulable>],
        ctx: &StrategyContext,
    ) -> Option<usize>;
}

/// Cycle through registered subsystems, skipping paused ones.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScheduleStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(
        &mut self,
        subsystems: &[Arc<dyn Schedulable>],
        _ctx: &StrategyContext,
    ) -> Option<usize> {
        if subsystems.is_empty() {
            return None;
        }
        for offset in 0..subsystems.len() {
            let index = (self.cursor + offset) % subsystems.len();
            if !subsystems[index].is_paused() {
                self.cursor = index + 1;
                return Some(index);
            }
        }
        None
    }
}

/// Pick the highest-priority subsystem. Subsystems with queued work win
/// over idle ones of higher priority, so a busy low-priority queue is never
/// starved behind an idle high-priority one.
#[derive(Debug, Default)]
pub struct Priority;

impl ScheduleStrategy for Priority {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn select(
        &mut self,
        subsystems: &[Arc<dyn Schedulable>],
        _ctx: &StrategyContext,
    ) -> Option<usize> {
        let eligible = |s: &Arc<dyn Schedulable>| !s.is_paused();
        let busy = subsystems
            .iter()
            .enumerate()
            .filter(|(_, s)| eligible(s) && s.queue_size() > 0)
            .max_by_key(|(_, s)| s.priority())
            .map(|(i, _)| i);
        busy.or_else(|| {
            subsystems
                .iter()
                .enumerate()
                .filter(|(_, s)| eligible(s))
                .max_by_key(|(_, s)| s.priority())
                .map(|(i, _)| i)
        })
    }
}

/// Pick the subsystem with the largest queue.
#[derive(Debug, Default)]
pub struct LoadBased;

impl ScheduleStrategy for LoadBased {
    fn name(&self) -> &'static str {
        "load-based"
    }

    fn select(
        &mut self,
        subsystems: &[Arc<dyn Schedulable>],
        _ctx: &StrategyContext,
    ) -> Option<usize> {
        subsystems
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_paused())
            .max_by_key(|(_, s)| s.queue_size())
            .map(|(i, _)| i)
    }
}

/// Switch behaviour on observed utilisation: above 0.8 drain the deepest
/// queue, below 0.3 rotate fairly, otherwise respect priorities.
#[derive(Debug, Default)]
pub struct Adaptive {
    round_robin: RoundRobin,
    priority: Priority,
    load_based: LoadBased,
}

impl Adaptive {
    pub const HIGH_WATER: f64 = 0.8;
    pub const LOW_WATER: f64 = 0.3;

    pub fn new() -> Self {
        Self::default()
    }
}

impl ScheduleStrategy for Adaptive {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn select(
        &mut self,
        subsystems: &[Arc<dyn Schedulable>],
        ctx: &StrategyContext,
    ) -> Option<usize> {
        if ctx.utilisation > Self::HIGH_WATER {
            self.load_based.select(subsystems, ctx)
        } else if ctx.utilisation < Self::LOW_WATER {
            self.round_robin.select(subsystems, ctx)
        } else {
            self.priority.select(subsystems, ctx)
        }
    }
}

/// Resolve a strategy by its configured name.
pub fn strategy_for(name: &str) -> Option<Box<dyn ScheduleStrategy>> {
    match name {
        "round-robin" => Some(Box::new(RoundRobin::new())),
        "priority" => Some(Box::<Priority>::default()),
        "load-based" => Some(Box::<LoadBased>::default()),
        "adaptive" => Some(Box::new(Adaptive::new())),
        _ => None,
    }
}
