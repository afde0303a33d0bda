//! Adaptive heap sizing
//!
//! With [`GcConfig::adaptive_sizing`] on, the occupancy trigger applies to a
//! soft limit rather than to `max_heap_size`. After every cycle the limit
//! grows when the survivors fill most of it and shrinks when they use little
//! of it, staying within `[min_heap_size, max_heap_size]`. The first cycles
//! only observe.

use crate::config::GcConfig;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const WARMUP_CYCLES: u64 = 3;
const GROWTH_THRESHOLD: f64 = 0.75;
const SHRINK_THRESHOLD: f64 = 0.4;
const GROWTH_FACTOR: f64 = 1.2;
const SHRINK_FACTOR: f64 = 0.8;

/// Direction of the last resize
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingDecision {
    /// Too few cycles observed, or sizing disabled
    Warmup,
    /// Limit unchanged
    Stable,
    /// Limit raised
    Grow,
    /// Limit lowered
    Shrink,
}

/// Soft heap limit driven by post-cycle occupancy
#[derive(Debug)]
pub struct HeapSizer {
    enabled: bool,
    min: usize,
    max: usize,
    soft_max: AtomicUsize,
    cycles: AtomicU64,
}

impl HeapSizer {
    /// Sizer starting at `initial_heap_size`
    pub fn new(config: &GcConfig) -> Self {
        let min = config.min_heap_size;
        let max = config.max_heap_size;
        Self {
            enabled: config.adaptive_sizing,
            min,
            max,
            soft_max: AtomicUsize::new(config.initial_heap_size.clamp(min, max)),
            cycles: AtomicU64::new(0),
        }
    }

    /// Current soft limit; `max_heap_size` when sizing is off
    pub fn soft_max(&self) -> usize {
        if self.enabled {
            self.soft_max.load(Ordering::Relaxed)
        } else {
            self.max
        }
    }

    /// Committed bytes above which allocation requests a cycle
    pub fn trigger_bytes(&self, config: &GcConfig) -> Option<usize> {
        if !self.enabled {
            return config.trigger_bytes();
        }
        if config.gc_trigger_ratio >= 1.0 {
            return None;
        }
        Some((self.soft_max() as f64 * config.gc_trigger_ratio) as usize)
    }

    /// Resize after a cycle that left `used_after` bytes in use
    pub(crate) fn record_cycle(&self, used_after: usize) -> SizingDecision {
        let cycles = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.enabled || cycles < WARMUP_CYCLES {
            return SizingDecision::Warmup;
        }
        let current = self.soft_max.load(Ordering::Relaxed);
        let usage = used_after as f64 / current.max(1) as f64;
        let (target, decision) = if usage > GROWTH_THRESHOLD {
            ((current as f64 * GROWTH_FACTOR) as usize, SizingDecision::Grow)
        } else if usage < SHRINK_THRESHOLD && current > self.min {
            ((current as f64 * SHRINK_FACTOR) as usize, SizingDecision::Shrink)
        } else {
            (current, SizingDecision::Stable)
        };
        let resized = target.clamp(self.min, self.max);
        if resized == current {
            return SizingDecision::Stable;
        }
        self.soft_max.store(resized, Ordering::Relaxed);
        tracing::debug!(
            target: "hue::gc",
            used_after,
            from = current,
            to = resized,
            ?decision,
            "soft heap limit resized"
        );
        decision
    }
}
