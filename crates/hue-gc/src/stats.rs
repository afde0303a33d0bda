//! Collector statistics
//!
//! Counters are atomics updated by the driver thread at the end of each
//! cycle; pauses go into a log2 histogram so percentile queries cost no
//! allocation and no lock.

use crate::heap::HeapOccupancy;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const BUCKETS: usize = 64;

/// Histogram of pause times with power-of-two nanosecond buckets
#[derive(Debug)]
pub struct PauseHistogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl Default for PauseHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseHistogram {
    /// Empty histogram
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            max_ns: AtomicU64::new(0),
        }
    }

    /// Record one pause
    pub fn record(&self, pause: Duration) {
        let ns = u64::try_from(pause.as_nanos()).unwrap_or(u64::MAX);
        let bucket = (u64::BITS - ns.leading_zeros()).saturating_sub(1) as usize;
        self.buckets[bucket.min(BUCKETS - 1)].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    /// Pauses recorded
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Longest pause
    pub fn max(&self) -> Duration {
        Duration::from_nanos(self.max_ns.load(Ordering::Relaxed))
    }

    /// Mean pause
    pub fn mean(&self) -> Duration {
        match self.count() {
            0 => Duration::ZERO,
            count => Duration::from_nanos(self.total_ns.load(Ordering::Relaxed) / count),
        }
    }

    /// Upper bound of the pause time below which `quantile` of the pauses
    /// fall (`quantile` in `[0, 1]`); accurate to a factor of two
    pub fn percentile(&self, quantile: f64) -> Duration {
        let count = self.count();
        if count == 0 {
            return Duration::ZERO;
        }
        let rank = ((quantile.clamp(0.0, 1.0) * count as f64).ceil() as u64).max(1);
        let mut seen = 0;
        for (index, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= rank {
                let upper = if index >= 63 { u64::MAX } else { (2u64 << index) - 1 };
                return Duration::from_nanos(upper.min(self.max_ns.load(Ordering::Relaxed)));
            }
        }
        self.max()
    }
}

/// Load barrier counters, bumped by every thread that heals a slot
#[derive(Debug, Default)]
pub struct BarrierStats {
    fast_path: CachePadded<AtomicU64>,
    slow_path: CachePadded<AtomicU64>,
    healed: CachePadded<AtomicU64>,
    relocated: CachePadded<AtomicU64>,
    null: CachePadded<AtomicU64>,
}

impl BarrierStats {
    #[inline]
    pub(crate) fn record_fast_path(&self) {
        self.fast_path.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_slow_path(&self) {
        self.slow_path.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_heal(&self) {
        self.healed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_relocation(&self) {
        self.relocated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_null(&self) {
        self.null.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values
    pub fn counts(&self) -> BarrierCounts {
        BarrierCounts {
            fast_path: self.fast_path.load(Ordering::Relaxed),
            slow_path: self.slow_path.load(Ordering::Relaxed),
            healed: self.healed.load(Ordering::Relaxed),
            relocated: self.relocated.load(Ordering::Relaxed),
            null: self.null.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`BarrierStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarrierCounts {
    /// Pointers that already carried the good color
    pub fast_path: u64,
    /// Pointers that had to be resolved and recolored
    pub slow_path: u64,
    /// Slow-path pointers rewritten to a new address
    pub healed: u64,
    /// Objects the barrier evacuated itself
    pub relocated: u64,
    /// Null slots
    pub null: u64,
}

impl BarrierCounts {
    /// Barrier invocations that saw a non-null pointer
    pub fn total(&self) -> u64 {
        self.fast_path + self.slow_path
    }

    /// Share of non-null loads that took the fast path, in `[0, 1]`
    pub fn fast_path_ratio(&self) -> f64 {
        match self.total() {
            0 => 1.0,
            total => self.fast_path as f64 / total as f64,
        }
    }
}

/// Duration of each phase of one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseTimes {
    /// Root snapshot pause
    pub mark_start: Duration,
    /// Concurrent tracing
    pub concurrent_mark: Duration,
    /// Remark pause
    pub mark_end: Duration,
    /// Relocation set selection
    pub select: Duration,
    /// Relocation start pause
    pub relocate_start: Duration,
    /// Concurrent evacuation
    pub concurrent_relocate: Duration,
    /// Region retirement
    pub cleanup: Duration,
}

impl PhaseTimes {
    /// Sum of the stop-the-world pauses
    pub fn pause_total(&self) -> Duration {
        self.mark_start + self.mark_end + self.relocate_start
    }

    /// Sum of every phase
    pub fn total(&self) -> Duration {
        self.pause_total()
            + self.concurrent_mark
            + self.select
            + self.concurrent_relocate
            + self.cleanup
    }
}

/// What one finished cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleRecord {
    /// Whether only the young generation was evacuated
    pub minor: bool,
    /// Phase durations
    pub phases: PhaseTimes,
    /// Objects copied
    pub objects_relocated: usize,
    /// Bytes copied
    pub bytes_relocated: usize,
    /// Bytes copied from young into old regions
    pub bytes_promoted: usize,
    /// Bytes of the regions handed back to the heap
    pub bytes_reclaimed: usize,
    /// Regions handed back to the heap
    pub regions_retired: usize,
}

/// Cumulative collector statistics
#[derive(Debug, Default)]
pub struct GcStats {
    cycles: AtomicU64,
    minor_cycles: AtomicU64,
    major_cycles: AtomicU64,
    pauses: PauseHistogram,
    total_gc_ns: AtomicU64,
    bytes_relocated: AtomicU64,
    objects_relocated: AtomicU64,
    bytes_promoted: AtomicU64,
    bytes_reclaimed: AtomicU64,
    regions_retired: AtomicU64,
    weak_refs_cleared: AtomicU64,
    barriers: BarrierStats,
    last_cycle: Mutex<Option<CycleRecord>>,
}

impl GcStats {
    /// All counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one stop-the-world pause
    pub fn record_pause(&self, pause: Duration) {
        self.pauses.record(pause);
    }

    /// Record a finished cycle
    pub fn record_cycle(&self, record: CycleRecord) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if record.minor {
            self.minor_cycles.fetch_add(1, Ordering::Relaxed);
        } else {
            self.major_cycles.fetch_add(1, Ordering::Relaxed);
        }
        let total = u64::try_from(record.phases.total().as_nanos()).unwrap_or(u64::MAX);
        self.total_gc_ns.fetch_add(total, Ordering::Relaxed);
        self.bytes_relocated
            .fetch_add(record.bytes_relocated as u64, Ordering::Relaxed);
        self.objects_relocated
            .fetch_add(record.objects_relocated as u64, Ordering::Relaxed);
        self.bytes_promoted
            .fetch_add(record.bytes_promoted as u64, Ordering::Relaxed);
        self.bytes_reclaimed
            .fetch_add(record.bytes_reclaimed as u64, Ordering::Relaxed);
        self.regions_retired
            .fetch_add(record.regions_retired as u64, Ordering::Relaxed);
        *self.last_cycle.lock() = Some(record);
    }

    /// Record weak references cleared at the end of a marking
    pub fn record_weak_cleared(&self, cleared: usize) {
        self.weak_refs_cleared
            .fetch_add(cleared as u64, Ordering::Relaxed);
    }

    /// Load barrier counters
    pub fn barriers(&self) -> &BarrierStats {
        &self.barriers
    }

    /// Completed cycles
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Pause histogram
    pub fn pauses(&self) -> &PauseHistogram {
        &self.pauses
    }

    /// Point-in-time copy of every counter
    pub fn summary(&self, occupancy: HeapOccupancy) -> Summary {
        let last = *self.last_cycle.lock();
        Summary {
            cycles: self.cycles(),
            minor_cycles: self.minor_cycles.load(Ordering::Relaxed),
            major_cycles: self.major_cycles.load(Ordering::Relaxed),
            pause_count: self.pauses.count(),
            pause_p50: self.pauses.percentile(0.50),
            pause_p95: self.pauses.percentile(0.95),
            pause_p99: self.pauses.percentile(0.99),
            pause_max: self.pauses.max(),
            pause_mean: self.pauses.mean(),
            total_gc_time: Duration::from_nanos(self.total_gc_ns.load(Ordering::Relaxed)),
            bytes_relocated: self.bytes_relocated.load(Ordering::Relaxed),
            objects_relocated: self.objects_relocated.load(Ordering::Relaxed),
            bytes_promoted: self.bytes_promoted.load(Ordering::Relaxed),
            bytes_reclaimed: self.bytes_reclaimed.load(Ordering::Relaxed),
            regions_retired: self.regions_retired.load(Ordering::Relaxed),
            weak_refs_cleared: self.weak_refs_cleared.load(Ordering::Relaxed),
            barriers: self.barriers.counts(),
            soft_max_heap: occupancy.max_bytes,
            last_phases: last.map(|cycle| cycle.phases).unwrap_or_default(),
            last_cycle: last,
            occupancy,
        }
    }
}

/// Snapshot of [`GcStats`] plus heap occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Summary {
    /// Completed cycles
    pub cycles: u64,
    /// Cycles that evacuated only young regions
    pub minor_cycles: u64,
    /// Old and full cycles
    pub major_cycles: u64,
    /// Stop-the-world pauses recorded
    pub pause_count: u64,
    /// Median pause
    pub pause_p50: Duration,
    /// 95th percentile pause
    pub pause_p95: Duration,
    /// 99th percentile pause
    pub pause_p99: Duration,
    /// Longest pause
    pub pause_max: Duration,
    /// Mean pause
    pub pause_mean: Duration,
    /// Time spent in cycles, concurrent phases included
    pub total_gc_time: Duration,
    /// Bytes copied by relocation
    pub bytes_relocated: u64,
    /// Objects copied by relocation
    pub objects_relocated: u64,
    /// Bytes promoted from young to old
    pub bytes_promoted: u64,
    /// Bytes of regions returned to the heap
    pub bytes_reclaimed: u64,
    /// Regions returned to the heap
    pub regions_retired: u64,
    /// Weak references cleared because their referent died
    pub weak_refs_cleared: u64,
    /// Load barrier counters
    pub barriers: BarrierCounts,
    /// Soft heap limit the occupancy trigger applies to
    pub soft_max_heap: usize,
    /// Phase durations of the last cycle
    pub last_phases: PhaseTimes,
    /// The last cycle
    pub last_cycle: Option<CycleRecord>,
    /// Heap occupancy when the summary was taken
    pub occupancy: HeapOccupancy,
}
