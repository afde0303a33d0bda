//! Collector configuration
//!
//! [`GcConfig`] is built once, validated, and then shared read-only by every
//! component. Process-level overrides come from `HUE_GC_*` environment
//! variables:
//!
//! | Variable              | Field                  | Example   |
//! |-----------------------|------------------------|-----------|
//! | `HUE_GC_MAX_HEAP`     | `max_heap_size`        | `512M`    |
//! | `HUE_GC_MIN_HEAP`     | `min_heap_size`        | `32M`     |
//! | `HUE_GC_PAUSE_MS`     | `target_pause_time_ms` | `5`       |
//! | `HUE_GC_THREADS`      | `gc_threads`           | `4`       |
//! | `HUE_GC_VERBOSE`      | `verbose`              | `1`       |
//! | `HUE_GC_GENERATIONAL` | `generational`         | `off`     |
//! | `HUE_GC_NUMA`         | `numa_aware`           | `true`    |
//! | `HUE_GC_ADAPTIVE`     | `adaptive_sizing`      | `on`      |
//!
//! Sizes accept an optional `K`, `M` or `G` suffix.

use crate::colored::ADDRESS_SPACE;
use crate::error::{GcError, GcResult};
use crate::memory::page_size;

const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// Environment variable names
pub mod env {
    /// Maximum heap size
    pub const MAX_HEAP: &str = "HUE_GC_MAX_HEAP";
    /// Minimum heap size (shrink threshold)
    pub const MIN_HEAP: &str = "HUE_GC_MIN_HEAP";
    /// Pause-time target in milliseconds
    pub const PAUSE_MS: &str = "HUE_GC_PAUSE_MS";
    /// Worker thread count
    pub const THREADS: &str = "HUE_GC_THREADS";
    /// Cycle summaries at info level
    pub const VERBOSE: &str = "HUE_GC_VERBOSE";
    /// Generational mode
    pub const GENERATIONAL: &str = "HUE_GC_GENERATIONAL";
    /// NUMA-aware region placement
    pub const NUMA: &str = "HUE_GC_NUMA";
    /// Adaptive soft heap limit
    pub const ADAPTIVE: &str = "HUE_GC_ADAPTIVE";
}

/// GC configuration
#[derive(Debug, Clone, PartialEq)]
pub struct GcConfig {
    /// Size of the reserved address range; committed memory never exceeds it (default: 256MB)
    pub max_heap_size: usize,
    /// Retired regions are decommitted only while the heap is above this size (default: 16MB)
    pub min_heap_size: usize,
    /// Occupancy below which allocation never triggers a cycle (default: 16MB)
    pub initial_heap_size: usize,
    /// Pauses longer than this are reported (default: 10ms)
    pub target_pause_time_ms: u64,
    /// GC worker threads; `None` picks half the available parallelism
    pub gc_threads: Option<usize>,
    /// Separate young and old generations (default: true)
    pub generational: bool,
    /// Share of the heap the young generation aims for (default: 0.3)
    pub young_ratio: f64,
    /// Survived cycles before an object is promoted (default: 3)
    pub tenure_threshold: u8,
    /// Small region size; also the granule of the region table (default: 2MB)
    pub small_region_size: usize,
    /// Medium region size (default: 32MB)
    pub medium_region_size: usize,
    /// Largest object allocated in small regions (default: 256KB)
    pub small_threshold: usize,
    /// Largest object allocated in medium regions; bigger ones get their own region (default: 4MB)
    pub large_threshold: usize,
    /// Allocate small objects through thread-local buffers (default: true)
    pub tlab_enabled: bool,
    /// Initial TLAB size (default: 64KB)
    pub tlab_size: usize,
    /// Smallest TLAB handed out (default: 4KB)
    pub tlab_min_size: usize,
    /// Largest TLAB handed out (default: 1MB)
    pub tlab_max_size: usize,
    /// Grow TLABs on refill (default: true)
    pub tlab_resize: bool,
    /// Tag regions with a NUMA node (default: false)
    pub numa_aware: bool,
    /// Log cycle summaries at info level (default: false)
    pub verbose: bool,
    /// Run a young cycle after this many idle milliseconds; 0 disables (default: 0)
    pub gc_interval_ms: u64,
    /// Regions less live than this fraction are evacuated by old/full cycles (default: 0.75)
    pub relocation_threshold: f64,
    /// Committed fraction of the heap that requests a cycle; 1.0 or more disables (default: 0.75)
    pub gc_trigger_ratio: f64,
    /// Apply `gc_trigger_ratio` to a soft limit resized after every cycle
    /// instead of to `max_heap_size` (default: false)
    pub adaptive_sizing: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            max_heap_size: 256 * MB,
            min_heap_size: 16 * MB,
            initial_heap_size: 16 * MB,
            target_pause_time_ms: 10,
            gc_threads: None,
            generational: true,
            young_ratio: 0.3,
            tenure_threshold: 3,
            small_region_size: 2 * MB,
            medium_region_size: 32 * MB,
            small_threshold: 256 * KB,
            large_threshold: 4 * MB,
            tlab_enabled: true,
            tlab_size: 64 * KB,
            tlab_min_size: 4 * KB,
            tlab_max_size: MB,
            tlab_resize: true,
            numa_aware: false,
            verbose: false,
            gc_interval_ms: 0,
            relocation_threshold: 0.75,
            gc_trigger_ratio: 0.75,
            adaptive_sizing: false,
        }
    }
}

impl GcConfig {
    /// Default configuration with `HUE_GC_*` overrides applied
    pub fn from_env() -> GcResult<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `HUE_GC_*` overrides from the process environment
    pub fn with_env_overrides(self) -> GcResult<Self> {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup, e.g. a map in tests
    pub fn with_overrides_from<F>(mut self, lookup: F) -> GcResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(env::MAX_HEAP) {
            self.max_heap_size = parse_size(env::MAX_HEAP, &value)?;
        }
        if let Some(value) = lookup(env::MIN_HEAP) {
            self.min_heap_size = parse_size(env::MIN_HEAP, &value)?;
        }
        if let Some(value) = lookup(env::PAUSE_MS) {
            self.target_pause_time_ms = parse_number(env::PAUSE_MS, &value)?;
        }
        if let Some(value) = lookup(env::THREADS) {
            let threads: usize = parse_number(env::THREADS, &value)?;
            self.gc_threads = (threads > 0).then_some(threads);
        }
        if let Some(value) = lookup(env::VERBOSE) {
            self.verbose = parse_env_truthy(&value);
        }
        if let Some(value) = lookup(env::GENERATIONAL) {
            self.generational = parse_env_truthy(&value);
        }
        if let Some(value) = lookup(env::NUMA) {
            self.numa_aware = parse_env_truthy(&value);
        }
        if let Some(value) = lookup(env::ADAPTIVE) {
            self.adaptive_sizing = parse_env_truthy(&value);
        }
        // Keep the derived bounds consistent when only the maximum shrinks.
        self.min_heap_size = self.min_heap_size.min(self.max_heap_size);
        self.initial_heap_size = self.initial_heap_size.min(self.max_heap_size);
        Ok(self)
    }

    /// Check that the configuration is internally consistent
    pub fn validate(&self) -> GcResult<()> {
        let page = page_size();
        let fail = |message: String| Err(GcError::Configuration(message));

        if !self.small_region_size.is_power_of_two() || self.small_region_size < page {
            return fail(format!(
                "small_region_size {} must be a power of two of at least one page ({page})",
                self.small_region_size
            ));
        }
        if self.medium_region_size % self.small_region_size != 0
            || self.medium_region_size < self.small_region_size
        {
            return fail(format!(
                "medium_region_size {} must be a multiple of small_region_size {}",
                self.medium_region_size, self.small_region_size
            ));
        }
        if self.max_heap_size % self.small_region_size != 0
            || self.max_heap_size < 2 * self.small_region_size
        {
            return fail(format!(
                "max_heap_size {} must be a multiple of small_region_size and hold two regions",
                self.max_heap_size
            ));
        }
        if self.max_heap_size > ADDRESS_SPACE / 4 {
            return fail(format!(
                "max_heap_size {} exceeds the colored address space",
                self.max_heap_size
            ));
        }
        if self.min_heap_size > self.max_heap_size {
            return fail(format!(
                "min_heap_size {} exceeds max_heap_size {}",
                self.min_heap_size, self.max_heap_size
            ));
        }
        if self.initial_heap_size > self.max_heap_size {
            return fail(format!(
                "initial_heap_size {} exceeds max_heap_size {}",
                self.initial_heap_size, self.max_heap_size
            ));
        }
        if self.small_threshold == 0 || self.small_threshold > self.small_region_size / 4 {
            return fail(format!(
                "small_threshold {} must be non-zero and at most a quarter of a small region",
                self.small_threshold
            ));
        }
        if self.large_threshold < self.small_threshold
            || self.large_threshold > self.medium_region_size / 4
        {
            return fail(format!(
                "large_threshold {} must lie between small_threshold and a quarter of a medium region",
                self.large_threshold
            ));
        }
        if self.tlab_enabled
            && !(self.tlab_min_size <= self.tlab_size
                && self.tlab_size <= self.tlab_max_size
                && self.tlab_max_size <= self.small_region_size
                && self.tlab_min_size >= 64)
        {
            return fail(format!(
                "TLAB sizes must satisfy 64 <= min ({}) <= size ({}) <= max ({}) <= small region",
                self.tlab_min_size, self.tlab_size, self.tlab_max_size
            ));
        }
        if !(self.young_ratio > 0.0 && self.young_ratio < 1.0) {
            return fail(format!("young_ratio {} must be in (0, 1)", self.young_ratio));
        }
        if !(self.relocation_threshold > 0.0 && self.relocation_threshold <= 1.0) {
            return fail(format!(
                "relocation_threshold {} must be in (0, 1]",
                self.relocation_threshold
            ));
        }
        if self.gc_trigger_ratio <= 0.0 {
            return fail(format!(
                "gc_trigger_ratio {} must be positive",
                self.gc_trigger_ratio
            ));
        }
        if self.tenure_threshold == 0 {
            return fail("tenure_threshold must be at least 1".to_string());
        }
        if self.gc_threads == Some(0) {
            return fail("gc_threads must be at least 1".to_string());
        }
        Ok(())
    }

    /// Worker threads to use for marking and relocation
    pub fn worker_threads(&self) -> usize {
        self.gc_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| (n.get() / 2).max(1))
                .unwrap_or(1)
        })
    }

    /// Committed bytes above which allocation requests a cycle
    pub fn trigger_bytes(&self) -> Option<usize> {
        if self.gc_trigger_ratio >= 1.0 {
            return None;
        }
        let ratio = (self.max_heap_size as f64 * self.gc_trigger_ratio) as usize;
        Some(ratio.max(self.initial_heap_size))
    }

    /// Young generation target in bytes
    pub fn young_target(&self) -> usize {
        (self.max_heap_size as f64 * self.young_ratio) as usize
    }
}

fn parse_env_truthy(value: &str) -> bool {
    let value = value.trim();
    !matches!(value, "" | "0")
        && !value.eq_ignore_ascii_case("false")
        && !value.eq_ignore_ascii_case("off")
        && !value.eq_ignore_ascii_case("no")
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> GcResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| GcError::Configuration(format!("{name}: cannot parse `{value}`")))
}

/// Parse `4096`, `64K`, `512M` or `2G`
pub fn parse_size(name: &str, value: &str) -> GcResult<usize> {
    let value = value.trim();
    let (digits, unit) = match value.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&value[..idx], c.to_ascii_uppercase()),
        _ => (value, 'B'),
    };
    let multiplier = match unit {
        'B' => 1,
        'K' => KB,
        'M' => MB,
        'G' => 1024 * MB,
        _ => {
            return Err(GcError::Configuration(format!(
                "{name}: unknown size suffix in `{value}`"
            )));
        }
    };
    let base: usize = parse_number(name, digits)?;
    base.checked_mul(multiplier)
        .ok_or_else(|| GcError::Configuration(format!("{name}: `{value}` overflows")))
}
