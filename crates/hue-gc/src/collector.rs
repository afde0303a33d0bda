//! Collector and cycle driver
//!
//! A [`Collector`] owns the heap and a driver thread that runs cycles on
//! request. One cycle is:
//!
//! 1. mark start (safepoint): advance the epoch, seal every region, snapshot
//!    roots;
//! 2. concurrent marking;
//! 3. mark end (safepoint): rescan roots, drain the SATB queue, find
//!    unreachable finalizable objects;
//! 4. relocation set selection, empty regions retired;
//! 5. relocate start (safepoint): install the forwarding table, heal roots;
//! 6. concurrent evacuation;
//! 7. cleanup: evacuated regions retired.
//!
//! Pauses only cover steps 1, 3 and 5; their length depends on the number of
//! roots, not on the size of the heap.

use crate::allocator::SharedAllocator;
use crate::barrier;
use crate::colored::{ColoredPointer, FINALIZABLE};
use crate::config::GcConfig;
use crate::error::{GcError, GcResult};
use crate::finalization::FinalizerRegistry;
use crate::forwarding::ForwardingTable;
use crate::heap::{Heap, HeapOccupancy};
use crate::marker::{Marker, MarkerState, TraceOutcome};
use crate::mutator::Mutator;
use crate::object::{Address, HEADER_SIZE, LayoutId, LayoutRegistry, OBJECT_ALIGNMENT, PointerMap};
use crate::region::RegionState;
use crate::relocator::{
    EvacuationOutcome, RelocationObserver, RelocationSet, Relocator, RelocatorState,
};
use crate::roots::{RootHandle, RootProvider, RootSet, RootType};
use crate::safepoint::Safepoints;
use crate::sizing::HeapSizer;
use crate::state::{CollectorState, GcPhase};
use crate::stats::{CycleRecord, GcStats, PhaseTimes, Summary};
use crate::weak::{WeakRef, WeakRegistry};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

thread_local! {
    static COLLECTOR_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Flag the calling thread as the driver or one of its workers
pub(crate) fn enter_collector_thread() {
    COLLECTOR_THREAD.with(|flag| flag.set(true));
}

fn on_collector_thread() -> bool {
    COLLECTOR_THREAD.with(Cell::get)
}

/// What a cycle evacuates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GcGeneration {
    /// Young regions only
    Young,
    /// Sparse regions of either generation
    Old,
    /// Young regions and sparse old regions
    Full,
}

impl GcGeneration {
    /// The wider of two requests
    pub fn merge(self, other: Self) -> Self {
        self.max(other)
    }
}

/// Why a cycle was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcReason {
    /// [`Collector::collect`], [`Mutator::collect`] or [`Collector::request_gc`]
    Explicit,
    /// An allocation found the heap exhausted
    AllocationFailure,
    /// Committed memory passed the trigger ratio
    HeapOccupancy,
    /// The periodic timer fired
    Periodic,
}

/// Point-in-time view of the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcState {
    /// Cycle phase
    pub phase: GcPhase,
    /// Epoch of the latest marking
    pub epoch: u64,
    /// Marker state
    pub marker: MarkerState,
    /// Relocator state
    pub relocator: RelocatorState,
    /// Cycles completed, failed ones included
    pub cycles: u64,
    /// Request waiting for the driver
    pub pending: Option<(GcGeneration, GcReason)>,
    /// Whether the collector has been shut down
    pub shutdown: bool,
}

/// Driver bookkeeping, guarded by `Shared::control`
#[derive(Debug, Default)]
pub(crate) struct DriverControl {
    pending: Option<(GcGeneration, GcReason)>,
    started: u64,
    completed: u64,
    shutdown: bool,
    last_failure: Option<(u64, GcError)>,
}

/// Everything mutators, the driver and worker threads share
pub(crate) struct Shared {
    pub(crate) config: GcConfig,
    pub(crate) heap: Heap,
    pub(crate) allocator: SharedAllocator,
    pub(crate) state: CollectorState,
    pub(crate) layouts: LayoutRegistry,
    pub(crate) roots: RootSet,
    pub(crate) marker: Marker,
    pub(crate) relocator: Relocator,
    pub(crate) safepoints: Safepoints,
    pub(crate) stats: GcStats,
    pub(crate) sizer: HeapSizer,
    pub(crate) finalizers: FinalizerRegistry,
    pub(crate) weak_refs: WeakRegistry,
    pub(crate) control: Mutex<DriverControl>,
    wakeup: Condvar,
    finished: Condvar,
    interrupted: AtomicBool,
}

impl Shared {
    pub(crate) fn new(config: GcConfig) -> GcResult<Self> {
        config.validate()?;
        let heap = Heap::reserve(&config)?;
        Ok(Self {
            allocator: SharedAllocator::new(),
            state: CollectorState::new(),
            layouts: LayoutRegistry::new(),
            roots: RootSet::new(),
            marker: Marker::new(),
            relocator: Relocator::new(&config),
            safepoints: Safepoints::new(),
            stats: GcStats::new(),
            sizer: HeapSizer::new(&config),
            finalizers: FinalizerRegistry::new(),
            weak_refs: WeakRegistry::new(),
            control: Mutex::new(DriverControl::default()),
            wakeup: Condvar::new(),
            finished: Condvar::new(),
            interrupted: AtomicBool::new(false),
            heap,
            config,
        })
    }

    /// Whether concurrent phases should stop at the next opportunity
    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Check that `address` can be the start of a live object
    pub(crate) fn validate_object(&self, address: Address) -> GcResult<()> {
        let raw = address.as_usize();
        let invalid = GcError::InvalidPointer { address: raw };
        if raw % OBJECT_ALIGNMENT != 0 {
            return Err(invalid);
        }
        let Some(region) = self.heap.region_for(raw) else {
            return Err(invalid);
        };
        let top = region.start() + region.used_bytes();
        if region.state() == RegionState::Retired
            || raw < region.start() + HEADER_SIZE
            || raw >= top
        {
            return Err(invalid);
        }
        Ok(())
    }

    pub(crate) fn request_gc(&self, generation: GcGeneration, reason: GcReason) -> GcResult<()> {
        let mut control = self.control.lock();
        if control.shutdown {
            return Err(GcError::Shutdown);
        }
        control.pending = Some(match control.pending {
            Some((pending, first)) => (pending.merge(generation), first),
            None => (generation, reason),
        });
        self.wakeup.notify_one();
        Ok(())
    }

    /// Request a cycle and block until one started after this call finishes.
    ///
    /// Must not be called from a thread with an attached mutator: the cycle
    /// would wait for that thread to reach a safepoint.
    pub(crate) fn collect(&self, generation: GcGeneration, reason: GcReason) -> GcResult<()> {
        let mut control = self.control.lock();
        if control.shutdown {
            return Err(GcError::Shutdown);
        }
        let target = control.started + 1;
        control.pending = Some(match control.pending {
            Some((pending, first)) => (pending.merge(generation), first),
            None => (generation, reason),
        });
        self.wakeup.notify_one();

        while control.completed < target {
            if control.shutdown {
                return Err(GcError::Shutdown);
            }
            self.finished.wait(&mut control);
        }
        match &control.last_failure {
            Some((cycle, err)) if *cycle >= target => Err(err.clone()),
            _ => Ok(()),
        }
    }

    pub(crate) fn snapshot(&self) -> GcState {
        let control = self.control.lock();
        let state = self.state.snapshot();
        GcState {
            phase: state.phase,
            epoch: state.epoch,
            marker: self.marker.state(),
            relocator: self.relocator.state(),
            cycles: control.completed,
            pending: control.pending,
            shutdown: control.shutdown,
        }
    }

    fn begin_shutdown(&self) -> bool {
        let mut control = self.control.lock();
        let first = !control.shutdown;
        control.shutdown = true;
        drop(control);
        self.interrupted.store(true, Ordering::Release);
        self.safepoints.cancel();
        self.wakeup.notify_all();
        self.finished.notify_all();
        first
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("state", &self.state.snapshot())
            .field("heap", &self.heap.occupancy())
            .field("marker", &self.marker)
            .field("relocator", &self.relocator)
            .finish_non_exhaustive()
    }
}

/// Concurrent region-based garbage collector
///
/// Dropping the collector shuts it down; the heap itself is released once
/// the last [`Mutator`] is gone.
pub struct Collector {
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    /// Reserve the heap and start the driver thread
    pub fn new(config: GcConfig) -> GcResult<Self> {
        let shared = Arc::new(Shared::new(config)?);
        let driver = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("hue-gc-driver".to_string())
                .spawn(move || {
                    enter_collector_thread();
                    driver_loop(&shared)
                })
                .map_err(|err| {
                    GcError::HeapInitialization(format!("failed to spawn GC driver: {err}"))
                })?
        };
        tracing::debug!(
            target: "hue::gc",
            max_heap_size = shared.config.max_heap_size,
            generational = shared.config.generational,
            workers = shared.config.worker_threads(),
            "collector started"
        );
        Ok(Self {
            shared,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Collector configured from the `HUE_GC_*` environment variables
    pub fn from_env() -> GcResult<Self> {
        Self::new(GcConfig::from_env()?)
    }

    /// Attach the calling thread as a mutator
    pub fn mutator(&self) -> Mutator {
        Mutator::new(self.shared.clone())
    }

    /// Configuration in use
    pub fn config(&self) -> &GcConfig {
        &self.shared.config
    }

    /// Register an object layout
    pub fn register_layout(&self, map: Arc<dyn PointerMap>) -> GcResult<LayoutId> {
        self.shared.layouts.register(map)
    }

    /// Register a root holding `value`
    pub fn register_root(&self, value: Option<Address>, kind: RootType) -> GcResult<RootHandle> {
        if let Some(address) = value {
            self.shared.validate_object(address)?;
        }
        let raw = barrier::color_for_store(value, self.shared.state.snapshot()).raw();
        self.shared.roots.register(raw, kind)
    }

    /// Drop a root
    pub fn unregister_root(&self, handle: RootHandle) -> GcResult<()> {
        self.shared.roots.unregister(handle)
    }

    /// Current value of a root
    pub fn root(&self, handle: RootHandle) -> GcResult<Option<Address>> {
        self.shared
            .roots
            .with_slot(handle, |slot| self.load_slot(slot))
    }

    /// Overwrite a root
    pub fn set_root(&self, handle: RootHandle, value: Option<Address>) -> GcResult<()> {
        if let Some(address) = value {
            self.shared.validate_object(address)?;
        }
        self.shared
            .roots
            .with_slot(handle, |slot| barrier::store(&self.shared, slot, value))
    }

    /// Add an embedder-owned source of root slots
    pub fn add_root_provider(&self, provider: Arc<dyn RootProvider>) -> GcResult<()> {
        self.shared.roots.add_provider(provider)
    }

    /// Remove a provider added with [`add_root_provider`](Self::add_root_provider);
    /// returns whether it was registered
    pub fn remove_root_provider(&self, provider: &Arc<dyn RootProvider>) -> bool {
        self.shared.roots.remove_provider(provider)
    }

    /// Read a root slot owned by a [`RootProvider`]
    pub fn load_slot(&self, slot: &std::sync::atomic::AtomicUsize) -> GcResult<Option<Address>> {
        let ptr = barrier::heal(&self.shared, slot)?;
        Ok((!ptr.is_null()).then(|| ptr.address()))
    }

    /// Write a root slot owned by a [`RootProvider`]
    pub fn store_slot(
        &self,
        slot: &std::sync::atomic::AtomicUsize,
        value: Option<Address>,
    ) -> GcResult<()> {
        if let Some(address) = value {
            self.shared.validate_object(address)?;
        }
        barrier::store(&self.shared, slot, value)
    }

    /// Run `finalizer` once `object` has become unreachable. The finalizer
    /// does not keep the object alive and cannot reach it.
    pub fn register_finalizer(
        &self,
        object: Address,
        finalizer: impl FnOnce() + Send + 'static,
    ) -> GcResult<()> {
        self.shared.validate_object(object)?;
        let good = self.shared.state.snapshot().good_color();
        let raw = ColoredPointer::encode(object, good | FINALIZABLE).raw();
        self.shared.finalizers.register(raw, Box::new(finalizer));
        Ok(())
    }

    /// Weak reference to `object`: it does not keep the object alive and
    /// is cleared once the object is found unreachable. Read it with
    /// [`Mutator::load_weak`].
    pub fn create_weak(&self, object: Address) -> GcResult<WeakRef> {
        self.shared.validate_object(object)?;
        let raw = barrier::color_for_store(Some(object), self.shared.state.snapshot()).raw();
        Ok(self.shared.weak_refs.create(raw))
    }

    /// Whether the referent of `weak` has been collected
    pub fn is_weak_cleared(&self, weak: WeakRef) -> GcResult<bool> {
        self.shared.weak_refs.is_cleared(weak)
    }

    /// Forget a weak reference
    pub fn drop_weak(&self, weak: WeakRef) -> GcResult<()> {
        self.shared.weak_refs.remove(weak)
    }

    /// Observe every object copy
    pub fn set_relocation_observer(&self, observer: Option<Arc<dyn RelocationObserver>>) {
        self.shared.relocator.set_observer(observer);
    }

    /// Ask the driver for a cycle without waiting for it
    pub fn request_gc(&self, generation: GcGeneration, reason: GcReason) -> GcResult<()> {
        self.shared.request_gc(generation, reason)
    }

    /// Run a cycle and wait for it to finish.
    ///
    /// Must not be called from a thread with an attached [`Mutator`]; use
    /// [`Mutator::collect`] there.
    pub fn collect(&self, generation: GcGeneration) -> GcResult<()> {
        self.shared.collect(generation, GcReason::Explicit)
    }

    /// Current phase, epoch and component states
    pub fn state(&self) -> GcState {
        self.shared.snapshot()
    }

    /// Statistics summary
    pub fn stats(&self) -> Summary {
        Summary {
            soft_max_heap: self.shared.sizer.soft_max(),
            ..self.shared.stats.summary(self.shared.heap.occupancy())
        }
    }

    /// Heap occupancy by generation
    pub fn heap_occupancy(&self) -> HeapOccupancy {
        self.shared.heap.occupancy()
    }

    /// Reserved address range; every object lies inside it
    pub fn heap_range(&self) -> std::ops::Range<usize> {
        let base = self.shared.heap.base();
        base..base + self.shared.heap.max_size()
    }

    /// Stop the driver. A cycle in progress is abandoned at its next
    /// checkpoint; later requests fail with [`GcError::Shutdown`].
    ///
    /// Called from a collector thread (a [`RelocationObserver`], say), this
    /// only signals the driver; the driver is joined by the next call from
    /// any other thread, or on drop.
    pub fn shutdown(&self) {
        if self.shared.begin_shutdown() {
            tracing::debug!(target: "hue::gc", "collector shutting down");
        }
        if on_collector_thread() {
            return;
        }
        if let Some(handle) = self.driver.lock().take() {
            if handle.join().is_err() {
                tracing::error!(target: "hue::gc", "GC driver panicked");
            }
        }
    }

    /// Whether [`Collector::shutdown`] has been called
    pub fn is_shutdown(&self) -> bool {
        self.shared.control.lock().shutdown
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("state", &self.state())
            .finish()
    }
}

fn driver_loop(shared: &Shared) {
    let interval = (shared.config.gc_interval_ms > 0)
        .then(|| Duration::from_millis(shared.config.gc_interval_ms));

    loop {
        let (generation, reason, cycle) = {
            let mut control = shared.control.lock();
            loop {
                if control.shutdown {
                    tracing::debug!(target: "hue::gc", "GC driver stopped");
                    return;
                }
                if let Some((generation, reason)) = control.pending.take() {
                    control.started += 1;
                    break (generation, reason, control.started);
                }
                match interval {
                    Some(interval) => {
                        let timeout = shared.wakeup.wait_for(&mut control, interval);
                        if timeout.timed_out() && control.pending.is_none() {
                            control.pending = Some((GcGeneration::Young, GcReason::Periodic));
                        }
                    }
                    None => shared.wakeup.wait(&mut control),
                }
            }
        };

        let result = catch_unwind(AssertUnwindSafe(|| run_cycle(shared, generation, reason)))
            .unwrap_or_else(|payload| Err(recover_from_panic(shared, payload.as_ref())));

        let mut control = shared.control.lock();
        control.completed = cycle;
        match result {
            Ok(()) => {}
            Err(GcError::Shutdown) => {
                tracing::debug!(target: "hue::gc", cycle, "cycle abandoned");
                control.last_failure = Some((cycle, GcError::Shutdown));
            }
            Err(err) if err.is_fatal() => {
                tracing::error!(target: "hue::gc", cycle, error = %err, "cycle failed, collector stopped");
                control.last_failure = Some((cycle, err));
                drop(control);
                shared.begin_shutdown();
                return;
            }
            Err(err) => {
                tracing::warn!(target: "hue::gc", cycle, error = %err, "cycle failed");
                control.last_failure = Some((cycle, err));
            }
        }
        shared.finished.notify_all();
    }
}

/// Put the collector back into a consistent state after `run_cycle`
/// unwound. Before relocation starts the cycle is simply undone; a panic
/// after objects started moving leaves the heap untrustworthy.
fn recover_from_panic(shared: &Shared, payload: &(dyn Any + Send)) -> GcError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    let phase = shared.state.phase();
    if phase.is_relocating() {
        return GcError::corruption(format!("cycle panicked in phase {phase:?}: {message}"));
    }
    abort_marking(shared);
    GcError::LockPoisoned(format!("cycle panicked: {message}"))
}

/// Undo a cycle that stopped before relocation started
fn abort_marking(shared: &Shared) {
    if shared.state.phase() == GcPhase::Marking {
        shared.state.abort_to_idle();
    }
    shared.marker.abort();
    if shared.relocator.state() == RelocatorState::SelectionDone {
        let state = if shared.relocator.table().is_some() {
            RelocatorState::Remapping
        } else {
            RelocatorState::Idle
        };
        shared.relocator.set_state(state);
    }
}

pub(crate) fn run_cycle(
    shared: &Shared,
    generation: GcGeneration,
    reason: GcReason,
) -> GcResult<()> {
    let threads = shared.config.worker_threads();
    let mut phases = PhaseTimes::default();
    shared.relocator.reset_stats();

    let epoch = match mark(shared, threads, &mut phases) {
        Ok(epoch) => epoch,
        Err(err) => {
            abort_marking(shared);
            return Err(err);
        }
    };

    let started = Instant::now();
    let set = shared
        .relocator
        .select_relocation_set(&shared.heap, generation, epoch);
    let empty = match shared.relocator.retire_empty(&shared.heap, &set) {
        Ok(stats) => stats,
        Err(err) => {
            abort_marking(shared);
            return Err(err);
        }
    };
    phases.select = started.elapsed();

    if let Err(err) = start_relocation(shared, &set, epoch, &mut phases) {
        abort_marking(shared);
        return Err(err);
    }

    let started = Instant::now();
    let outcome = shared.relocator.evacuate(shared, &set, epoch, threads)?;
    phases.concurrent_relocate = started.elapsed();
    if outcome == EvacuationOutcome::Interrupted {
        return Err(GcError::Shutdown);
    }

    let started = Instant::now();
    shared.state.transition(GcPhase::Relocating, GcPhase::Cleanup)?;
    let cleanup = shared.relocator.finish(&shared.heap, &set, epoch)?;
    shared.state.transition(GcPhase::Cleanup, GcPhase::Idle)?;
    phases.cleanup = started.elapsed();

    let sizing = shared.sizer.record_cycle(shared.heap.occupancy().used_bytes);
    let finalized = shared.finalizers.run_pending();
    let relocated = shared.relocator.stats();
    let record = CycleRecord {
        minor: generation == GcGeneration::Young,
        phases,
        objects_relocated: relocated.objects,
        bytes_relocated: relocated.bytes,
        bytes_promoted: relocated.promoted_bytes,
        bytes_reclaimed: empty.reclaimed_bytes + cleanup.reclaimed_bytes,
        regions_retired: empty.retired + cleanup.retired,
    };
    shared.stats.record_cycle(record);

    let target_pause = Duration::from_millis(shared.config.target_pause_time_ms);
    let longest_pause = phases
        .mark_start
        .max(phases.mark_end)
        .max(phases.relocate_start);
    if longest_pause > target_pause {
        tracing::warn!(
            target: "hue::gc",
            epoch,
            pause_us = longest_pause.as_micros() as u64,
            target_us = target_pause.as_micros() as u64,
            "pause exceeded target"
        );
    }

    macro_rules! cycle_finished {
        ($level:ident) => {
            tracing::$level!(
                target: "hue::gc",
                epoch,
                ?generation,
                ?reason,
                pause_us = phases.pause_total().as_micros() as u64,
                total_us = phases.total().as_micros() as u64,
                marked_bytes = shared.marker.stats().bytes,
                relocated_bytes = record.bytes_relocated,
                promoted_bytes = record.bytes_promoted,
                reclaimed_bytes = record.bytes_reclaimed,
                regions_retired = record.regions_retired,
                regions_kept = cleanup.kept,
                ?sizing,
                finalized,
                "cycle finished"
            )
        };
    }
    if shared.config.verbose {
        cycle_finished!(info);
    } else {
        cycle_finished!(debug);
    }
    Ok(())
}

/// Mark start, concurrent marking and mark end; returns the epoch
fn mark(shared: &Shared, threads: usize, phases: &mut PhaseTimes) -> GcResult<u64> {
    let started = Instant::now();
    let request = shared.safepoints.request_safepoint();
    request.wait()?;
    let epoch = shared.state.begin_marking()?;
    let sealed = shared.heap.seal_all();
    shared.allocator.reset();
    shared.marker.reset();
    shared.marker.set_state(MarkerState::RootScanning);
    let roots = shared.marker.scan_roots(shared)?;
    shared.marker.set_state(MarkerState::Tracing);
    request.release(epoch);
    phases.mark_start = started.elapsed();
    shared.stats.record_pause(phases.mark_start);
    tracing::debug!(
        target: "hue::gc",
        epoch,
        sealed,
        roots,
        pause_us = phases.mark_start.as_micros() as u64,
        "marking started"
    );

    let started = Instant::now();
    let outcome = shared.marker.start_concurrent_marking(shared, threads)?;
    phases.concurrent_mark = started.elapsed();
    if outcome == TraceOutcome::Interrupted {
        return Err(GcError::Shutdown);
    }

    let started = Instant::now();
    let request = shared.safepoints.request_safepoint();
    request.wait()?;
    if shared.marker.remark(shared, threads)? == TraceOutcome::Interrupted {
        return Err(GcError::Shutdown);
    }
    let finalizable = shared.finalizers.collect_unreachable(shared, epoch)?;
    let weak_cleared = shared.weak_refs.clear_unreachable(shared, epoch)?;
    shared.stats.record_weak_cleared(weak_cleared);
    shared.state.finish_marking(epoch);
    // every thread has now seen this epoch, so no slot still needs the
    // previous cycle's table
    let dropped = shared
        .relocator
        .discard_table(shared.safepoints.min_published_epoch());
    shared.marker.set_state(MarkerState::Done);
    request.release(epoch);
    phases.mark_end = started.elapsed();
    shared.stats.record_pause(phases.mark_end);
    tracing::debug!(
        target: "hue::gc",
        epoch,
        finalizable,
        weak_cleared,
        previous_table_dropped = dropped,
        pause_us = phases.mark_end.as_micros() as u64,
        "marking finished"
    );
    Ok(epoch)
}

/// Relocate start safepoint
fn start_relocation(
    shared: &Shared,
    set: &RelocationSet,
    epoch: u64,
    phases: &mut PhaseTimes,
) -> GcResult<()> {
    let started = Instant::now();
    let request = shared.safepoints.request_safepoint();
    request.wait()?;
    shared.state.transition(GcPhase::Marking, GcPhase::Relocating)?;
    for region in &set.regions {
        region.transition(RegionState::Sealed, RegionState::Relocating);
    }
    shared
        .relocator
        .install_table(Arc::new(ForwardingTable::new(epoch)));
    shared.relocator.set_state(RelocatorState::Relocating);

    let mut failure = None;
    let mut healed = 0usize;
    let visited = shared.roots.for_each_slot(&mut |slot| {
        if failure.is_some() {
            return;
        }
        match barrier::heal(shared, slot) {
            Ok(_) => healed += 1,
            Err(err) if err.is_fatal() => failure = Some(err),
            // the object stays in its region, which is then kept
            Err(err) => {
                tracing::warn!(target: "hue::gc", error = %err, "root not relocated");
            }
        }
    });
    if let Some(err) = failure {
        return Err(err);
    }
    // the phase is already Relocating: unvisited roots heal on first load
    if let Err(err) = visited {
        tracing::warn!(target: "hue::gc", error = %err, "roots left to lazy healing");
    }
    if let Err(err) = shared.finalizers.heal_all(shared) {
        if err.is_fatal() {
            return Err(err);
        }
        tracing::warn!(target: "hue::gc", error = %err, "finalizable object not relocated");
    }
    if let Err(err) = shared.weak_refs.heal_all(shared) {
        if err.is_fatal() {
            return Err(err);
        }
        tracing::warn!(target: "hue::gc", error = %err, "weak referent not relocated");
    }
    request.release(epoch);

    phases.relocate_start = started.elapsed();
    shared.stats.record_pause(phases.relocate_start);
    tracing::debug!(
        target: "hue::gc",
        epoch,
        regions = set.regions.len(),
        live_bytes = set.live_bytes,
        roots = healed,
        pause_us = phases.relocate_start.as_micros() as u64,
        "relocation started"
    );
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::{allocate, config, shared};
    use super::*;
    use crate::object::FixedSlots;
    use std::sync::atomic::AtomicUsize;

    struct FlakyProvider {
        panics: AtomicBool,
        slot: AtomicUsize,
    }

    impl RootProvider for FlakyProvider {
        fn visit_roots(&self, visitor: &mut dyn FnMut(&AtomicUsize)) {
            if self.panics.load(Ordering::SeqCst) {
                panic!("root provider failed");
            }
            visitor(&self.slot);
        }
    }

    #[test]
    fn test_generation_merge_keeps_wider() {
        assert_eq!(GcGeneration::Young.merge(GcGeneration::Old), GcGeneration::Old);
        assert_eq!(GcGeneration::Full.merge(GcGeneration::Young), GcGeneration::Full);
        assert_eq!(GcGeneration::Young.merge(GcGeneration::Young), GcGeneration::Young);
    }

    #[test]
    fn test_cycle_without_mutators() {
        let shared = shared();
        let pair = shared
            .layouts
            .register(Arc::new(FixedSlots(vec![0])))
            .unwrap();
        let head = allocate(&shared, 16, pair);
        let tail = allocate(&shared, 16, LayoutId::LEAF);
        let garbage = allocate(&shared, 16, LayoutId::LEAF);
        // SAFETY: test objects with a slot at offset 0
        barrier::store(&shared, unsafe { head.slot(0) }, Some(tail)).unwrap();
        let root = shared
            .roots
            .register(ColoredPointer::encode(head, 0).raw(), RootType::Global)
            .unwrap();

        run_cycle(&shared, GcGeneration::Young, GcReason::Explicit).unwrap();

        let state = shared.state.snapshot();
        assert_eq!(state.phase, GcPhase::Idle);
        assert_eq!(state.epoch, 1);
        let moved_head = shared
            .roots
            .with_slot(root, |slot| barrier::heal(&shared, slot))
            .unwrap()
            .address();
        assert_ne!(moved_head, head);
        // SAFETY: the healed root points at the live copy
        let moved_tail = barrier::heal(&shared, unsafe { moved_head.slot(0) }).unwrap();
        assert_ne!(moved_tail.address(), tail);
        assert_ne!(moved_tail.address(), garbage);
        assert_eq!(shared.relocator.stats().objects, 2);
        assert_eq!(shared.stats.cycles(), 1);
        assert_eq!(shared.stats.pauses().count(), 3);
    }

    #[test]
    fn test_aborted_marking_keeps_stale_pointers_resolvable() {
        let shared = shared();
        let holder_layout = shared
            .layouts
            .register(Arc::new(FixedSlots(vec![0])))
            .unwrap();
        let holder = allocate(&shared, 16, holder_layout);
        let child = allocate(&shared, 16, LayoutId::LEAF);
        // SAFETY: test objects with a reference slot at 0 and a word at 8
        unsafe {
            barrier::store(&shared, holder.slot(0), Some(child)).unwrap();
            child.slot(8).store(0xfeed, Ordering::Relaxed);
        }
        let root = shared
            .roots
            .register(ColoredPointer::encode(holder, 0).raw(), RootType::Global)
            .unwrap();

        run_cycle(&shared, GcGeneration::Young, GcReason::Explicit).unwrap();
        assert_eq!(shared.state.last_marked(), 1);

        // a marking that never reaches mark end
        shared.state.begin_marking().unwrap();
        shared.marker.set_state(MarkerState::Tracing);
        abort_marking(&shared);
        assert_eq!(shared.state.snapshot().phase, GcPhase::Idle);

        // the moved holder still carries the cycle-1 pointer to the old child
        run_cycle(&shared, GcGeneration::Young, GcReason::Explicit).unwrap();
        assert_eq!(shared.state.epoch(), 4);

        let holder = shared
            .roots
            .with_slot(root, |slot| barrier::heal(&shared, slot))
            .unwrap()
            .address();
        // SAFETY: healed pointers name live copies
        let child = barrier::heal(&shared, unsafe { holder.slot(0) }).unwrap().address();
        assert!(shared.validate_object(child).is_ok());
        assert_eq!(unsafe { child.slot(8) }.load(Ordering::Relaxed), 0xfeed);
    }

    #[test]
    fn test_panicking_root_provider_fails_only_its_cycle() {
        let collector = Collector::new(config()).unwrap();
        let provider = Arc::new(FlakyProvider {
            panics: AtomicBool::new(true),
            slot: AtomicUsize::new(0),
        });
        collector.add_root_provider(provider.clone()).unwrap();

        assert!(matches!(
            collector.collect(GcGeneration::Young),
            Err(GcError::LockPoisoned(_))
        ));
        let state = collector.state();
        assert_eq!(state.phase, GcPhase::Idle);
        assert_eq!(state.marker, MarkerState::Idle);
        assert!(!state.shutdown);

        provider.panics.store(false, Ordering::SeqCst);
        collector.collect(GcGeneration::Young).unwrap();
        assert_eq!(collector.stats().cycles, 1);
        // registration still works; the root lock was never poisoned
        collector.register_root(None, RootType::Global).unwrap();
    }

    #[test]
    fn test_unwound_cycle_is_undone_before_relocation() {
        let shared = shared();
        shared.state.begin_marking().unwrap();
        shared.marker.set_state(MarkerState::Tracing);
        let err = recover_from_panic(&shared, &"mark worker failed");
        assert!(matches!(&err, GcError::LockPoisoned(message) if message.contains("mark worker failed")));
        assert!(!err.is_fatal());
        assert_eq!(shared.state.phase(), GcPhase::Idle);
        assert_eq!(shared.marker.state(), MarkerState::Idle);

        shared.state.begin_marking().unwrap();
        shared.state.transition(GcPhase::Marking, GcPhase::Relocating).unwrap();
        let err = recover_from_panic(&shared, &String::from("copy failed"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_validate_object_rejects_foreign_addresses() {
        let shared = shared();
        let object = allocate(&shared, 32, LayoutId::LEAF);
        assert!(shared.validate_object(object).is_ok());
        assert!(matches!(
            shared.validate_object(Address::new(0x10)),
            Err(GcError::InvalidPointer { .. })
        ));
        assert!(matches!(
            shared.validate_object(object.offset(4)),
            Err(GcError::InvalidPointer { .. })
        ));
    }

    #[test]
    fn test_collect_and_shutdown() {
        let collector = Collector::new(config()).unwrap();
        collector.collect(GcGeneration::Full).unwrap();
        assert_eq!(collector.state().cycles, 1);
        assert_eq!(collector.stats().major_cycles, 1);

        collector.shutdown();
        assert!(collector.is_shutdown());
        assert_eq!(collector.collect(GcGeneration::Young), Err(GcError::Shutdown));
        assert_eq!(
            collector.request_gc(GcGeneration::Young, GcReason::Explicit),
            Err(GcError::Shutdown)
        );
    }

    #[test]
    fn test_requests_coalesce() {
        let shared = shared();
        shared.request_gc(GcGeneration::Young, GcReason::HeapOccupancy).unwrap();
        shared.request_gc(GcGeneration::Full, GcReason::Explicit).unwrap();
        assert_eq!(
            shared.snapshot().pending,
            Some((GcGeneration::Full, GcReason::HeapOccupancy))
        );
    }

    #[test]
    fn test_periodic_cycles() {
        let collector = Collector::new(GcConfig {
            gc_interval_ms: 5,
            ..config()
        })
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while collector.state().cycles < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(collector.state().cycles >= 2);
        assert!(collector.stats().minor_cycles >= 2);
    }
}
