//! Concurrent relocation
//!
//! After marking, sparsely populated regions are evacuated: every live object
//! is copied into a to-space region and the move is published in the
//! cycle's [`ForwardingTable`]. Relocator threads walk the selected regions
//! while mutators keep running; a mutator that loads a pointer into a region
//! being evacuated relocates the object itself (see [`crate::barrier`]).
//!
//! Each object is copied by exactly one thread: the one that sets the claim
//! bit in its header. Everybody else waits for the forwarding entry. A copy
//! that fails for lack of memory releases its claim, and the region is kept
//! instead of retired.
//!
//! Remapping is lazy. Stale pointers are healed by barriers and by the next
//! marking, after which the table is dropped.

use crate::allocator::initialize_object;
use crate::collector::{GcGeneration, Shared, enter_collector_thread};
use crate::config::GcConfig;
use crate::error::{GcError, GcResult};
use crate::forwarding::ForwardingTable;
use crate::heap::Heap;
use crate::object::{Address, ObjectHeader};
use crate::region::{Generation, Region, RegionId, RegionState, SizeClass};
use crossbeam_utils::Backoff;
use parking_lot::{Mutex, RwLock};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Relocator state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocatorState {
    /// No forwarding table in use
    Idle = 0,
    /// A relocation set has been chosen
    SelectionDone = 1,
    /// Evacuating the relocation set
    Relocating = 2,
    /// Evacuation finished; stale pointers are healed lazily
    Remapping = 3,
}

impl From<u8> for RelocatorState {
    fn from(v: u8) -> Self {
        match v {
            1 => RelocatorState::SelectionDone,
            2 => RelocatorState::Relocating,
            3 => RelocatorState::Remapping,
            _ => RelocatorState::Idle,
        }
    }
}

/// Sees every object copy; used to verify relocation in tests and tooling
///
/// Called on relocation workers and on mutator threads whose load barrier
/// moved an object. A panic is logged and otherwise ignored; the copy has
/// already been published.
pub trait RelocationObserver: Send + Sync {
    /// `size` payload bytes were copied from `old` to `new`
    fn on_relocate(&self, old: Address, new: Address, size: usize);
}

/// Regions chosen for evacuation in one cycle
#[derive(Debug, Default)]
pub struct RelocationSet {
    /// Regions to evacuate, least live first
    pub regions: Vec<Arc<Region>>,
    /// Sealed regions without live objects
    pub empty: Vec<Arc<Region>>,
    /// Live bytes to copy
    pub live_bytes: usize,
}

impl RelocationSet {
    /// Ids of the regions to evacuate
    pub fn region_ids(&self) -> Vec<RegionId> {
        self.regions.iter().map(|r| r.id()).collect()
    }

    /// Whether nothing is evacuated
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Counters of the current cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelocationStats {
    /// Objects copied
    pub objects: usize,
    /// Payload and header bytes copied
    pub bytes: usize,
    /// Bytes copied into the old generation from young regions
    pub promoted_bytes: usize,
}

/// Result of region retirement after evacuation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Regions returned to the heap
    pub retired: usize,
    /// Bytes those regions had handed out
    pub reclaimed_bytes: usize,
    /// Regions kept because some object could not be copied
    pub kept: usize,
}

/// Outcome of the concurrent evacuation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvacuationOutcome {
    /// Every selected region was walked
    Complete,
    /// Stopped early because the collector is shutting down
    Interrupted,
}

/// Region evacuation and forwarding
pub struct Relocator {
    state: AtomicU8,
    table: RwLock<Option<Arc<ForwardingTable>>>,
    observer: RwLock<Option<Arc<dyn RelocationObserver>>>,
    threshold: f64,
    tenure_threshold: u8,
    generational: bool,
    objects: AtomicUsize,
    bytes: AtomicUsize,
    promoted_bytes: AtomicUsize,
}

impl Relocator {
    /// Relocator following `config`
    pub fn new(config: &GcConfig) -> Self {
        Self {
            state: AtomicU8::new(RelocatorState::Idle as u8),
            table: RwLock::new(None),
            observer: RwLock::new(None),
            threshold: config.relocation_threshold,
            tenure_threshold: config.tenure_threshold,
            generational: config.generational,
            objects: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            promoted_bytes: AtomicUsize::new(0),
        }
    }

    /// Current state
    pub fn state(&self) -> RelocatorState {
        RelocatorState::from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: RelocatorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Latest forwarding table, if not yet discarded
    #[inline]
    pub fn table(&self) -> Option<Arc<ForwardingTable>> {
        self.table.read().clone()
    }

    /// Make `table` the latest forwarding table. Called at a safepoint.
    pub(crate) fn install_table(&self, table: Arc<ForwardingTable>) {
        *self.table.write() = Some(table);
    }

    /// Drop the forwarding table once every attached mutator has published
    /// an epoch past it. Called at a safepoint after marking has healed every
    /// reachable slot.
    pub(crate) fn discard_table(&self, min_published_epoch: Option<u64>) -> bool {
        let mut table = self.table.write();
        let Some(current) = table.as_ref() else {
            return false;
        };
        if min_published_epoch.is_some_and(|published| published <= current.epoch()) {
            tracing::debug!(
                target: "hue::gc",
                table_epoch = current.epoch(),
                min_published_epoch,
                "forwarding table still in use"
            );
            return false;
        }
        tracing::trace!(
            target: "hue::gc",
            table_epoch = current.epoch(),
            entries = current.len(),
            "forwarding table discarded"
        );
        *table = None;
        self.set_state(RelocatorState::Idle);
        true
    }

    /// Install or remove the copy observer
    pub fn set_observer(&self, observer: Option<Arc<dyn RelocationObserver>>) {
        *self.observer.write() = observer;
    }

    /// Counters of the current cycle
    pub fn stats(&self) -> RelocationStats {
        RelocationStats {
            objects: self.objects.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            promoted_bytes: self.promoted_bytes.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset_stats(&self) {
        self.objects.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.promoted_bytes.store(0, Ordering::Relaxed);
    }

    /// Choose the regions to evacuate after the marking of `epoch`.
    ///
    /// Young collections take every sealed young region; old and full
    /// collections take regions whose live fraction is below the relocation
    /// threshold (full collections also take every young region). Candidates
    /// are ordered by live bytes and cut off once the copies would not fit
    /// in the space left. Large regions are never moved.
    pub fn select_relocation_set(
        &self,
        heap: &Heap,
        kind: GcGeneration,
        epoch: u64,
    ) -> RelocationSet {
        let mut set = RelocationSet::default();
        let mut candidates = Vec::new();

        for region in heap.regions() {
            if region.state() != RegionState::Sealed {
                continue;
            }
            let live = region.live_bytes(epoch);
            if live == 0 {
                set.empty.push(region);
                continue;
            }
            if region.size_class() == SizeClass::Large {
                continue;
            }
            let sparse = region.live_ratio(epoch) < self.threshold;
            let young = region.generation() == Generation::Young;
            let eligible = match kind {
                GcGeneration::Young => young,
                GcGeneration::Old => sparse,
                GcGeneration::Full => young || sparse,
            };
            if eligible {
                candidates.push((live, region));
            }
        }

        candidates.sort_by_key(|(live, region)| (*live, region.start()));
        let mut budget =
            heap.available() + set.empty.iter().map(|r| r.size()).sum::<usize>();
        for (live, region) in candidates {
            if live > budget {
                break;
            }
            budget -= live;
            set.live_bytes += live;
            set.regions.push(region);
        }

        self.set_state(RelocatorState::SelectionDone);
        tracing::debug!(
            target: "hue::gc",
            epoch,
            ?kind,
            regions = set.regions.len(),
            empty = set.empty.len(),
            live_bytes = set.live_bytes,
            "relocation set selected"
        );
        set
    }

    /// Hand regions without live objects back to the heap
    pub(crate) fn retire_empty(&self, heap: &Heap, set: &RelocationSet) -> GcResult<CleanupStats> {
        let mut stats = CleanupStats::default();
        for region in &set.empty {
            stats.reclaimed_bytes += region.used_bytes();
            heap.retire_region(region)?;
            stats.retired += 1;
        }
        Ok(stats)
    }

    /// Move `old` out of its region, or return where it already went
    pub(crate) fn relocate_object(&self, shared: &Shared, old: Address) -> GcResult<Address> {
        let table = self
            .table()
            .ok_or_else(|| GcError::corruption("relocation without a forwarding table"))?;
        if let Some(new) = table.get(old) {
            return Ok(new);
        }
        // SAFETY: `old` is not forwarded, so its region has not been retired
        let header = unsafe { old.header() };
        let backoff = Backoff::new();
        loop {
            if header.try_claim() {
                return self
                    .copy(shared, &table, old, header)
                    .inspect_err(|_| header.release_claim());
            }
            loop {
                let claimed = header.is_claimed();
                if let Some(new) = table.get(old) {
                    return Ok(new);
                }
                if !claimed {
                    break;
                }
                backoff.snooze();
            }
        }
    }

    fn copy(
        &self,
        shared: &Shared,
        table: &ForwardingTable,
        old: Address,
        header: &ObjectHeader,
    ) -> GcResult<Address> {
        let size = header.size();
        let source = shared
            .heap
            .region_for(old.as_usize())
            .ok_or(GcError::InvalidPointer {
                address: old.as_usize(),
            })?;
        let age = header.age().saturating_add(1);
        let generation = if !self.generational
            || source.generation() == Generation::Old
            || age >= self.tenure_threshold
        {
            Generation::Old
        } else {
            Generation::Young
        };

        let new = shared
            .allocator
            .allocate_relocation(&shared.heap, generation, size)?;
        // SAFETY: `new` was just allocated for this copy; `old` is claimed by
        // this thread and no mutator writes to an object in an evacuating region
        unsafe {
            initialize_object(new, size, header.layout(), age, table.epoch(), false);
            std::ptr::copy_nonoverlapping(old.as_ptr::<u8>(), new.as_ptr::<u8>(), size);
        }
        table.insert(old, new)?;

        self.objects.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(header.total_size(), Ordering::Relaxed);
        if generation == Generation::Old && source.generation() == Generation::Young {
            self.promoted_bytes
                .fetch_add(header.total_size(), Ordering::Relaxed);
        }
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            let observed = catch_unwind(AssertUnwindSafe(|| observer.on_relocate(old, new, size)));
            if observed.is_err() {
                tracing::warn!(target: "hue::gc", %old, %new, "relocation observer panicked");
            }
        }
        Ok(new)
    }

    /// Copy every live object of the relocation set with `threads` workers
    pub(crate) fn evacuate(
        &self,
        shared: &Shared,
        set: &RelocationSet,
        epoch: u64,
        threads: usize,
    ) -> GcResult<EvacuationOutcome> {
        let next = AtomicUsize::new(0);
        let failure: Mutex<Option<GcError>> = Mutex::new(None);
        let threads = threads.clamp(1, set.regions.len().max(1));

        let worker = || {
            loop {
                let index = next.fetch_add(1, Ordering::Relaxed);
                let Some(region) = set.regions.get(index) else {
                    return;
                };
                for object in region.live_objects(epoch) {
                    if shared.is_interrupted() || failure.lock().is_some() {
                        return;
                    }
                    match self.relocate_object(shared, object) {
                        Ok(_) => {}
                        Err(err) if err.is_fatal() => {
                            failure.lock().get_or_insert(err);
                            return;
                        }
                        Err(err) => {
                            tracing::warn!(
                                target: "hue::gc",
                                region = %region.id(),
                                object = %object,
                                error = %err,
                                "evacuation stopped, region kept"
                            );
                            break;
                        }
                    }
                }
            }
        };

        std::thread::scope(|scope| {
            for index in 0..threads {
                let spawned = std::thread::Builder::new()
                    .name(format!("hue-gc-relocate-{index}"))
                    .spawn_scoped(scope, move || {
                        enter_collector_thread();
                        worker()
                    });
                if let Err(err) = spawned {
                    tracing::warn!(
                        target: "hue::gc",
                        error = %err,
                        "failed to spawn relocation thread"
                    );
                }
            }
            // the driver helps, so a failed spawn never stalls evacuation
            worker();
        });

        if let Some(err) = failure.into_inner() {
            return Err(err);
        }
        if shared.is_interrupted() {
            return Ok(EvacuationOutcome::Interrupted);
        }
        Ok(EvacuationOutcome::Complete)
    }

    /// Retire every fully evacuated region; return the others to Sealed
    pub(crate) fn finish(
        &self,
        heap: &Heap,
        set: &RelocationSet,
        epoch: u64,
    ) -> GcResult<CleanupStats> {
        let table = self
            .table()
            .ok_or_else(|| GcError::corruption("cleanup without a forwarding table"))?;
        let mut stats = CleanupStats::default();
        for region in &set.regions {
            let evacuated = region
                .live_objects(epoch)
                .into_iter()
                .all(|object| table.get(object).is_some());
            if evacuated {
                stats.reclaimed_bytes += region.used_bytes();
                heap.retire_region(region)?;
                stats.retired += 1;
            } else {
                region.transition(RegionState::Relocating, RegionState::Sealed);
                stats.kept += 1;
            }
        }
        self.set_state(RelocatorState::Remapping);
        Ok(stats)
    }
}

impl std::fmt::Debug for Relocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relocator")
            .field("state", &self.state())
            .field("table", &self.table())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::test_support::{allocate, config, shared, shared_with};
    use crate::object::LayoutId;
    use std::collections::HashMap;

    #[derive(Default)]
    struct CountCopies(parking_lot::Mutex<HashMap<usize, usize>>);

    impl RelocationObserver for CountCopies {
        fn on_relocate(&self, old: Address, _new: Address, _size: usize) {
            *self.0.lock().entry(old.as_usize()).or_default() += 1;
        }
    }

    /// Mark `objects` live for `epoch` the way the marker would
    fn mark(shared: &Shared, objects: &[Address], epoch: u64) {
        for &object in objects {
            let header = unsafe { object.header() };
            assert!(header.try_mark(epoch));
            let region = shared.heap.region_for(object.as_usize()).unwrap();
            region.mark_live(object, header.total_size(), epoch);
        }
    }

    fn prepare(shared: &Shared, epoch: u64, set: &RelocationSet) {
        for region in &set.regions {
            assert!(region.transition(RegionState::Sealed, RegionState::Relocating));
        }
        shared.relocator.install_table(Arc::new(ForwardingTable::new(epoch)));
    }

    #[test]
    fn test_selection_orders_by_liveness_and_skips_dense() {
        let shared = shared();
        let a = allocate(&shared, 64, LayoutId::LEAF);
        shared.heap.seal_all();
        shared.allocator.reset();
        let b = allocate(&shared, 64, LayoutId::LEAF);
        let c = allocate(&shared, 128, LayoutId::LEAF);
        let _garbage = allocate(&shared, 64, LayoutId::LEAF);
        shared.heap.seal_all();
        shared.allocator.reset();
        let _dead_region = allocate(&shared, 64, LayoutId::LEAF);
        shared.heap.seal_all();

        mark(&shared, &[a, b, c], 1);
        let set = shared
            .relocator
            .select_relocation_set(&shared.heap, GcGeneration::Young, 1);
        assert_eq!(set.regions.len(), 2);
        assert_eq!(set.empty.len(), 1);
        assert!(set.regions[0].live_bytes(1) <= set.regions[1].live_bytes(1));
        assert_eq!(shared.relocator.state(), RelocatorState::SelectionDone);

        // both regions are sparse, so an old collection takes them as well
        let set = shared
            .relocator
            .select_relocation_set(&shared.heap, GcGeneration::Old, 1);
        assert_eq!(set.regions.len(), 2);
    }

    #[test]
    fn test_relocate_copies_once_and_forwards() {
        let shared = shared();
        let observer = Arc::new(CountCopies::default());
        shared.relocator.set_observer(Some(observer.clone()));

        let object = allocate(&shared, 32, LayoutId::LEAF);
        unsafe { object.slot(8) }.store(0xfeed, Ordering::Relaxed);
        shared.heap.seal_all();
        shared.allocator.reset();
        mark(&shared, &[object], 1);
        let set = shared
            .relocator
            .select_relocation_set(&shared.heap, GcGeneration::Young, 1);
        prepare(&shared, 1, &set);

        let new = shared.relocator.relocate_object(&shared, object).unwrap();
        assert_ne!(new, object);
        assert_eq!(shared.relocator.relocate_object(&shared, object).unwrap(), new);
        assert_eq!(unsafe { new.slot(8) }.load(Ordering::Relaxed), 0xfeed);
        let header = unsafe { new.header() };
        assert_eq!(header.size(), 32);
        assert_eq!(header.age(), 1);
        assert!(header.is_marked(1));
        assert_eq!(observer.0.lock()[&object.as_usize()], 1);
    }

    #[test]
    fn test_concurrent_relocation_copies_exactly_once() {
        let shared = shared();
        let observer = Arc::new(CountCopies::default());
        shared.relocator.set_observer(Some(observer.clone()));

        let objects: Vec<_> = (0..500).map(|_| allocate(&shared, 48, LayoutId::LEAF)).collect();
        shared.heap.seal_all();
        shared.allocator.reset();
        mark(&shared, &objects, 1);
        let set = shared
            .relocator
            .select_relocation_set(&shared.heap, GcGeneration::Young, 1);
        prepare(&shared, 1, &set);

        let results: Vec<Vec<Address>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        objects
                            .iter()
                            .map(|&o| shared.relocator.relocate_object(&shared, o).unwrap())
                            .collect()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for result in &results[1..] {
            assert_eq!(result, &results[0]);
        }
        let copies = observer.0.lock();
        assert_eq!(copies.len(), 500);
        assert!(copies.values().all(|&count| count == 1));
        assert_eq!(shared.relocator.stats().objects, 500);
    }

    #[test]
    fn test_evacuate_and_finish_retire_regions() {
        let shared = shared();
        let objects: Vec<_> = (0..100).map(|_| allocate(&shared, 64, LayoutId::LEAF)).collect();
        shared.heap.seal_all();
        shared.allocator.reset();
        mark(&shared, &objects, 1);
        let set = shared
            .relocator
            .select_relocation_set(&shared.heap, GcGeneration::Young, 1);
        let evacuated: Vec<_> = set.regions.iter().map(|r| r.start()).collect();
        prepare(&shared, 1, &set);

        let outcome = shared.relocator.evacuate(&shared, &set, 1, 3).unwrap();
        assert_eq!(outcome, EvacuationOutcome::Complete);
        let table = shared.relocator.table().unwrap();
        assert_eq!(table.len(), 100);

        let cleanup = shared.relocator.finish(&shared.heap, &set, 1).unwrap();
        assert_eq!(cleanup.retired, set.regions.len());
        assert_eq!(cleanup.kept, 0);
        assert_eq!(shared.relocator.state(), RelocatorState::Remapping);
        for start in evacuated {
            assert!(shared.heap.region_for(start).is_none());
        }
    }

    #[test]
    fn test_tenured_copies_go_old() {
        let shared = shared_with(GcConfig {
            tenure_threshold: 1,
            ..config()
        });
        let object = allocate(&shared, 16, LayoutId::LEAF);
        shared.heap.seal_all();
        shared.allocator.reset();
        mark(&shared, &[object], 1);
        let set = shared
            .relocator
            .select_relocation_set(&shared.heap, GcGeneration::Young, 1);
        prepare(&shared, 1, &set);

        let new = shared.relocator.relocate_object(&shared, object).unwrap();
        let region = shared.heap.region_for(new.as_usize()).unwrap();
        assert_eq!(region.generation(), Generation::Old);
        assert_eq!(shared.relocator.stats().promoted_bytes, unsafe { new.header() }.total_size());
    }

    #[test]
    fn test_discard_waits_for_published_epochs() {
        let shared = shared();
        shared.relocator.install_table(Arc::new(ForwardingTable::new(3)));
        assert!(!shared.relocator.discard_table(Some(3)));
        assert!(shared.relocator.table().is_some());
        assert!(shared.relocator.discard_table(Some(4)));
        assert!(shared.relocator.table().is_none());
        assert!(!shared.relocator.discard_table(None));
        assert_eq!(shared.relocator.state(), RelocatorState::Idle);
    }
}
