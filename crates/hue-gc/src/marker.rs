//! Concurrent marking
//!
//! Roots are pushed into a global [`Injector`] at a safepoint; worker threads
//! then drain it through per-worker LIFO deques, stealing from the injector
//! and from each other when their own deque runs dry.
//!
//! An object is traced by the one worker whose compare-and-exchange advances
//! its header to the current epoch, so cycles terminate and nothing is
//! scanned twice. The winner records the object in its region's live map and
//! heals every reference slot on the way.
//!
//! Termination: a worker holding items in its own deque always counts as
//! active, so once no worker is active and the injector is empty there is no
//! work left anywhere. Mutator stores that land in the injector after that
//! point are drained by the remark pass.

use crate::barrier;
use crate::collector::{Shared, enter_collector_thread};
use crate::error::{GcError, GcResult};
use crate::object::{Address, LayoutTable, OBJECT_ALIGNMENT};
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Instant;

/// Marker state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    /// Not marking
    Idle = 0,
    /// Snapshotting roots at a safepoint
    RootScanning = 1,
    /// Tracing concurrently with mutators
    Tracing = 2,
    /// Marking of the current epoch is complete
    Done = 3,
}

impl From<u8> for MarkerState {
    fn from(v: u8) -> Self {
        match v {
            1 => MarkerState::RootScanning,
            2 => MarkerState::Tracing,
            3 => MarkerState::Done,
            _ => MarkerState::Idle,
        }
    }
}

/// Outcome of one tracing pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOutcome {
    /// No reachable object is left unmarked
    Complete,
    /// Stopped early because the collector is shutting down
    Interrupted,
}

/// Marking statistics of the current cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkStats {
    /// Objects marked
    pub objects: usize,
    /// Bytes marked, headers included
    pub bytes: usize,
}

/// Work-stealing marker
pub struct Marker {
    state: AtomicU8,
    injector: Injector<Address>,
    marked_objects: AtomicUsize,
    marked_bytes: AtomicUsize,
}

impl Default for Marker {
    fn default() -> Self {
        Self::new()
    }
}

impl Marker {
    /// Idle marker with an empty queue
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(MarkerState::Idle as u8),
            injector: Injector::new(),
            marked_objects: AtomicUsize::new(0),
            marked_bytes: AtomicUsize::new(0),
        }
    }

    /// Current state
    pub fn state(&self) -> MarkerState {
        MarkerState::from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: MarkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Queue an object for tracing. Ignored unless marking is in progress.
    pub(crate) fn enqueue(&self, object: Address) {
        if matches!(
            self.state(),
            MarkerState::RootScanning | MarkerState::Tracing
        ) {
            self.injector.push(object);
        }
    }

    /// Objects waiting in the global queue
    pub fn pending(&self) -> usize {
        self.injector.len()
    }

    /// Marking statistics of the current cycle
    pub fn stats(&self) -> MarkStats {
        MarkStats {
            objects: self.marked_objects.load(Ordering::Relaxed),
            bytes: self.marked_bytes.load(Ordering::Relaxed),
        }
    }

    /// Prepare for a new cycle: drop leftovers and reset counters
    pub(crate) fn reset(&self) {
        while !self.injector.is_empty() {
            let _ = self.injector.steal();
        }
        self.marked_objects.store(0, Ordering::Relaxed);
        self.marked_bytes.store(0, Ordering::Relaxed);
    }

    /// Abandon marking
    pub(crate) fn abort(&self) {
        self.set_state(MarkerState::Idle);
        self.reset();
    }

    /// Heal every root slot and queue its referent. Runs at a safepoint.
    pub(crate) fn scan_roots(&self, shared: &Shared) -> GcResult<usize> {
        let mut scanned = 0;
        let mut failure = None;
        shared.roots.for_each_slot(&mut |slot| {
            if failure.is_some() {
                return;
            }
            match barrier::heal(shared, slot) {
                Ok(ptr) if !ptr.is_null() => {
                    self.injector.push(ptr.address());
                    scanned += 1;
                }
                Ok(_) => {}
                Err(err) => failure = Some(err),
            }
        })?;
        match failure {
            Some(err) => Err(err),
            None => Ok(scanned),
        }
    }

    /// Trace everything reachable from the queued objects with `threads`
    /// workers
    pub(crate) fn start_concurrent_marking(
        &self,
        shared: &Shared,
        threads: usize,
    ) -> GcResult<TraceOutcome> {
        let start = Instant::now();
        let outcome = self.trace(shared, threads)?;
        tracing::debug!(
            target: "hue::gc",
            epoch = shared.state.epoch(),
            threads,
            marked_objects = self.marked_objects.load(Ordering::Relaxed),
            marked_bytes = self.marked_bytes.load(Ordering::Relaxed),
            elapsed_us = start.elapsed().as_micros() as u64,
            ?outcome,
            "concurrent marking finished"
        );
        Ok(outcome)
    }

    /// Final marking at a safepoint: rescan roots, then drain what mutators
    /// recorded since the concurrent pass finished
    pub(crate) fn remark(&self, shared: &Shared, threads: usize) -> GcResult<TraceOutcome> {
        let satb = self.pending();
        let roots = self.scan_roots(shared)?;
        let outcome = self.trace(shared, threads)?;
        tracing::trace!(
            target: "hue::gc",
            epoch = shared.state.epoch(),
            satb,
            roots,
            "remark finished"
        );
        Ok(outcome)
    }

    fn trace(&self, shared: &Shared, threads: usize) -> GcResult<TraceOutcome> {
        let threads = threads.max(1);
        let layouts = shared.layouts.snapshot();
        let workers: Vec<Worker<Address>> = (0..threads).map(|_| Worker::new_lifo()).collect();
        let stealers: Vec<Stealer<Address>> = workers.iter().map(Worker::stealer).collect();
        let context = TraceContext {
            shared,
            marker: self,
            layouts: &layouts,
            stealers: &stealers,
            epoch: shared.state.epoch(),
            active: AtomicUsize::new(threads),
            abort: AtomicBool::new(false),
            failure: Mutex::new(None),
        };

        std::thread::scope(|scope| {
            for (index, local) in workers.into_iter().enumerate() {
                let context = &context;
                let spawned = std::thread::Builder::new()
                    .name(format!("hue-gc-mark-{index}"))
                    .spawn_scoped(scope, move || {
                        enter_collector_thread();
                        context.run(local)
                    });
                if let Err(err) = spawned {
                    context.active.fetch_sub(1, Ordering::AcqRel);
                    context.fail(GcError::corruption(format!(
                        "failed to spawn marking thread: {err}"
                    )));
                }
            }
        });

        if let Some(err) = context.failure.into_inner() {
            return Err(err);
        }
        if shared.is_interrupted() {
            return Ok(TraceOutcome::Interrupted);
        }
        Ok(TraceOutcome::Complete)
    }
}

impl std::fmt::Debug for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Marker")
            .field("state", &self.state())
            .field("pending", &self.pending())
            .field("stats", &self.stats())
            .finish()
    }
}

struct TraceContext<'a> {
    shared: &'a Shared,
    marker: &'a Marker,
    layouts: &'a LayoutTable,
    stealers: &'a [Stealer<Address>],
    epoch: u64,
    /// Workers that may hold work
    active: AtomicUsize,
    abort: AtomicBool,
    failure: Mutex<Option<GcError>>,
}

impl TraceContext<'_> {
    fn run(&self, local: Worker<Address>) {
        let backoff = Backoff::new();
        loop {
            if self.should_stop() {
                return;
            }
            if let Some(object) = self.find_task(&local) {
                backoff.reset();
                if let Err(err) = self.process(object, &local) {
                    self.fail(err);
                    return;
                }
                continue;
            }

            self.active.fetch_sub(1, Ordering::AcqRel);
            loop {
                if self.should_stop() {
                    return;
                }
                if self.work_visible() {
                    self.active.fetch_add(1, Ordering::AcqRel);
                    break;
                }
                if self.active.load(Ordering::Acquire) == 0 && self.marker.injector.is_empty() {
                    return;
                }
                backoff.snooze();
            }
        }
    }

    fn find_task(&self, local: &Worker<Address>) -> Option<Address> {
        local.pop().or_else(|| {
            std::iter::repeat_with(|| {
                self.marker
                    .injector
                    .steal_batch_and_pop(local)
                    .or_else(|| self.stealers.iter().map(Stealer::steal).collect())
            })
            .find(|steal| !steal.is_retry())
            .and_then(Steal::success)
        })
    }

    fn work_visible(&self) -> bool {
        !self.marker.injector.is_empty() || self.stealers.iter().any(|s| !s.is_empty())
    }

    fn should_stop(&self) -> bool {
        self.abort.load(Ordering::Acquire) || self.shared.is_interrupted()
    }

    fn fail(&self, err: GcError) {
        self.failure.lock().get_or_insert(err);
        self.abort.store(true, Ordering::Release);
    }

    fn process(&self, object: Address, local: &Worker<Address>) -> GcResult<()> {
        // SAFETY: queued addresses come from healed slots, so they are the
        // current location of an object that was reachable at the snapshot
        let header = unsafe { object.header() };
        if !header.try_mark(self.epoch) {
            return Ok(());
        }
        let region = self
            .shared
            .heap
            .region_for(object.as_usize())
            .ok_or_else(|| GcError::corruption(format!("marked object {object} outside any region")))?;
        region.mark_live(object, header.total_size(), self.epoch);
        self.marker.marked_objects.fetch_add(1, Ordering::Relaxed);
        self.marker
            .marked_bytes
            .fetch_add(header.total_size(), Ordering::Relaxed);

        let Some(map) = self.layouts.get(header.layout()) else {
            return Err(GcError::corruption(format!(
                "object {object} has unregistered layout {:?}",
                header.layout()
            )));
        };
        let size = header.size();
        let mut failure = None;
        let visited = catch_unwind(AssertUnwindSafe(|| {
            map.for_each_offset(size, &mut |offset| {
                if failure.is_some() {
                    return;
                }
                let end = offset.checked_add(OBJECT_ALIGNMENT);
                if offset % OBJECT_ALIGNMENT != 0 || end.is_none_or(|end| end > size) {
                    failure = Some(GcError::OutOfBounds { offset, size });
                    return;
                }
                // SAFETY: `offset` was just checked to be an aligned word
                // inside the payload
                let slot = unsafe { object.slot(offset) };
                match barrier::heal(self.shared, slot) {
                    Ok(ptr) if !ptr.is_null() => local.push(ptr.address()),
                    Ok(_) => {}
                    Err(err) => failure = Some(err),
                }
            })
        }));
        if visited.is_err() {
            return Err(GcError::LockPoisoned(format!(
                "pointer map of layout {:?} panicked",
                header.layout()
            )));
        }
        failure.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::test_support::{allocate, shared};
    use crate::object::{AllSlots, FixedSlots, LayoutId};
    use crate::roots::RootType;
    use std::sync::Arc;

    fn begin(shared: &Shared) -> u64 {
        let epoch = shared.state.begin_marking().unwrap();
        shared.heap.seal_all();
        shared.allocator.reset();
        shared.marker.reset();
        shared.marker.set_state(MarkerState::RootScanning);
        epoch
    }

    fn link(shared: &Shared, from: Address, offset: usize, to: Address) {
        barrier::store(shared, unsafe { from.slot(offset) }, Some(to)).unwrap();
    }

    #[test]
    fn test_marks_reachable_graph() {
        let shared = shared();
        let pair = shared
            .layouts
            .register(Arc::new(FixedSlots(vec![0, 8])))
            .unwrap();
        let root = allocate(&shared, 16, pair);
        let left = allocate(&shared, 16, pair);
        let right = allocate(&shared, 16, LayoutId::LEAF);
        let garbage = allocate(&shared, 64, LayoutId::LEAF);
        link(&shared, root, 0, left);
        link(&shared, left, 8, right);
        shared
            .roots
            .register(crate::colored::ColoredPointer::encode(root, 0).raw(), RootType::Global)
            .unwrap();

        let epoch = begin(&shared);
        assert_eq!(shared.marker.scan_roots(&shared).unwrap(), 1);
        shared.marker.set_state(MarkerState::Tracing);
        let outcome = shared.marker.start_concurrent_marking(&shared, 4).unwrap();
        assert_eq!(outcome, TraceOutcome::Complete);

        for object in [root, left, right] {
            assert!(unsafe { object.header() }.is_marked(epoch));
        }
        assert!(!unsafe { garbage.header() }.is_marked(epoch));
        assert_eq!(shared.marker.stats().objects, 3);

        let region = shared.heap.region_for(root.as_usize()).unwrap();
        assert_eq!(region.live_objects(epoch).len(), 3);
    }

    #[test]
    fn test_cycles_terminate() {
        let shared = shared();
        let array = shared.layouts.register(Arc::new(AllSlots)).unwrap();
        let a = allocate(&shared, 16, array);
        let b = allocate(&shared, 16, array);
        link(&shared, a, 0, a);
        link(&shared, a, 8, b);
        link(&shared, b, 0, a);
        shared
            .roots
            .register(crate::colored::ColoredPointer::encode(b, 0).raw(), RootType::Stack)
            .unwrap();

        let epoch = begin(&shared);
        shared.marker.scan_roots(&shared).unwrap();
        shared.marker.set_state(MarkerState::Tracing);
        shared.marker.start_concurrent_marking(&shared, 2).unwrap();
        assert!(unsafe { a.header() }.is_marked(epoch));
        assert!(unsafe { b.header() }.is_marked(epoch));
        assert_eq!(shared.marker.stats().objects, 2);
    }

    #[test]
    fn test_long_chain_with_many_workers() {
        let shared = shared();
        let node = shared.layouts.register(Arc::new(FixedSlots(vec![0]))).unwrap();
        let head = allocate(&shared, 16, node);
        let mut tail = head;
        for _ in 0..2000 {
            let next = allocate(&shared, 16, node);
            link(&shared, tail, 0, next);
            tail = next;
        }
        shared
            .roots
            .register(crate::colored::ColoredPointer::encode(head, 0).raw(), RootType::Global)
            .unwrap();

        let epoch = begin(&shared);
        shared.marker.scan_roots(&shared).unwrap();
        shared.marker.set_state(MarkerState::Tracing);
        shared.marker.start_concurrent_marking(&shared, 8).unwrap();
        assert!(unsafe { tail.header() }.is_marked(epoch));
        assert_eq!(shared.marker.stats().objects, 2001);
    }

    #[test]
    fn test_remark_drains_recorded_stores() {
        let shared = shared();
        let holder = shared.layouts.register(Arc::new(FixedSlots(vec![0]))).unwrap();
        let root = allocate(&shared, 16, holder);
        let hidden = allocate(&shared, 16, LayoutId::LEAF);
        link(&shared, root, 0, hidden);
        shared
            .roots
            .register(crate::colored::ColoredPointer::encode(root, 0).raw(), RootType::Global)
            .unwrap();

        let epoch = begin(&shared);
        shared.marker.set_state(MarkerState::Tracing);
        // overwrite before the root is traced: the old referent is recorded
        barrier::store(&shared, unsafe { root.slot(0) }, None).unwrap();
        assert_eq!(shared.marker.pending(), 1);

        let outcome = shared.marker.remark(&shared, 2).unwrap();
        assert_eq!(outcome, TraceOutcome::Complete);
        assert!(unsafe { hidden.header() }.is_marked(epoch));
        assert!(unsafe { root.header() }.is_marked(epoch));
    }

    struct BadOffsets(Vec<usize>);

    impl crate::object::PointerMap for BadOffsets {
        fn for_each_offset(&self, _size: usize, visitor: &mut dyn FnMut(usize)) {
            for &offset in &self.0 {
                visitor(offset);
            }
        }
    }

    struct PanickingMap;

    impl crate::object::PointerMap for PanickingMap {
        fn for_each_offset(&self, _size: usize, _visitor: &mut dyn FnMut(usize)) {
            panic!("layout callback failed");
        }
    }

    fn trace_from(shared: &Shared, root: Address) -> GcResult<TraceOutcome> {
        shared
            .roots
            .register(crate::colored::ColoredPointer::encode(root, 0).raw(), RootType::Global)
            .unwrap();
        begin(shared);
        shared.marker.scan_roots(shared)?;
        shared.marker.set_state(MarkerState::Tracing);
        shared.marker.start_concurrent_marking(shared, 2)
    }

    #[test]
    fn test_bad_pointer_map_offsets_are_rejected() {
        let cases = [
            (vec![0, 4], 4),
            (vec![16], 16),
            (vec![usize::MAX - 7], usize::MAX - 7),
        ];
        for (offsets, bad) in cases {
            let shared = shared();
            let layout = shared.layouts.register(Arc::new(BadOffsets(offsets))).unwrap();
            let object = allocate(&shared, 16, layout);
            assert_eq!(
                trace_from(&shared, object),
                Err(GcError::OutOfBounds { offset: bad, size: 16 })
            );
        }
    }

    #[test]
    fn test_panicking_pointer_map_fails_marking() {
        let shared = shared();
        let layout = shared.layouts.register(Arc::new(PanickingMap)).unwrap();
        let object = allocate(&shared, 16, layout);
        assert!(matches!(
            trace_from(&shared, object),
            Err(GcError::LockPoisoned(_))
        ));
    }

    #[test]
    fn test_enqueue_ignored_when_not_marking() {
        let marker = Marker::new();
        marker.enqueue(Address::new(0x1000));
        assert_eq!(marker.pending(), 0);
        marker.set_state(MarkerState::Tracing);
        marker.enqueue(Address::new(0x1000));
        assert_eq!(marker.pending(), 1);
        marker.abort();
        assert_eq!(marker.pending(), 0);
        assert_eq!(marker.state(), MarkerState::Idle);
    }
}
