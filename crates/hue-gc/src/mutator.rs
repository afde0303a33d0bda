//! Mutator threads
//!
//! A [`Mutator`] is a thread's handle on the heap: it allocates, reads and
//! writes reference slots through the barriers, and takes part in
//! safepoints. It is `Send` but not `Sync`; each thread gets its own from
//! [`Collector::mutator`](crate::Collector::mutator).
//!
//! Raw [`Address`]es held by the thread are only valid until the next
//! [`Mutator::poll`], [`Mutator::detach`] or [`Mutator::collect`]: a
//! relocation may move the object in between. Keep objects that must
//! survive in roots or in reference slots and reload them afterwards.

use crate::allocator::{Tlab, initialize_object};
use crate::barrier;
use crate::collector::{GcGeneration, GcReason, Shared};
use crate::error::{ErrorKind, GcError, GcResult};
use crate::memory::page_size;
use crate::object::{Address, HEADER_SIZE, LayoutId, OBJECT_ALIGNMENT, align_up};
use crate::region::{Generation, SizeClass};
use crate::safepoint::{MutatorId, SafePointState};
use crate::state::GcPhase;
use crate::weak::WeakRef;
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-thread allocation and access handle
pub struct Mutator {
    shared: Arc<Shared>,
    id: MutatorId,
    tlab: Tlab,
    tlab_size: usize,
    tlab_epoch: u64,
    detached: Cell<bool>,
    _not_sync: PhantomData<Cell<()>>,
}

impl Mutator {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let id = shared.safepoints.register();
        tracing::trace!(target: "hue::gc", mutator = id.0, "mutator registered");
        Self {
            id,
            tlab: Tlab::empty(),
            tlab_size: shared.config.tlab_size,
            tlab_epoch: shared.state.epoch(),
            detached: Cell::new(false),
            _not_sync: PhantomData,
            shared,
        }
    }

    /// Safepoint identity of this thread
    pub fn id(&self) -> MutatorId {
        self.id
    }

    /// Safepoint state of this thread
    pub fn state(&self) -> SafePointState {
        self.shared
            .safepoints
            .thread_state(self.id)
            .unwrap_or(SafePointState::Detached)
    }

    /// Allocate `size` zeroed bytes without reference slots
    pub fn allocate(&mut self, size: usize) -> GcResult<Address> {
        self.allocate_inner(size, OBJECT_ALIGNMENT, LayoutId::LEAF)
    }

    /// Allocate `size` zeroed bytes whose reference slots `layout` describes
    pub fn allocate_with_layout(&mut self, size: usize, layout: LayoutId) -> GcResult<Address> {
        self.allocate_inner(size, OBJECT_ALIGNMENT, layout)
    }

    /// Allocate `size` zeroed bytes at an `align`-aligned address. `align`
    /// must be a power of two no larger than a page.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> GcResult<Address> {
        self.allocate_inner(size, align, LayoutId::LEAF)
    }

    fn allocate_inner(&mut self, size: usize, align: usize, layout: LayoutId) -> GcResult<Address> {
        if !align.is_power_of_two() || align > page_size() {
            return Err(GcError::Alignment { size, align });
        }
        if size == 0
            || size > self.shared.config.max_heap_size
            || align_up(size, OBJECT_ALIGNMENT) > u32::MAX as usize
        {
            return Err(GcError::InvalidSize { size });
        }
        if !self.shared.layouts.contains(layout) {
            return Err(GcError::Configuration(format!(
                "unknown layout {}",
                layout.index()
            )));
        }
        self.attach();

        let payload = align_up(size, OBJECT_ALIGNMENT);
        let align = align.max(OBJECT_ALIGNMENT);
        let mut failure = match self.try_allocate(payload, align, layout) {
            Err(err) if err.kind() == ErrorKind::ResourceExhaustion => err,
            result => return result,
        };
        for generation in [GcGeneration::Young, GcGeneration::Full] {
            tracing::debug!(
                target: "hue::gc",
                size,
                ?generation,
                error = %failure,
                "allocation failed, collecting"
            );
            self.collect_with(generation, GcReason::AllocationFailure)?;
            failure = match self.try_allocate(payload, align, layout) {
                Err(err) if err.kind() == ErrorKind::ResourceExhaustion => err,
                result => return result,
            };
        }
        tracing::warn!(target: "hue::gc", size, error = %failure, "heap exhausted");
        Err(failure)
    }

    fn try_allocate(&mut self, payload: usize, align: usize, layout: LayoutId) -> GcResult<Address> {
        let needed = HEADER_SIZE + payload + (align - OBJECT_ALIGNMENT);
        let generation = if self.shared.config.generational {
            Generation::Young
        } else {
            Generation::Old
        };

        if needed <= self.shared.config.small_threshold {
            if self.shared.config.tlab_enabled {
                if let Some(object) = self.tlab.try_allocate(payload, align) {
                    // SAFETY: carved from this thread's TLAB, zeroed on refill
                    unsafe {
                        initialize_object(object, payload, layout, 0, self.tlab.epoch(), false)
                    };
                    return Ok(object);
                }
                match self.refill_tlab(needed, generation) {
                    Ok(()) => {
                        if let Some(object) = self.tlab.try_allocate(payload, align) {
                            // SAFETY: as above
                            unsafe {
                                initialize_object(
                                    object,
                                    payload,
                                    layout,
                                    0,
                                    self.tlab.epoch(),
                                    false,
                                )
                            };
                            self.check_occupancy();
                            return Ok(object);
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::ResourceExhaustion => {}
                    Err(err) => return Err(err),
                }
                // no TLAB-sized chunk left; the object gets a region of its own
                let object = self.shared.allocator.allocate_large(
                    &self.shared.heap,
                    generation,
                    payload,
                    align,
                )?;
                return Ok(self.finish_allocation(object, payload, layout));
            }
            let object = self.shared.allocator.allocate_shared(
                &self.shared.heap,
                generation,
                SizeClass::Small,
                payload,
                align,
            )?;
            return Ok(self.finish_allocation(object, payload, layout));
        }

        let object = if needed <= self.shared.config.large_threshold {
            self.shared.allocator.allocate_shared(
                &self.shared.heap,
                generation,
                SizeClass::Medium,
                payload,
                align,
            )?
        } else {
            self.shared
                .allocator
                .allocate_large(&self.shared.heap, Generation::Old, payload, align)?
        };
        Ok(self.finish_allocation(object, payload, layout))
    }

    fn finish_allocation(&self, object: Address, payload: usize, layout: LayoutId) -> Address {
        let epoch = self.shared.state.epoch();
        // SAFETY: just bump-allocated by this thread and not yet published
        unsafe { initialize_object(object, payload, layout, 0, epoch, true) };
        self.check_occupancy();
        object
    }

    fn refill_tlab(&mut self, needed: usize, generation: Generation) -> GcResult<()> {
        let config = &self.shared.config;
        let epoch = self.shared.state.epoch();
        if epoch != self.tlab_epoch {
            self.tlab_size = config.tlab_size;
            self.tlab_epoch = epoch;
        }
        let size = align_up(self.tlab_size.max(needed), OBJECT_ALIGNMENT);
        let min_size = config.tlab_min_size.max(needed);
        self.shared.allocator.refill_tlab(
            &self.shared.heap,
            &mut self.tlab,
            generation,
            size,
            min_size,
            epoch,
        )?;
        if config.tlab_resize {
            self.tlab_size = (self.tlab_size * 2).min(config.tlab_max_size);
        }
        tracing::trace!(
            target: "hue::gc",
            mutator = self.id.0,
            capacity = self.tlab.capacity(),
            epoch,
            "TLAB refilled"
        );
        Ok(())
    }

    /// Ask for a young cycle once the heap passes the trigger ratio or the
    /// young generation outgrows its share of the heap
    fn check_occupancy(&self) {
        if self.shared.state.phase() != GcPhase::Idle {
            return;
        }
        let config = &self.shared.config;
        let heap = &self.shared.heap;
        let heap_full = self
            .shared
            .sizer
            .trigger_bytes(config)
            .is_some_and(|trigger| heap.committed() > trigger);
        let young_full = config.generational && heap.young_committed() > config.young_target();
        if heap_full || young_full {
            // fails only once the collector is shut down
            let _ = self
                .shared
                .request_gc(GcGeneration::Young, GcReason::HeapOccupancy);
        }
    }

    /// Read the reference at `offset` of `object`
    pub fn load_ref(&self, object: Address, offset: usize) -> GcResult<Option<Address>> {
        let slot = self.slot(object, offset)?;
        let ptr = barrier::heal(&self.shared, slot)?;
        Ok((!ptr.is_null()).then(|| ptr.address()))
    }

    /// Write a reference to `offset` of `object`
    pub fn store_ref(&self, object: Address, offset: usize, value: Option<Address>) -> GcResult<()> {
        let slot = self.slot(object, offset)?;
        if let Some(value) = value {
            self.shared.validate_object(value)?;
        }
        barrier::store(&self.shared, slot, value)
    }

    /// Referent of a weak reference, or `None` once it has been collected.
    /// The returned address keeps the object alive like any other value the
    /// thread holds.
    pub fn load_weak(&self, weak: WeakRef) -> GcResult<Option<Address>> {
        self.attach();
        self.shared.weak_refs.load(&self.shared, weak)
    }

    /// Read a non-reference word
    pub fn read_word(&self, object: Address, offset: usize) -> GcResult<usize> {
        Ok(self.slot(object, offset)?.load(Ordering::Relaxed))
    }

    /// Write a non-reference word. Writing into a reference slot corrupts it.
    pub fn write_word(&self, object: Address, offset: usize, value: usize) -> GcResult<()> {
        self.slot(object, offset)?.store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Payload size of `object`
    pub fn size_of(&self, object: Address) -> GcResult<usize> {
        // a detached thread would race the safepoints that move objects
        self.attach();
        self.shared.validate_object(object)?;
        // SAFETY: validated to lie inside a live region
        Ok(unsafe { object.header() }.size())
    }

    fn slot(&self, object: Address, offset: usize) -> GcResult<&AtomicUsize> {
        let size = self.size_of(object)?;
        if offset % OBJECT_ALIGNMENT != 0 || offset + OBJECT_ALIGNMENT > size {
            return Err(GcError::OutOfBounds { offset, size });
        }
        // SAFETY: the word lies inside the object's payload
        Ok(unsafe { object.slot(offset) })
    }

    /// Safepoint check. Blocks while the collector needs all threads
    /// stopped; raw addresses may be stale afterwards.
    pub fn poll(&mut self) {
        if !self.detached.get() && self.shared.safepoints.is_requested() {
            self.tlab.retire();
            self.shared.safepoints.block(self.id);
        }
    }

    /// Stop taking part in safepoints, e.g. before blocking on I/O. Any
    /// heap access (allocation, slot reads and writes, weak loads)
    /// reattaches first, waiting out a safepoint in progress.
    pub fn detach(&mut self) {
        if self.detached.get() {
            return;
        }
        self.tlab.retire();
        self.shared.safepoints.detach(self.id);
        self.detached.set(true);
    }

    /// Take part in safepoints again; waits out a safepoint in progress
    pub fn reattach(&mut self) {
        self.attach();
    }

    fn attach(&self) {
        if self.detached.get() {
            self.shared.safepoints.reattach(self.id);
            self.detached.set(false);
        }
    }

    /// Whether [`Mutator::detach`] is in effect
    pub fn is_detached(&self) -> bool {
        self.detached.get()
    }

    /// Run a cycle and wait for it, detached for the duration
    pub fn collect(&mut self, generation: GcGeneration) -> GcResult<()> {
        self.collect_with(generation, GcReason::Explicit)
    }

    fn collect_with(&mut self, generation: GcGeneration, reason: GcReason) -> GcResult<()> {
        let was_detached = self.detached.get();
        self.detach();
        let result = self.shared.collect(generation, reason);
        if !was_detached {
            self.reattach();
        }
        result
    }

    /// Bytes left in the current TLAB
    pub fn tlab_remaining(&self) -> usize {
        self.tlab.remaining()
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.tlab.retire();
        self.shared.safepoints.deregister(self.id);
        tracing::trace!(target: "hue::gc", mutator = self.id.0, "mutator deregistered");
    }
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("id", &self.id)
            .field("detached", &self.detached.get())
            .field("tlab", &self.tlab)
            .finish()
    }
}
