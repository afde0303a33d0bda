//! Object allocation
//!
//! Small objects are bump-allocated from a thread-local [`Tlab`] carved out of
//! a shared small region; refilling takes a CAS on the region, allocating
//! inside the buffer takes nothing. Medium objects are bump-allocated
//! directly in a shared medium region with a CAS, large objects get a region
//! each. Relocation copies go through separate to-space regions so evacuation
//! does not compete with mutators for the same bump pointer.

use crate::error::{GcError, GcResult};
use crate::heap::Heap;
use crate::object::{Address, HEADER_SIZE, LayoutId, ObjectHeader, OBJECT_ALIGNMENT, align_up};
use crate::region::{Generation, Region, SizeClass};
use parking_lot::Mutex;
use std::sync::Arc;

/// Thread-local allocation buffer
///
/// `start <= current <= end` always holds; the range belongs to one mutator.
#[derive(Debug, Default)]
pub struct Tlab {
    start: usize,
    current: usize,
    end: usize,
    epoch: u64,
}

impl Tlab {
    /// A buffer with no space
    pub const fn empty() -> Self {
        Self {
            start: 0,
            current: 0,
            end: 0,
            epoch: 0,
        }
    }

    /// Bump `payload` bytes (plus header) aligned to `align`; no atomics
    #[inline]
    pub fn try_allocate(&mut self, payload: usize, align: usize) -> Option<Address> {
        let object = align_up(self.current + HEADER_SIZE, align);
        let end = object + payload;
        if end > self.end {
            return None;
        }
        self.current = end;
        Some(Address::new(object))
    }

    /// Give up the rest of the buffer; returns the unused bytes
    pub fn retire(&mut self) -> usize {
        let waste = self.end - self.current;
        *self = Self::empty();
        waste
    }

    /// Whether the buffer holds no space
    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    /// Bytes left
    pub fn remaining(&self) -> usize {
        self.end - self.current
    }

    /// Full capacity
    pub fn capacity(&self) -> usize {
        self.end - self.start
    }

    /// Epoch objects allocated from this buffer are marked with
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Start, current and end
    pub fn bounds(&self) -> (usize, usize, usize) {
        (self.start, self.current, self.end)
    }

    fn reset(&mut self, start: usize, len: usize, epoch: u64) {
        self.start = start;
        self.current = start;
        self.end = start + len;
        self.epoch = epoch;
    }
}

/// Write a fresh header in front of `object`, optionally zeroing the payload.
///
/// # Safety
///
/// `object - HEADER_SIZE .. object + payload` must be memory this thread
/// just allocated and nobody else can see yet.
#[inline]
pub(crate) unsafe fn initialize_object(
    object: Address,
    payload: usize,
    layout: LayoutId,
    age: u8,
    epoch: u64,
    zero: bool,
) {
    // SAFETY: guaranteed by the caller; payload fits u32 (checked by callers)
    unsafe {
        std::ptr::write(
            object.header_address() as *mut ObjectHeader,
            ObjectHeader::new(payload as u32, layout, age, epoch),
        );
        if zero {
            std::ptr::write_bytes(object.as_ptr::<u8>(), 0, payload);
        }
    }
}

/// The region currently being filled, per generation
struct CurrentRegions {
    slots: [Mutex<Option<Arc<Region>>>; 2],
    size_class: SizeClass,
}

impl CurrentRegions {
    fn new(size_class: SizeClass) -> Self {
        Self {
            slots: [Mutex::new(None), Mutex::new(None)],
            size_class,
        }
    }

    /// Run `attempt` against the current region, replacing it once if full
    fn allocate<T>(
        &self,
        heap: &Heap,
        generation: Generation,
        attempt: impl Fn(&Region) -> Option<T>,
    ) -> GcResult<T> {
        let slot = &self.slots[generation as usize];
        let seen = slot.lock().clone();
        if let Some(value) = seen.as_deref().and_then(&attempt) {
            return Ok(value);
        }

        let mut guard = slot.lock();
        if let Some(current) = guard.as_ref() {
            let replaced = seen.as_ref().is_none_or(|s| !Arc::ptr_eq(s, current));
            if replaced {
                if let Some(value) = attempt(current) {
                    return Ok(value);
                }
            }
        }

        let region = heap.allocate_region(generation, self.size_class, 0)?;
        let value = attempt(&region).ok_or_else(|| {
            GcError::corruption(format!("fresh region {} cannot satisfy request", region.id()))
        })?;
        *guard = Some(region);
        Ok(value)
    }

    fn clear(&self) {
        for slot in &self.slots {
            *slot.lock() = None;
        }
    }
}

/// Shared allocation state of a heap
pub struct SharedAllocator {
    tlab_source: CurrentRegions,
    small: CurrentRegions,
    medium: CurrentRegions,
    to_small: CurrentRegions,
    to_medium: CurrentRegions,
}

impl Default for SharedAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedAllocator {
    /// Allocator with no current regions
    pub fn new() -> Self {
        Self {
            tlab_source: CurrentRegions::new(SizeClass::Small),
            small: CurrentRegions::new(SizeClass::Small),
            medium: CurrentRegions::new(SizeClass::Medium),
            to_small: CurrentRegions::new(SizeClass::Small),
            to_medium: CurrentRegions::new(SizeClass::Medium),
        }
    }

    /// Point `tlab` at a fresh `size`-byte chunk (or the rest of a region
    /// if at least `min_size` is left) and zero it
    pub fn refill_tlab(
        &self,
        heap: &Heap,
        tlab: &mut Tlab,
        generation: Generation,
        size: usize,
        min_size: usize,
        epoch: u64,
    ) -> GcResult<()> {
        tlab.retire();
        let (start, len) = self.tlab_source.allocate(heap, generation, |region| {
            if let Some(start) = region.carve(size) {
                return Some((start, size));
            }
            let rest = region.free_bytes() & !(OBJECT_ALIGNMENT - 1);
            if rest >= min_size {
                region.carve(rest).map(|start| (start, rest))
            } else {
                None
            }
        })?;
        // SAFETY: the chunk was just carved for this thread alone
        unsafe { std::ptr::write_bytes(start as *mut u8, 0, len) };
        tlab.reset(start, len, epoch);
        Ok(())
    }

    /// Bump-allocate one object in a shared region of `size_class`; the
    /// header is left to the caller
    pub fn allocate_shared(
        &self,
        heap: &Heap,
        generation: Generation,
        size_class: SizeClass,
        payload: usize,
        align: usize,
    ) -> GcResult<Address> {
        let regions = match size_class {
            SizeClass::Small => &self.small,
            SizeClass::Medium => &self.medium,
            SizeClass::Large => return self.allocate_large(heap, generation, payload, align),
        };
        regions.allocate(heap, generation, |region| region.bump(payload, align))
    }

    /// Give one object a region of its own
    pub fn allocate_large(
        &self,
        heap: &Heap,
        generation: Generation,
        payload: usize,
        align: usize,
    ) -> GcResult<Address> {
        let region = heap.allocate_region(
            generation,
            SizeClass::Large,
            HEADER_SIZE + payload + align,
        )?;
        region.bump(payload, align).ok_or_else(|| {
            GcError::corruption(format!("large region {} too small", region.id()))
        })
    }

    /// Room for a relocated object of `payload` bytes
    pub fn allocate_relocation(
        &self,
        heap: &Heap,
        generation: Generation,
        payload: usize,
    ) -> GcResult<Address> {
        let regions = if HEADER_SIZE + payload <= heap.config().small_threshold {
            &self.to_small
        } else {
            &self.to_medium
        };
        regions.allocate(heap, generation, |region| {
            region.bump(payload, OBJECT_ALIGNMENT)
        })
    }

    /// Forget all current regions; called once they have been sealed
    pub fn reset(&self) {
        for regions in [
            &self.tlab_source,
            &self.small,
            &self.medium,
            &self.to_small,
            &self.to_medium,
        ] {
            regions.clear();
        }
    }
}
