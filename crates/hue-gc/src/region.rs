//! Heap regions
//!
//! A region is a contiguous slice of the reserved range holding objects of
//! one generation and one size class. It is filled by bumping `top` with a
//! CAS (TLAB carving and shared allocation both go through it) and is
//! reclaimed as a whole.
//!
//! Lifecycle:
//!
//! ```text
//! Allocating --(cycle start)--> Sealed --(selected)--> Relocating --(evacuated)--> Retired
//!                                  \___________________(no live objects)_________/
//! ```

use crate::livemap::LiveMap;
use crate::object::{Address, HEADER_SIZE, align_up};
use crate::memory::page_size;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Region identifier, unique for the lifetime of a heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u32);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Size class of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    /// Small objects, carved into TLABs
    Small,
    /// Medium objects, bump-allocated in a shared region
    Medium,
    /// One object per region, never moved
    Large,
}

/// Generation of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Generation {
    /// Newly allocated objects
    Young,
    /// Promoted survivors and large objects
    Old,
}

/// Lifecycle state of a region
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    /// Accepting allocations
    Allocating = 0,
    /// Closed to allocation; candidate for relocation
    Sealed = 1,
    /// Being evacuated
    Relocating = 2,
    /// Returned to the free pool
    Retired = 3,
}

impl From<u8> for RegionState {
    fn from(v: u8) -> Self {
        match v {
            0 => RegionState::Allocating,
            1 => RegionState::Sealed,
            2 => RegionState::Relocating,
            _ => RegionState::Retired,
        }
    }
}

/// A contiguous heap region
pub struct Region {
    id: RegionId,
    start: usize,
    end: usize,
    size_class: SizeClass,
    generation: Generation,
    numa_node: Option<u16>,
    state: AtomicU8,
    top: AtomicUsize,
    live: LiveMap,
}

impl Region {
    pub(crate) fn new(
        id: RegionId,
        start: usize,
        size: usize,
        size_class: SizeClass,
        generation: Generation,
        numa_node: Option<u16>,
    ) -> Self {
        // Large regions hold one object at the start, payload within the first two pages.
        let tracked = match size_class {
            SizeClass::Large => (2 * page_size()).min(size),
            _ => size,
        };
        Self {
            id,
            start,
            end: start + size,
            size_class,
            generation,
            numa_node,
            state: AtomicU8::new(RegionState::Allocating as u8),
            top: AtomicUsize::new(start),
            live: LiveMap::new(tracked),
        }
    }

    /// Region id
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// First byte
    pub fn start(&self) -> usize {
        self.start
    }

    /// One past the last byte
    pub fn end(&self) -> usize {
        self.end
    }

    /// Region size in bytes
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// Size class
    pub fn size_class(&self) -> SizeClass {
        self.size_class
    }

    /// Generation
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// NUMA node hint
    pub fn numa_node(&self) -> Option<u16> {
        self.numa_node
    }

    /// Bytes handed out so far (including TLAB slack)
    pub fn used_bytes(&self) -> usize {
        self.top.load(Ordering::Acquire) - self.start
    }

    /// Bytes still available
    pub fn free_bytes(&self) -> usize {
        self.end - self.top.load(Ordering::Acquire)
    }

    /// Whether `addr` lies inside the region
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Lifecycle state
    #[inline]
    pub fn state(&self) -> RegionState {
        RegionState::from(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; false if the region was not in `from`
    pub(crate) fn transition(&self, from: RegionState, to: RegionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim `[top, top+len)` for a TLAB; returns the start
    pub(crate) fn carve(&self, len: usize) -> Option<usize> {
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            if self.state() != RegionState::Allocating || top + len > self.end {
                return None;
            }
            match self.top.compare_exchange_weak(
                top,
                top + len,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(top),
                Err(actual) => top = actual,
            }
        }
    }

    /// Claim room for one object with a `payload`-byte body aligned to
    /// `align`; returns the payload address
    pub(crate) fn bump(&self, payload: usize, align: usize) -> Option<Address> {
        let mut top = self.top.load(Ordering::Relaxed);
        loop {
            if self.state() != RegionState::Allocating {
                return None;
            }
            let object = align_up(top + HEADER_SIZE, align);
            let new_top = object + payload;
            if new_top > self.end {
                return None;
            }
            match self.top.compare_exchange_weak(
                top,
                new_top,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(Address::new(object)),
                Err(actual) => top = actual,
            }
        }
    }

    /// Live map of the region
    pub fn live_map(&self) -> &LiveMap {
        &self.live
    }

    /// Live bytes found by the marking of `epoch`
    pub fn live_bytes(&self, epoch: u64) -> usize {
        self.live.live_bytes(epoch)
    }

    /// Fraction of the region that was live in `epoch`
    pub fn live_ratio(&self, epoch: u64) -> f64 {
        self.live_bytes(epoch) as f64 / self.size() as f64
    }

    /// Record a marked object
    pub(crate) fn mark_live(&self, object: Address, total: usize, epoch: u64) {
        self.live.mark(object.as_usize() - self.start, total, epoch);
    }

    /// Payload addresses of objects live in `epoch`
    pub fn live_objects(&self, epoch: u64) -> Vec<Address> {
        self.live
            .live_offsets(epoch)
            .into_iter()
            .map(|offset| Address::new(self.start + offset))
            .collect()
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("start", &format_args!("{:#x}", self.start))
            .field("size", &self.size())
            .field("class", &self.size_class)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .field("used", &self.used_bytes())
            .finish()
    }
}
