//! GC Heap management
//!
//! The heap reserves `max_heap_size` bytes of address space up front and
//! hands it out as regions. Small regions define the granule of the region
//! table, so finding the region of an address is one index computation.

use crate::config::GcConfig;
use crate::error::{GcError, GcResult, InternalError};
use crate::memory::VirtualRange;
use crate::numa::NumaTopology;
use crate::region::{Generation, Region, RegionId, RegionState, SizeClass};
use crate::object::align_up;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Heap occupancy by generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapOccupancy {
    /// Reserved size
    pub max_bytes: usize,
    /// Bytes in live regions
    pub committed_bytes: usize,
    /// Bytes handed out from live regions
    pub used_bytes: usize,
    /// Bytes handed out from young regions
    pub young_used_bytes: usize,
    /// Bytes handed out from old regions
    pub old_used_bytes: usize,
    /// Live young regions
    pub young_regions: usize,
    /// Live old regions
    pub old_regions: usize,
}

struct RegionTable {
    by_granule: Vec<Option<Arc<Region>>>,
    by_id: FxHashMap<RegionId, Arc<Region>>,
}

/// Free parts of the reserved range, keyed by offset from the base
#[derive(Debug, Default)]
struct FreeExtents {
    extents: BTreeMap<usize, usize>,
}

impl FreeExtents {
    fn take(&mut self, size: usize) -> Option<usize> {
        let (&offset, &len) = self.extents.iter().find(|&(_, &len)| len >= size)?;
        self.extents.remove(&offset);
        if len > size {
            self.extents.insert(offset + size, len - size);
        }
        Some(offset)
    }

    fn give_back(&mut self, mut offset: usize, mut len: usize) {
        if let Some((&prev, &prev_len)) = self.extents.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.extents.remove(&prev);
                offset = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.extents.remove(&(offset + len)) {
            len += next_len;
        }
        self.extents.insert(offset, len);
    }

    fn largest(&self) -> usize {
        self.extents.values().copied().max().unwrap_or(0)
    }
}

/// Main GC heap - shared between threads
pub struct Heap {
    config: GcConfig,
    memory: VirtualRange,
    granule: usize,
    table: RwLock<RegionTable>,
    free: Mutex<FreeExtents>,
    committed: AtomicUsize,
    young_committed: AtomicUsize,
    next_id: AtomicU32,
    numa: NumaTopology,
}

impl Heap {
    /// Reserve the address range described by `config`
    pub fn reserve(config: &GcConfig) -> GcResult<Self> {
        config.validate()?;
        let memory = VirtualRange::reserve(config.max_heap_size)?;
        let granule = config.small_region_size;
        let granules = config.max_heap_size / granule;

        let mut free = FreeExtents::default();
        free.give_back(0, config.max_heap_size);

        tracing::debug!(
            target: "hue::gc",
            base = %format!("{:#x}", memory.base()),
            max_heap_size = config.max_heap_size,
            granule,
            "heap reserved"
        );

        Ok(Self {
            config: config.clone(),
            memory,
            granule,
            table: RwLock::new(RegionTable {
                by_granule: vec![None; granules],
                by_id: FxHashMap::default(),
            }),
            free: Mutex::new(free),
            committed: AtomicUsize::new(0),
            young_committed: AtomicUsize::new(0),
            next_id: AtomicU32::new(1),
            numa: NumaTopology::detect(config.numa_aware),
        })
    }

    /// Get config
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// First address of the reserved range
    pub fn base(&self) -> usize {
        self.memory.base()
    }

    /// Size of the reserved range
    pub fn max_size(&self) -> usize {
        self.memory.size()
    }

    /// Whether `addr` lies in the reserved range
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.memory.contains(addr)
    }

    /// Bytes in live regions
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    /// Bytes in live young regions
    pub fn young_committed(&self) -> usize {
        self.young_committed.load(Ordering::Acquire)
    }

    /// Bytes that may still be committed
    pub fn available(&self) -> usize {
        self.max_size().saturating_sub(self.committed())
    }

    /// Region size used for a size class
    pub fn region_size(&self, size_class: SizeClass, min_size: usize) -> usize {
        match size_class {
            SizeClass::Small => self.config.small_region_size,
            SizeClass::Medium => self.config.medium_region_size,
            SizeClass::Large => align_up(min_size.max(1), self.granule),
        }
    }

    /// Commit a new region.
    ///
    /// Fails with `OutOfMemory` when the committed size would pass
    /// `max_heap_size` and with `OutOfRegions` when no free extent fits.
    pub fn allocate_region(
        &self,
        generation: Generation,
        size_class: SizeClass,
        min_size: usize,
    ) -> GcResult<Arc<Region>> {
        let size = self.region_size(size_class, min_size);
        let max = self.max_size();

        self.committed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |committed| {
                (committed + size <= max).then_some(committed + size)
            })
            .map_err(|committed| GcError::OutOfMemory {
                requested: size,
                available: max.saturating_sub(committed),
            })?;

        let Some(offset) = self.free.lock().take(size) else {
            self.committed.fetch_sub(size, Ordering::AcqRel);
            return Err(GcError::OutOfRegions { requested: size });
        };

        let id = RegionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let start = self.base() + offset;
        let region = Arc::new(Region::new(
            id,
            start,
            size,
            size_class,
            generation,
            self.numa.next_node(),
        ));

        {
            let mut table = self.table.write();
            let first = offset / self.granule;
            for slot in &mut table.by_granule[first..first + size / self.granule] {
                *slot = Some(region.clone());
            }
            table.by_id.insert(id, region.clone());
        }
        if generation == Generation::Young {
            self.young_committed.fetch_add(size, Ordering::AcqRel);
        }

        tracing::trace!(
            target: "hue::gc",
            region = %id,
            ?size_class,
            ?generation,
            start = %format!("{start:#x}"),
            size,
            "region allocated"
        );
        Ok(region)
    }

    /// Return a region to the free pool.
    ///
    /// The region must hold no live objects. Retiring a region twice is an
    /// internal error.
    pub fn retire_region(&self, region: &Arc<Region>) -> GcResult<()> {
        let mut state = region.state();
        loop {
            if state == RegionState::Retired {
                let err = InternalError::RegionDoubleRetire { id: region.id().0 };
                tracing::error!(target: "hue::gc", region = %region.id(), "{err}");
                return Err(err.into());
            }
            if region.transition(state, RegionState::Retired) {
                break;
            }
            state = region.state();
        }

        {
            let mut table = self.table.write();
            let first = (region.start() - self.base()) / self.granule;
            for slot in &mut table.by_granule[first..first + region.size() / self.granule] {
                if slot.as_ref().is_some_and(|r| Arc::ptr_eq(r, region)) {
                    *slot = None;
                }
            }
            table.by_id.remove(&region.id());
        }

        if region.generation() == Generation::Young {
            self.young_committed
                .fetch_sub(region.size(), Ordering::AcqRel);
        }
        let committed = self.committed.fetch_sub(region.size(), Ordering::AcqRel) - region.size();
        if committed >= self.config.min_heap_size {
            self.memory.decommit(region.start(), region.size());
        }
        self.free
            .lock()
            .give_back(region.start() - self.base(), region.size());

        tracing::trace!(
            target: "hue::gc",
            region = %region.id(),
            size = region.size(),
            committed,
            "region retired"
        );
        Ok(())
    }

    /// Region containing `addr`
    pub fn region_for(&self, addr: usize) -> Option<Arc<Region>> {
        if !self.contains(addr) {
            return None;
        }
        let index = (addr - self.base()) / self.granule;
        self.table
            .read()
            .by_granule
            .get(index)
            .and_then(|slot| slot.clone())
            .filter(|region| region.contains(addr))
    }

    /// Region by id
    pub fn region(&self, id: RegionId) -> Option<Arc<Region>> {
        self.table.read().by_id.get(&id).cloned()
    }

    /// All live regions, ordered by address
    pub fn regions(&self) -> Vec<Arc<Region>> {
        let mut regions: Vec<_> = self.table.read().by_id.values().cloned().collect();
        regions.sort_by_key(|r| r.start());
        regions
    }

    /// Close every allocating region; returns how many were sealed
    pub fn seal_all(&self) -> usize {
        self.table
            .read()
            .by_id
            .values()
            .filter(|r| r.transition(RegionState::Allocating, RegionState::Sealed))
            .count()
    }

    /// Bytes handed out from live regions
    pub fn used(&self) -> usize {
        self.table
            .read()
            .by_id
            .values()
            .map(|r| r.used_bytes())
            .sum()
    }

    /// Largest free extent
    pub fn largest_free_extent(&self) -> usize {
        self.free.lock().largest()
    }

    /// Occupancy by generation
    pub fn occupancy(&self) -> HeapOccupancy {
        let table = self.table.read();
        let mut occupancy = HeapOccupancy {
            max_bytes: self.max_size(),
            committed_bytes: self.committed(),
            ..HeapOccupancy::default()
        };
        for region in table.by_id.values() {
            let used = region.used_bytes();
            occupancy.used_bytes += used;
            match region.generation() {
                Generation::Young => {
                    occupancy.young_used_bytes += used;
                    occupancy.young_regions += 1;
                }
                Generation::Old => {
                    occupancy.old_used_bytes += used;
                    occupancy.old_regions += 1;
                }
            }
        }
        occupancy
    }
}
