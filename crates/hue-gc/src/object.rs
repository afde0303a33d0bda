//! Object layout
//!
//! Every object is preceded by a 16-byte [`ObjectHeader`]. Addresses handed
//! to callers point at the payload, right after the header. The collector
//! knows nothing else about an object: where its references are is answered
//! by the [`PointerMap`] registered for its [`LayoutId`].

use crate::error::{GcError, GcResult};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Size of [`ObjectHeader`]
pub const HEADER_SIZE: usize = std::mem::size_of::<ObjectHeader>();
/// Minimum alignment of every payload
pub const OBJECT_ALIGNMENT: usize = 8;

const MARK_MASK: u64 = u32::MAX as u64;
const CLAIM_BIT: u64 = 1 << 63;

/// Round `value` up to a multiple of `align` (a power of two)
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Payload address of a heap object, without color bits
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    /// The null address
    pub const NULL: Self = Self(0);

    /// Wrap a raw address
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw address
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Whether this is the null address
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` further on
    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Raw pointer to the payload
    #[inline]
    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Address of the header preceding the payload
    #[inline]
    pub(crate) fn header_address(self) -> usize {
        self.0 - HEADER_SIZE
    }

    /// # Safety
    ///
    /// `self` must be the payload address of an initialized object whose
    /// memory stays mapped for `'a`.
    #[inline]
    pub(crate) unsafe fn header<'a>(self) -> &'a ObjectHeader {
        // SAFETY: guaranteed by the caller; headers are 8-byte aligned
        unsafe { &*(self.header_address() as *const ObjectHeader) }
    }

    /// # Safety
    ///
    /// `self + offset` must be an 8-byte aligned word inside a live object.
    #[inline]
    pub(crate) unsafe fn slot<'a>(self, offset: usize) -> &'a AtomicUsize {
        // SAFETY: guaranteed by the caller
        unsafe { &*((self.0 + offset) as *const AtomicUsize) }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Header preceding every object payload
///
/// The plain fields are written once, before the object is published, and
/// only read afterwards. `state` carries the mark epoch (low 32 bits) and the
/// relocation claim (bit 63).
#[repr(C)]
pub struct ObjectHeader {
    /// Payload size in bytes
    size: u32,
    /// Pointer map index
    layout: u16,
    /// Survived cycles
    age: u8,
    _reserved: u8,
    state: AtomicU64,
}

impl ObjectHeader {
    /// Header for a fresh object that counts as marked in `epoch`
    pub fn new(size: u32, layout: LayoutId, age: u8, epoch: u64) -> Self {
        Self {
            size,
            layout: layout.0,
            age,
            _reserved: 0,
            state: AtomicU64::new(epoch & MARK_MASK),
        }
    }

    /// Payload size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Header plus payload
    #[inline]
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.size as usize
    }

    /// Pointer map index
    #[inline]
    pub fn layout(&self) -> LayoutId {
        LayoutId(self.layout)
    }

    /// Survived cycles
    #[inline]
    pub fn age(&self) -> u8 {
        self.age
    }

    /// Whether the object was marked during `epoch`
    #[inline]
    pub fn is_marked(&self, epoch: u64) -> bool {
        self.state.load(Ordering::Acquire) & MARK_MASK == epoch & MARK_MASK
    }

    /// Mark for `epoch`; true only for the one caller that made the transition
    pub fn try_mark(&self, epoch: u64) -> bool {
        let epoch = epoch & MARK_MASK;
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & MARK_MASK == epoch {
                return false;
            }
            let new = (current & !MARK_MASK) | epoch;
            match self
                .state
                .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Claim the object for relocation; true only for the winner
    pub fn try_claim(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & CLAIM_BIT != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                current | CLAIM_BIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether a relocator currently owns or has copied the object
    #[inline]
    pub fn is_claimed(&self) -> bool {
        self.state.load(Ordering::Acquire) & CLAIM_BIT != 0
    }

    /// Give up a claim after a failed copy
    pub fn release_claim(&self) {
        self.state.fetch_and(!CLAIM_BIT, Ordering::AcqRel);
    }
}

impl fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("ObjectHeader")
            .field("size", &self.size)
            .field("layout", &self.layout)
            .field("age", &self.age)
            .field("mark_epoch", &(state & MARK_MASK))
            .field("claimed", &(state & CLAIM_BIT != 0))
            .finish()
    }
}

/// Index of a registered [`PointerMap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayoutId(u16);

impl LayoutId {
    /// Objects without references
    pub const LEAF: Self = Self(0);

    /// Raw index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Enumerates the reference slots of objects with one layout
///
/// Offsets are byte offsets from the payload start; each must be 8-byte
/// aligned and leave room for a full word inside `size`. The marker checks
/// every offset before touching the slot: a bad one, or a panic in
/// `for_each_offset`, fails the cycle instead.
pub trait PointerMap: Send + Sync {
    /// Call `visitor` with the offset of every reference slot in an object of `size` bytes
    fn for_each_offset(&self, size: usize, visitor: &mut dyn FnMut(usize));
}

/// Layout with no references
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPointers;

impl PointerMap for NoPointers {
    fn for_each_offset(&self, _size: usize, _visitor: &mut dyn FnMut(usize)) {}
}

/// References at a fixed set of offsets
#[derive(Debug, Clone)]
pub struct FixedSlots(pub Vec<usize>);

impl PointerMap for FixedSlots {
    fn for_each_offset(&self, size: usize, visitor: &mut dyn FnMut(usize)) {
        for &offset in &self.0 {
            if offset + OBJECT_ALIGNMENT <= size {
                visitor(offset);
            }
        }
    }
}

/// Every word is a reference (arrays of references)
#[derive(Debug, Default, Clone, Copy)]
pub struct AllSlots;

impl PointerMap for AllSlots {
    fn for_each_offset(&self, size: usize, visitor: &mut dyn FnMut(usize)) {
        for offset in (0..size / OBJECT_ALIGNMENT).map(|i| i * OBJECT_ALIGNMENT) {
            visitor(offset);
        }
    }
}

/// Registered pointer maps; [`LayoutId::LEAF`] is always present
pub struct LayoutRegistry {
    maps: RwLock<Vec<Arc<dyn PointerMap>>>,
}

impl Default for LayoutRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LayoutRegistry {
    /// Registry holding only the leaf layout
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(vec![Arc::new(NoPointers) as Arc<dyn PointerMap>]),
        }
    }

    /// Register a pointer map
    pub fn register(&self, map: Arc<dyn PointerMap>) -> GcResult<LayoutId> {
        let mut maps = self.maps.write();
        let id = u16::try_from(maps.len()).map_err(|_| {
            GcError::Configuration(format!("more than {} layouts registered", u16::MAX))
        })?;
        maps.push(map);
        Ok(LayoutId(id))
    }

    /// Whether `id` has been handed out
    pub fn contains(&self, id: LayoutId) -> bool {
        id.index() < self.maps.read().len()
    }

    /// Look up a pointer map
    pub fn get(&self, id: LayoutId) -> Option<Arc<dyn PointerMap>> {
        self.maps.read().get(id.index()).cloned()
    }

    /// Copy of the current table, used for a whole marking pass
    pub fn snapshot(&self) -> LayoutTable {
        LayoutTable(self.maps.read().clone())
    }
}

/// Frozen copy of a [`LayoutRegistry`]
#[derive(Clone)]
pub struct LayoutTable(Vec<Arc<dyn PointerMap>>);

impl LayoutTable {
    /// Look up a pointer map
    pub fn get(&self, id: LayoutId) -> Option<&dyn PointerMap> {
        self.0.get(id.index()).map(|map| map.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(std::mem::align_of::<ObjectHeader>(), 8);
    }

    #[test]
    fn test_header_marking() {
        let header = ObjectHeader::new(64, LayoutId::LEAF, 0, 3);
        assert!(header.is_marked(3));
        assert!(!header.is_marked(4));

        assert!(header.try_mark(4));
        assert!(!header.try_mark(4));
        assert!(header.is_marked(4));
        assert_eq!(header.size(), 64);
        assert_eq!(header.total_size(), 80);
    }

    #[test]
    fn test_claim_is_independent_of_mark() {
        let header = ObjectHeader::new(8, LayoutId::LEAF, 2, 1);
        assert!(header.try_claim());
        assert!(!header.try_claim());
        assert!(header.is_claimed());
        assert!(header.is_marked(1));

        assert!(header.try_mark(2));
        assert!(header.is_claimed());

        header.release_claim();
        assert!(!header.is_claimed());
        assert!(header.is_marked(2));
    }

    #[test]
    fn test_one_marker_wins() {
        let header = Arc::new(ObjectHeader::new(8, LayoutId::LEAF, 0, 0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let header = header.clone();
                std::thread::spawn(move || header.try_mark(1) as usize)
            })
            .collect();
        let winners: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_pointer_maps() {
        let mut seen = Vec::new();
        FixedSlots(vec![0, 16, 64]).for_each_offset(32, &mut |off| seen.push(off));
        assert_eq!(seen, vec![0, 16]);

        seen.clear();
        AllSlots.for_each_offset(24, &mut |off| seen.push(off));
        assert_eq!(seen, vec![0, 8, 16]);

        seen.clear();
        NoPointers.for_each_offset(24, &mut |off| seen.push(off));
        assert!(seen.is_empty());
    }

    #[test]
    fn test_layout_registry() {
        let registry = LayoutRegistry::new();
        assert!(registry.contains(LayoutId::LEAF));
        let id = registry.register(Arc::new(AllSlots)).unwrap();
        assert_eq!(id.index(), 1);
        assert!(registry.contains(id));

        let table = registry.snapshot();
        assert!(table.get(id).is_some());
        assert!(table.get(LayoutId(7)).is_none());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(17, 16), 32);
    }
}
