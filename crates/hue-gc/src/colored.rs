//! Colored pointers
//!
//! Heap references carry collector metadata in bits 44..48 of the word:
//!
//! ```text
//!  63        48 47  46  45  44 43                      0
//! +-----------+---+---+---+---+-------------------------+
//! |   zero    | F | R | M1| M0|         address         |
//! +-----------+---+---+---+---+-------------------------+
//! ```
//!
//! `M0`/`M1` alternate between cycles so marks never need clearing, `R`
//! (remapped) means the address is known to be current, and `F` flags a
//! reference held on behalf of a finalizer. The heap is reserved below
//! [`ADDRESS_SPACE`] so masking the color always yields the real address.
//!
//! This is the only module that manipulates the raw bit patterns.

use crate::object::Address;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of address bits
pub const ADDRESS_BITS: u32 = 44;
/// Size of the addressable range
pub const ADDRESS_SPACE: usize = 1 << ADDRESS_BITS;
/// Mask selecting the address part
pub const ADDRESS_MASK: usize = ADDRESS_SPACE - 1;
/// Mark bit used by even epochs
pub const MARKED0: usize = 1 << 44;
/// Mark bit used by odd epochs
pub const MARKED1: usize = 1 << 45;
/// Address known to be current
pub const REMAPPED: usize = 1 << 46;
/// Reference held for a finalizer
pub const FINALIZABLE: usize = 1 << 47;
/// All color bits
pub const COLOR_MASK: usize = MARKED0 | MARKED1 | REMAPPED | FINALIZABLE;
/// The bits that decide whether a pointer needs the barrier slow path
pub const VIEW_MASK: usize = MARKED0 | MARKED1 | REMAPPED;

/// A heap reference with color bits
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ColoredPointer(usize);

impl ColoredPointer {
    /// The null reference
    pub const NULL: Self = Self(0);

    /// Reinterpret a raw word
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw word, color included
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Combine an address with color bits; bits outside [`COLOR_MASK`] are ignored
    #[inline]
    pub fn encode(address: Address, color: usize) -> Self {
        debug_assert!(address.as_usize() <= ADDRESS_MASK);
        Self((address.as_usize() & ADDRESS_MASK) | (color & COLOR_MASK))
    }

    /// Split into address and color bits
    #[inline]
    pub fn decode(self) -> (Address, usize) {
        (self.address(), self.color())
    }

    /// Address with the color masked off
    #[inline]
    pub fn address(self) -> Address {
        Address::new(self.0 & ADDRESS_MASK)
    }

    /// Color bits
    #[inline]
    pub fn color(self) -> usize {
        self.0 & COLOR_MASK
    }

    /// Color bits that matter for the barrier
    #[inline]
    pub fn view(self) -> usize {
        self.0 & VIEW_MASK
    }

    /// Whether the address part is zero
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 & ADDRESS_MASK == 0
    }

    /// Carries `M0`
    #[inline]
    pub fn is_marked0(self) -> bool {
        self.0 & MARKED0 != 0
    }

    /// Carries `M1`
    #[inline]
    pub fn is_marked1(self) -> bool {
        self.0 & MARKED1 != 0
    }

    /// Carries `R`
    #[inline]
    pub fn is_remapped(self) -> bool {
        self.0 & REMAPPED != 0
    }

    /// Carries `F`
    #[inline]
    pub fn is_finalizable(self) -> bool {
        self.0 & FINALIZABLE != 0
    }

    /// Replace the view bits, keeping address and finalizable bit
    #[inline]
    pub fn with_view(self, view: usize) -> Self {
        Self((self.0 & !VIEW_MASK) | (view & VIEW_MASK))
    }

    /// Replace the address, keeping the color
    #[inline]
    pub fn with_address(self, address: Address) -> Self {
        Self::encode(address, self.color())
    }

    /// View `M0`
    pub fn set_marked0(self) -> Self {
        self.with_view(MARKED0)
    }

    /// View `M1`
    pub fn set_marked1(self) -> Self {
        self.with_view(MARKED1)
    }

    /// View `R`
    pub fn set_remapped(self) -> Self {
        self.with_view(REMAPPED)
    }

    /// Add `F`
    pub fn set_finalizable(self) -> Self {
        Self(self.0 | FINALIZABLE)
    }

    /// Swap `M0` and `M1`; pointers carrying neither are returned unchanged
    pub fn flip_mark_bit(self) -> Self {
        match self.0 & (MARKED0 | MARKED1) {
            MARKED0 => Self((self.0 & !MARKED0) | MARKED1),
            MARKED1 => Self((self.0 & !MARKED1) | MARKED0),
            _ => self,
        }
    }

    /// Parity of the epoch whose marking produced this pointer, if it
    /// carries a mark bit and is not remapped
    pub fn mark_parity(self) -> Option<u64> {
        if self.is_remapped() {
            return None;
        }
        match self.0 & (MARKED0 | MARKED1) {
            MARKED0 => Some(0),
            MARKED1 => Some(1),
            _ => None,
        }
    }

    /// Load from a heap slot
    #[inline]
    pub fn load(slot: &AtomicUsize) -> Self {
        Self(slot.load(Ordering::Acquire))
    }

    /// Publish into a heap slot
    #[inline]
    pub fn store(self, slot: &AtomicUsize) {
        slot.store(self.0, Ordering::Release);
    }

    /// Publish and return the previous value
    #[inline]
    pub fn swap(self, slot: &AtomicUsize) -> Self {
        Self(slot.swap(self.0, Ordering::AcqRel))
    }

    /// Install `new` if the slot still holds `current`; returns the observed value on failure
    #[inline]
    pub fn compare_exchange(slot: &AtomicUsize, current: Self, new: Self) -> Result<Self, Self> {
        slot.compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
            .map(Self)
            .map_err(Self)
    }

    /// Apply `f` to the slot with a CAS loop; returns the installed value
    pub fn update(slot: &AtomicUsize, f: impl Fn(Self) -> Self) -> Self {
        let mut current = Self::load(slot);
        loop {
            let new = f(current);
            match Self::compare_exchange(slot, current, new) {
                Ok(_) => return new,
                Err(actual) => current = actual,
            }
        }
    }

    /// [`set_marked0`](Self::set_marked0) applied in place
    pub fn set_marked0_atomic(slot: &AtomicUsize) -> Self {
        Self::update(slot, Self::set_marked0)
    }

    /// [`set_marked1`](Self::set_marked1) applied in place
    pub fn set_marked1_atomic(slot: &AtomicUsize) -> Self {
        Self::update(slot, Self::set_marked1)
    }

    /// [`set_remapped`](Self::set_remapped) applied in place
    pub fn set_remapped_atomic(slot: &AtomicUsize) -> Self {
        Self::update(slot, Self::set_remapped)
    }

    /// [`set_finalizable`](Self::set_finalizable) applied in place
    pub fn set_finalizable_atomic(slot: &AtomicUsize) -> Self {
        Self::update(slot, Self::set_finalizable)
    }

    /// [`flip_mark_bit`](Self::flip_mark_bit) applied in place
    pub fn flip_mark_bit_atomic(slot: &AtomicUsize) -> Self {
        Self::update(slot, Self::flip_mark_bit)
    }
}

impl fmt::Debug for ColoredPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut colors = String::new();
        for (bit, name) in [
            (MARKED0, "M0"),
            (MARKED1, "M1"),
            (REMAPPED, "R"),
            (FINALIZABLE, "F"),
        ] {
            if self.0 & bit != 0 {
                if !colors.is_empty() {
                    colors.push('|');
                }
                colors.push_str(name);
            }
        }
        write!(f, "ColoredPointer({:#x} [{}])", self.0 & ADDRESS_MASK, colors)
    }
}

/// Mark bit for an epoch
#[inline]
pub fn mark_bit(epoch: u64) -> usize {
    if epoch % 2 == 0 { MARKED0 } else { MARKED1 }
}
