//! Weak references
//!
//! A weak reference is a slot owned by the collector that is not a root:
//! marking never follows it. When a marking finishes without reaching the
//! referent, the slot is cleared at the mark-end safepoint, before the
//! referent's region can be reclaimed. Surviving referents are healed like
//! any other slot.
//!
//! Loading a weak reference while marking is in progress hands the referent
//! to the marker, so an object the mutator just got hold of is not cleared
//! at the end of that same marking.

use crate::barrier;
use crate::collector::Shared;
use crate::error::{GcError, GcResult};
use crate::object::Address;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Handle to a weak reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WeakRef(pub u64);

/// Registered weak references
#[derive(Default)]
pub struct WeakRegistry {
    slots: Mutex<FxHashMap<u64, AtomicUsize>>,
    next_id: AtomicU64,
}

impl WeakRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// New weak reference holding `raw`, a colored pointer
    pub(crate) fn create(&self, raw: usize) -> WeakRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.slots.lock().insert(id, AtomicUsize::new(raw));
        WeakRef(id)
    }

    /// Forget a weak reference
    pub(crate) fn remove(&self, weak: WeakRef) -> GcResult<()> {
        self.slots
            .lock()
            .remove(&weak.0)
            .map(|_| ())
            .ok_or(GcError::UnknownWeakRef(weak.0))
    }

    /// Current referent, `None` once cleared
    pub(crate) fn load(&self, shared: &Shared, weak: WeakRef) -> GcResult<Option<Address>> {
        let slots = self.slots.lock();
        let slot = slots.get(&weak.0).ok_or(GcError::UnknownWeakRef(weak.0))?;
        let ptr = barrier::heal(shared, slot)?;
        if ptr.is_null() {
            return Ok(None);
        }
        shared.marker.enqueue(ptr.address());
        Ok(Some(ptr.address()))
    }

    /// Whether the referent has been collected
    pub(crate) fn is_cleared(&self, weak: WeakRef) -> GcResult<bool> {
        let slots = self.slots.lock();
        let slot = slots.get(&weak.0).ok_or(GcError::UnknownWeakRef(weak.0))?;
        Ok(slot.load(Ordering::Acquire) == 0)
    }

    /// Weak references registered, cleared ones included
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no weak reference is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Heal every slot at the relocation safepoint
    pub(crate) fn heal_all(&self, shared: &Shared) -> GcResult<()> {
        for slot in self.slots.lock().values() {
            barrier::heal(shared, slot)?;
        }
        Ok(())
    }

    /// Clear every slot whose referent was not marked in `epoch`. Runs at
    /// the mark-end safepoint.
    pub(crate) fn clear_unreachable(&self, shared: &Shared, epoch: u64) -> GcResult<usize> {
        let slots = self.slots.lock();
        let mut cleared = 0;
        for slot in slots.values() {
            let ptr = barrier::heal(shared, slot)?;
            if ptr.is_null() {
                continue;
            }
            // SAFETY: healed to the referent's current location; unmarked
            // objects keep their memory until this safepoint ends
            if !unsafe { ptr.address().header() }.is_marked(epoch) {
                slot.store(0, Ordering::Release);
                cleared += 1;
            }
        }
        if cleared > 0 {
            tracing::debug!(target: "hue::gc", epoch, cleared, "weak references cleared");
        }
        Ok(cleared)
    }
}

impl std::fmt::Debug for WeakRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakRegistry")
            .field("registered", &self.len())
            .finish()
    }
}
