//! Finalizers
//!
//! A finalizer is a closure attached to an object. The registry keeps a
//! weak, `Finalizable`-colored pointer to the object: it does not keep the
//! object alive, and is healed like any other slot. When a marking finishes
//! without reaching the object, the entry is dropped and its closure runs
//! after the cycle, on the driver thread. The object itself is gone by then.

use crate::barrier;
use crate::collector::Shared;
use crate::error::GcResult;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::AtomicUsize;

/// Closure run once its object is found unreachable
pub type Finalizer = Box<dyn FnOnce() + Send>;

struct FinalizerEntry {
    slot: AtomicUsize,
    finalizer: Finalizer,
}

/// Registered finalizers
#[derive(Default)]
pub struct FinalizerRegistry {
    entries: Mutex<Vec<FinalizerEntry>>,
    pending: Mutex<Vec<Finalizer>>,
}

impl FinalizerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `finalizer` to the object `raw` points to (a colored pointer
    /// carrying the `Finalizable` bit)
    pub(crate) fn register(&self, raw: usize, finalizer: Finalizer) {
        self.entries.lock().push(FinalizerEntry {
            slot: AtomicUsize::new(raw),
            finalizer,
        });
    }

    /// Registered finalizers whose objects are still alive
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no finalizer is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finalizers waiting to run
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Heal every entry; at the relocation safepoint this moves the objects
    /// out of the relocation set before their slots are read again
    pub(crate) fn heal_all(&self, shared: &Shared) -> GcResult<()> {
        for entry in self.entries.lock().iter() {
            barrier::heal(shared, &entry.slot)?;
        }
        Ok(())
    }

    /// Move the finalizers of objects not marked in `epoch` to the pending
    /// list. Runs at the end of marking, before any slot is healed against a
    /// newer forwarding table.
    pub(crate) fn collect_unreachable(&self, shared: &Shared, epoch: u64) -> GcResult<usize> {
        let mut entries = self.entries.lock();
        let mut dead = Vec::new();
        let mut index = 0;
        while index < entries.len() {
            let ptr = barrier::heal(shared, &entries[index].slot)?;
            // SAFETY: the slot was just healed, so it points at the object's
            // current location; unmarked objects are not reclaimed before
            // this safepoint ends
            let marked = ptr.is_null() || unsafe { ptr.address().header() }.is_marked(epoch);
            if marked {
                index += 1;
            } else {
                dead.push(entries.swap_remove(index).finalizer);
            }
        }
        let found = dead.len();
        if found > 0 {
            tracing::debug!(target: "hue::gc", epoch, finalizers = found, "objects became finalizable");
            self.pending.lock().extend(dead);
        }
        Ok(found)
    }

    /// Run every pending finalizer. A panicking finalizer is logged and
    /// does not stop the others.
    pub(crate) fn run_pending(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        let count = pending.len();
        for finalizer in pending {
            if catch_unwind(AssertUnwindSafe(finalizer)).is_err() {
                tracing::warn!(target: "hue::gc", "finalizer panicked");
            }
        }
        count
    }
}

impl std::fmt::Debug for FinalizerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizerRegistry")
            .field("registered", &self.len())
            .field("pending", &self.pending())
            .finish()
    }
}
