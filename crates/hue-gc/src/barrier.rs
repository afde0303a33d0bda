//! Load and write barriers
//!
//! Every reference slot read by a mutator, a marker or a relocator goes
//! through [`heal`]. A slot whose pointer already carries the good color of
//! the current phase is returned untouched. Anything else is resolved to the
//! object's current address (through the latest forwarding table, relocating
//! on demand while a relocation is running) and written back with the good
//! color.
//!
//! Which pointers need a forwarding lookup follows from the color:
//!
//! - `Remapped` and uncolored pointers were produced after the last
//!   relocation that could have moved their target;
//! - the mark bit of the last completed marking may be stale, and is looked
//!   up in that marking's forwarding table. A new marking never reuses that
//!   bit (see [`begin_marking`](crate::state::CollectorState::begin_marking)),
//!   so the other bit is always fresh.
//!
//! The write barrier is snapshot-at-the-beginning: while marking, the
//! referent a store overwrites is handed to the marker, so everything
//! reachable when marking started gets marked.

use crate::collector::Shared;
use crate::colored::{ColoredPointer, FINALIZABLE};
use crate::error::{GcError, GcResult};
use crate::object::Address;
use crate::region::RegionState;
use crate::state::{GcPhase, StateSnapshot};
use crossbeam_utils::Backoff;
use std::sync::atomic::AtomicUsize;

/// Contended heal attempts on one slot before giving up
pub const MAX_HEAL_ATTEMPTS: u32 = 1024;

/// Current address of the object `ptr` refers to
pub(crate) fn resolve(
    shared: &Shared,
    ptr: ColoredPointer,
    snapshot: StateSnapshot,
) -> GcResult<Address> {
    let address = ptr.address();
    let Some(parity) = ptr.mark_parity() else {
        return Ok(address);
    };
    let completed = shared.state.last_marked();
    if parity != completed % 2 {
        return Ok(address);
    }
    let Some(table) = shared.relocator.table() else {
        return Ok(address);
    };
    if table.epoch() != completed {
        return Ok(address);
    }
    if let Some(forwarded) = table.get(address) {
        return Ok(forwarded);
    }
    if snapshot.phase.is_relocating() && table.epoch() == snapshot.epoch {
        let evacuating = shared
            .heap
            .region_for(address.as_usize())
            .is_some_and(|region| region.state() == RegionState::Relocating);
        if evacuating {
            shared.stats.barriers().record_relocation();
            return shared.relocator.relocate_object(shared, address);
        }
    }
    Ok(address)
}

/// Load barrier: bring the pointer in `slot` up to date and return it
pub(crate) fn heal(shared: &Shared, slot: &AtomicUsize) -> GcResult<ColoredPointer> {
    let counters = shared.stats.barriers();
    let backoff = Backoff::new();
    let mut attempts = 0;
    loop {
        let ptr = ColoredPointer::load(slot);
        if ptr.is_null() {
            counters.record_null();
            return Ok(ptr);
        }
        let snapshot = shared.state.snapshot();
        let good = snapshot.good_color();
        if ptr.view() == good {
            counters.record_fast_path();
            return Ok(ptr);
        }

        counters.record_slow_path();
        let address = resolve(shared, ptr, snapshot)?;
        let healed = ColoredPointer::encode(address, good | (ptr.color() & FINALIZABLE));
        match ColoredPointer::compare_exchange(slot, ptr, healed) {
            Ok(_) => {
                if address != ptr.address() {
                    counters.record_heal();
                }
                return Ok(healed);
            }
            Err(_) => {
                attempts += 1;
                if attempts >= MAX_HEAL_ATTEMPTS {
                    return Err(GcError::CasRetryExhausted {
                        operation: "pointer healing",
                        attempts,
                    });
                }
                backoff.spin();
            }
        }
    }
}

/// Colored form of `value` for a store in the current phase
pub(crate) fn color_for_store(value: Option<Address>, snapshot: StateSnapshot) -> ColoredPointer {
    value.map_or(ColoredPointer::NULL, |address| {
        ColoredPointer::encode(address, snapshot.good_color())
    })
}

/// Write barrier: store `value` into `slot`
pub(crate) fn store(shared: &Shared, slot: &AtomicUsize, value: Option<Address>) -> GcResult<()> {
    let snapshot = shared.state.snapshot();
    let new = color_for_store(value, snapshot);
    if snapshot.phase != GcPhase::Marking {
        new.store(slot);
        return Ok(());
    }
    let old = new.swap(slot);
    if !old.is_null() {
        let referent = resolve(shared, old, snapshot)?;
        shared.marker.enqueue(referent);
    }
    Ok(())
}
