//! Global collector state
//!
//! Phase and epoch live together in one `AtomicU64` so a reader always sees
//! a consistent pair: the phase in the low 8 bits, the epoch above it.
//!
//! Epochs are not always consecutive. Slots can still hold pointers colored
//! by the last *completed* marking, waiting to be healed through its
//! forwarding table, so a new marking always gets the opposite mark bit.
//! After an aborted marking that means skipping one epoch.

use crate::colored::{REMAPPED, mark_bit};
use crate::error::{GcError, GcResult};
use std::sync::atomic::{AtomicU64, Ordering};

const PHASE_BITS: u32 = 8;
const PHASE_MASK: u64 = (1 << PHASE_BITS) - 1;

/// Collector phase
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// No cycle in progress
    Idle = 0,
    /// Concurrent marking
    Marking = 1,
    /// Concurrent evacuation of the relocation set
    Relocating = 2,
    /// Retiring evacuated regions
    Cleanup = 3,
}

impl From<u8> for GcPhase {
    fn from(v: u8) -> Self {
        match v {
            1 => GcPhase::Marking,
            2 => GcPhase::Relocating,
            3 => GcPhase::Cleanup,
            _ => GcPhase::Idle,
        }
    }
}

impl GcPhase {
    /// Whether objects of the relocation set may still move or be looked up
    pub fn is_relocating(self) -> bool {
        matches!(self, GcPhase::Relocating | GcPhase::Cleanup)
    }
}

/// A consistent reading of [`CollectorState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    /// Current phase
    pub phase: GcPhase,
    /// Current cycle number
    pub epoch: u64,
}

impl StateSnapshot {
    /// Mark bit of the current epoch
    #[inline]
    pub fn mark_bit(self) -> usize {
        mark_bit(self.epoch)
    }

    /// View a pointer must carry to skip the barrier slow path
    #[inline]
    pub fn good_color(self) -> usize {
        match self.phase {
            GcPhase::Marking => self.mark_bit(),
            _ => REMAPPED,
        }
    }
}

/// Phase and epoch of the collector
#[derive(Debug)]
pub struct CollectorState {
    word: AtomicU64,
    marked: AtomicU64,
}

impl Default for CollectorState {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorState {
    /// Idle at epoch 0
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(pack(GcPhase::Idle, 0)),
            marked: AtomicU64::new(0),
        }
    }

    /// Current phase and epoch
    #[inline]
    pub fn snapshot(&self) -> StateSnapshot {
        unpack(self.word.load(Ordering::Acquire))
    }

    /// Current phase
    pub fn phase(&self) -> GcPhase {
        self.snapshot().phase
    }

    /// Current epoch
    pub fn epoch(&self) -> u64 {
        self.snapshot().epoch
    }

    /// Epoch of the last marking that ran to completion (0 before the first)
    #[inline]
    pub fn last_marked(&self) -> u64 {
        self.marked.load(Ordering::Acquire)
    }

    /// Record that the marking of `epoch` reached every live object
    pub(crate) fn finish_marking(&self, epoch: u64) {
        self.marked.store(epoch, Ordering::Release);
    }

    /// Idle → Marking, advancing the epoch to the next one whose mark bit
    /// differs from [`last_marked`](Self::last_marked)
    pub fn begin_marking(&self) -> GcResult<u64> {
        let current = self.word.load(Ordering::Acquire);
        let snapshot = unpack(current);
        if snapshot.phase != GcPhase::Idle {
            return Err(GcError::corruption(format!(
                "cycle started in phase {:?}",
                snapshot.phase
            )));
        }
        let mut epoch = snapshot.epoch + 1;
        if (epoch - self.last_marked()) % 2 == 0 {
            epoch += 1;
        }
        self.word
            .compare_exchange(
                current,
                pack(GcPhase::Marking, epoch),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| GcError::corruption("collector state changed concurrently"))?;
        Ok(epoch)
    }

    /// Move from `from` to `to` within the current epoch
    pub fn transition(&self, from: GcPhase, to: GcPhase) -> GcResult<()> {
        let current = self.word.load(Ordering::Acquire);
        let snapshot = unpack(current);
        if snapshot.phase != from {
            return Err(GcError::corruption(format!(
                "expected phase {from:?}, found {:?}",
                snapshot.phase
            )));
        }
        self.word
            .compare_exchange(
                current,
                pack(to, snapshot.epoch),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| GcError::corruption("collector state changed concurrently"))
    }

    /// Return to Idle from any phase, keeping the epoch
    pub(crate) fn abort_to_idle(&self) {
        let epoch = self.epoch();
        self.word
            .store(pack(GcPhase::Idle, epoch), Ordering::Release);
    }
}

#[inline]
fn pack(phase: GcPhase, epoch: u64) -> u64 {
    (epoch << PHASE_BITS) | phase as u64
}

#[inline]
fn unpack(word: u64) -> StateSnapshot {
    StateSnapshot {
        phase: GcPhase::from((word & PHASE_MASK) as u8),
        epoch: word >> PHASE_BITS,
    }
}
