//! Per-region live map
//!
//! One bit per 8-byte granule, set at the payload address of every object the
//! marker reaches. The map also sums live bytes so relocation selection needs
//! no extra pass.
//!
//! A map belongs to one epoch. The first marker of a new epoch clears it;
//! readers asking about an older epoch see an empty map.

use crate::object::OBJECT_ALIGNMENT;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const BITS_PER_WORD: usize = 64;

/// Live objects of one region for one epoch
pub struct LiveMap {
    words: Box<[AtomicU64]>,
    live_bytes: AtomicUsize,
    live_objects: AtomicUsize,
    epoch: AtomicU64,
    reset: Mutex<()>,
}

impl LiveMap {
    /// Map covering `bytes` bytes of region
    pub fn new(bytes: usize) -> Self {
        let granules = bytes.div_ceil(OBJECT_ALIGNMENT);
        let words = (0..granules.div_ceil(BITS_PER_WORD))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            words,
            live_bytes: AtomicUsize::new(0),
            live_objects: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
            reset: Mutex::new(()),
        }
    }

    /// Record a live object at `offset` from the region start.
    ///
    /// Returns false if it was already recorded for `epoch`.
    pub fn mark(&self, offset: usize, bytes: usize, epoch: u64) -> bool {
        if self.epoch.load(Ordering::Acquire) != epoch {
            self.reset_for(epoch);
        }
        let granule = offset / OBJECT_ALIGNMENT;
        let Some(word) = self.words.get(granule / BITS_PER_WORD) else {
            return false;
        };
        let bit = 1u64 << (granule % BITS_PER_WORD);
        if word.fetch_or(bit, Ordering::AcqRel) & bit != 0 {
            return false;
        }
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.live_objects.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn reset_for(&self, epoch: u64) {
        let _guard = self.reset.lock();
        if self.epoch.load(Ordering::Acquire) == epoch {
            return;
        }
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
        self.live_bytes.store(0, Ordering::Relaxed);
        self.live_objects.store(0, Ordering::Relaxed);
        self.epoch.store(epoch, Ordering::Release);
    }

    /// Whether the object at `offset` was recorded in `epoch`
    pub fn is_live(&self, offset: usize, epoch: u64) -> bool {
        if self.epoch.load(Ordering::Acquire) != epoch {
            return false;
        }
        let granule = offset / OBJECT_ALIGNMENT;
        self.words
            .get(granule / BITS_PER_WORD)
            .is_some_and(|w| w.load(Ordering::Acquire) & (1 << (granule % BITS_PER_WORD)) != 0)
    }

    /// Bytes recorded in `epoch`
    pub fn live_bytes(&self, epoch: u64) -> usize {
        if self.epoch.load(Ordering::Acquire) != epoch {
            return 0;
        }
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Objects recorded in `epoch`
    pub fn live_objects(&self, epoch: u64) -> usize {
        if self.epoch.load(Ordering::Acquire) != epoch {
            return 0;
        }
        self.live_objects.load(Ordering::Relaxed)
    }

    /// Offsets of recorded objects, ascending. Only meaningful once marking
    /// for `epoch` has finished.
    pub fn live_offsets(&self, epoch: u64) -> Vec<usize> {
        let mut offsets = Vec::new();
        if self.epoch.load(Ordering::Acquire) != epoch {
            return offsets;
        }
        for (index, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                offsets.push((index * BITS_PER_WORD + bit) * OBJECT_ALIGNMENT);
                bits &= bits - 1;
            }
        }
        offsets
    }
}
