//! Forwarding table
//!
//! Maps the old payload address of every relocated object to its new one
//! for a single cycle. Entries are inserted exactly once and never change;
//! the table is split into shards so concurrent relocators and barriers
//! rarely touch the same lock.

use crate::error::{GcResult, InternalError};
use crate::object::Address;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

const SHARDS: usize = 64;

/// Old → new addresses for one relocation cycle
pub struct ForwardingTable {
    epoch: u64,
    shards: Box<[RwLock<FxHashMap<usize, usize>>]>,
    len: AtomicUsize,
}

impl ForwardingTable {
    /// Empty table for the relocation of `epoch`
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            shards: (0..SHARDS)
                .map(|_| RwLock::new(FxHashMap::default()))
                .collect(),
            len: AtomicUsize::new(0),
        }
    }

    /// Cycle that filled this table
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    #[inline]
    fn shard(&self, old: Address) -> &RwLock<FxHashMap<usize, usize>> {
        // payloads are at least 16 bytes apart
        &self.shards[(old.as_usize() >> 4) % SHARDS]
    }

    /// New address of `old`, if it was relocated
    #[inline]
    pub fn get(&self, old: Address) -> Option<Address> {
        self.shard(old).read().get(&old.as_usize()).map(|&new| Address::new(new))
    }

    /// Publish `old → new`. The copy must be complete before this call; the
    /// shard lock orders it before any reader that finds the entry.
    pub fn insert(&self, old: Address, new: Address) -> GcResult<()> {
        let mut shard = self.shard(old).write();
        if let Some(&existing) = shard.get(&old.as_usize()) {
            let err = InternalError::ForwardingDoubleInsert {
                old: old.as_usize(),
                existing,
                new: new.as_usize(),
            };
            tracing::error!(target: "hue::gc", epoch = self.epoch, "{err}");
            return Err(err.into());
        }
        shard.insert(old.as_usize(), new.as_usize());
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether nothing was relocated
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ForwardingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingTable")
            .field("epoch", &self.epoch)
            .field("len", &self.len())
            .finish()
    }
}
