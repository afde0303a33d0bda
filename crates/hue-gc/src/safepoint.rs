//! Safepoint coordination
//!
//! Mutator threads register once and then call [`Safepoints::poll`] at their
//! checkpoints. Polling is a single acquire load of a global flag; only when
//! the flag is up does the thread take the registry lock and block.
//!
//! A safepoint is a counted rendezvous: [`SafepointRequest::wait`] returns
//! once every registered, attached thread has acknowledged the current
//! request generation. Detached threads (blocked in native code, or waiting
//! for a collection) are not waited for, and cannot reattach until the
//! safepoint is released.

use crate::error::{GcError, GcResult};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Identifier of a registered mutator thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutatorId(pub u64);

/// Safe point state of one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafePointState {
    /// Normal execution
    Running,
    /// Waiting at safe point
    AtSafePoint,
    /// Not participating (native code, waiting on the collector)
    Detached,
}

#[derive(Debug)]
struct ThreadRecord {
    attached: bool,
    /// Last request generation this thread acknowledged
    acked: u64,
    /// Collector epoch published by this thread
    epoch: u64,
}

#[derive(Debug, Default)]
struct Registry {
    threads: FxHashMap<MutatorId, ThreadRecord>,
    next_id: u64,
    active: bool,
    generation: u64,
    epoch: u64,
    cancelled: bool,
}

impl Registry {
    fn pending(&self) -> usize {
        self.threads
            .values()
            .filter(|t| t.attached && t.acked != self.generation)
            .count()
    }
}

/// Safepoint coordinator
#[derive(Debug, Default)]
pub struct Safepoints {
    requested: AtomicBool,
    registry: Mutex<Registry>,
    /// Signalled when a thread acknowledges, detaches or leaves
    arrived: Condvar,
    /// Signalled when a safepoint is released
    resumed: Condvar,
}

impl Safepoints {
    /// Coordinator with no threads
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the calling thread as an attached mutator.
    ///
    /// Blocks while a safepoint is in progress.
    pub fn register(&self) -> MutatorId {
        let mut registry = self.registry.lock();
        while registry.active {
            self.resumed.wait(&mut registry);
        }
        let id = MutatorId(registry.next_id);
        registry.next_id += 1;
        let record = ThreadRecord {
            attached: true,
            acked: registry.generation,
            epoch: registry.epoch,
        };
        registry.threads.insert(id, record);
        id
    }

    /// Remove a thread; it no longer holds up safepoints
    pub fn deregister(&self, id: MutatorId) {
        let mut registry = self.registry.lock();
        registry.threads.remove(&id);
        self.arrived.notify_all();
    }

    /// Whether a safepoint has been requested
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Checkpoint: block if a safepoint is requested
    #[inline]
    pub fn poll(&self, id: MutatorId) {
        if self.is_requested() {
            self.block(id);
        }
    }

    /// Acknowledge the current request and wait until it is released
    pub fn block(&self, id: MutatorId) {
        let mut registry = self.registry.lock();
        loop {
            if !registry.active {
                break;
            }
            let generation = registry.generation;
            if let Some(record) = registry.threads.get_mut(&id) {
                if record.acked != generation {
                    record.acked = generation;
                    self.arrived.notify_all();
                }
            }
            self.resumed.wait(&mut registry);
        }
        let epoch = registry.epoch;
        if let Some(record) = registry.threads.get_mut(&id) {
            record.epoch = epoch;
        }
    }

    /// Stop participating in safepoints
    pub fn detach(&self, id: MutatorId) {
        let mut registry = self.registry.lock();
        if let Some(record) = registry.threads.get_mut(&id) {
            record.attached = false;
        }
        self.arrived.notify_all();
    }

    /// Participate again; blocks while a safepoint is in progress
    pub fn reattach(&self, id: MutatorId) {
        let mut registry = self.registry.lock();
        while registry.active {
            self.resumed.wait(&mut registry);
        }
        let (generation, epoch) = (registry.generation, registry.epoch);
        if let Some(record) = registry.threads.get_mut(&id) {
            record.attached = true;
            record.acked = generation;
            record.epoch = epoch;
        }
    }

    /// State of a thread
    pub fn thread_state(&self, id: MutatorId) -> Option<SafePointState> {
        let registry = self.registry.lock();
        let record = registry.threads.get(&id)?;
        Some(if !record.attached {
            SafePointState::Detached
        } else if registry.active && record.acked == registry.generation {
            SafePointState::AtSafePoint
        } else {
            SafePointState::Running
        })
    }

    /// Raise the flag. Call [`SafepointRequest::wait`] for the rendezvous.
    pub fn request_safepoint(&self) -> SafepointRequest<'_> {
        let mut registry = self.registry.lock();
        registry.active = true;
        registry.generation += 1;
        self.requested.store(true, Ordering::Release);
        tracing::trace!(
            target: "hue::gc",
            generation = registry.generation,
            threads = registry.threads.len(),
            "safepoint requested"
        );
        SafepointRequest {
            safepoints: self,
            released: false,
        }
    }

    /// Make every pending and future rendezvous fail with `Shutdown`
    pub fn cancel(&self) {
        let mut registry = self.registry.lock();
        registry.cancelled = true;
        self.arrived.notify_all();
    }

    /// Lowest epoch published by an attached thread
    pub fn min_published_epoch(&self) -> Option<u64> {
        self.registry
            .lock()
            .threads
            .values()
            .filter(|t| t.attached)
            .map(|t| t.epoch)
            .min()
    }

    /// Registered threads
    pub fn registered(&self) -> usize {
        self.registry.lock().threads.len()
    }

    /// Registered, attached threads
    pub fn attached(&self) -> usize {
        self.registry
            .lock()
            .threads
            .values()
            .filter(|t| t.attached)
            .count()
    }

    fn release(&self, epoch: Option<u64>) {
        let mut registry = self.registry.lock();
        registry.active = false;
        if let Some(epoch) = epoch {
            registry.epoch = epoch;
        }
        self.requested.store(false, Ordering::Release);
        self.resumed.notify_all();
    }
}

/// An outstanding safepoint; released explicitly or on drop
#[must_use = "a safepoint stays in effect until released"]
pub struct SafepointRequest<'a> {
    safepoints: &'a Safepoints,
    released: bool,
}

impl SafepointRequest<'_> {
    /// Block until every attached thread has acknowledged
    pub fn wait(&self) -> GcResult<()> {
        let mut registry = self.safepoints.registry.lock();
        loop {
            if registry.cancelled {
                return Err(GcError::Shutdown);
            }
            if registry.pending() == 0 {
                return Ok(());
            }
            self.safepoints.arrived.wait(&mut registry);
        }
    }

    /// Resume all threads, publishing `epoch` as the collector epoch
    pub fn release(mut self, epoch: u64) {
        self.released = true;
        self.safepoints.release(Some(epoch));
    }
}

impl Drop for SafepointRequest<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.safepoints.release(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_no_threads_rendezvous_immediately() {
        let safepoints = Safepoints::new();
        let request = safepoints.request_safepoint();
        assert!(safepoints.is_requested());
        request.wait().unwrap();
        request.release(1);
        assert!(!safepoints.is_requested());
    }

    #[test]
    fn test_rendezvous_stops_all_threads() {
        let safepoints = Arc::new(Safepoints::new());
        let progress = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let safepoints = safepoints.clone();
                let progress = progress.clone();
                let stop = stop.clone();
                let id = safepoints.register();
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        progress.fetch_add(1, Ordering::Relaxed);
                        safepoints.poll(id);
                    }
                    safepoints.deregister(id);
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(10));
        let request = safepoints.request_safepoint();
        request.wait().unwrap();
        let frozen = progress.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(progress.load(Ordering::SeqCst), frozen);
        request.release(7);

        std::thread::sleep(Duration::from_millis(10));
        assert!(progress.load(Ordering::SeqCst) > frozen);
        stop.store(true, Ordering::Relaxed);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(safepoints.registered(), 0);
    }

    #[test]
    fn test_detached_threads_are_not_waited_for() {
        let safepoints = Safepoints::new();
        let id = safepoints.register();
        safepoints.detach(id);
        assert_eq!(safepoints.thread_state(id), Some(SafePointState::Detached));

        let request = safepoints.request_safepoint();
        request.wait().unwrap();
        request.release(2);

        safepoints.reattach(id);
        assert_eq!(safepoints.thread_state(id), Some(SafePointState::Running));
        assert_eq!(safepoints.min_published_epoch(), Some(2));
    }

    #[test]
    fn test_reattach_blocks_during_safepoint() {
        let safepoints = Arc::new(Safepoints::new());
        let id = safepoints.register();
        safepoints.detach(id);

        let request = safepoints.request_safepoint();
        request.wait().unwrap();

        let reattached = Arc::new(AtomicBool::new(false));
        let handle = {
            let safepoints = safepoints.clone();
            let reattached = reattached.clone();
            std::thread::spawn(move || {
                safepoints.reattach(id);
                reattached.store(true, Ordering::SeqCst);
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!reattached.load(Ordering::SeqCst));
        request.release(1);
        handle.join().unwrap();
        assert!(reattached.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_fails_wait() {
        let safepoints = Safepoints::new();
        let _id = safepoints.register();
        let request = safepoints.request_safepoint();
        safepoints.cancel();
        assert!(matches!(request.wait(), Err(GcError::Shutdown)));
        drop(request);
        assert!(!safepoints.is_requested());
    }

    #[test]
    fn test_epoch_published_on_resume() {
        let safepoints = Arc::new(Safepoints::new());
        let id = safepoints.register();
        let handle = {
            let safepoints = safepoints.clone();
            std::thread::spawn(move || {
                while !safepoints.is_requested() {
                    std::thread::yield_now();
                }
                safepoints.poll(id);
            })
        };
        let request = safepoints.request_safepoint();
        request.wait().unwrap();
        assert_eq!(safepoints.thread_state(id), Some(SafePointState::AtSafePoint));
        request.release(9);
        handle.join().unwrap();
        assert_eq!(safepoints.min_published_epoch(), Some(9));
    }
}
