//! Root set
//!
//! Roots are slots outside the heap that hold colored pointers: slots the
//! collector owns on behalf of the caller (registered with
//! [`RootSet::register`]) and slots the caller owns and exposes through a
//! [`RootProvider`]. Both are enumerated at every cycle's root snapshot; no
//! root is remembered across cycles.

use crate::error::{GcError, GcResult};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Where a root comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootType {
    /// A mutator stack slot
    Stack,
    /// A global or static
    Global,
    /// A handle held by the runtime
    Handle,
}

/// Handle to a registered root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RootHandle(pub u64);

/// Caller-owned root slots
///
/// `visit_roots` is called at safepoints, possibly from the collector's
/// driver thread. Every slot passed to the visitor must hold a colored
/// pointer previously produced by the collector (or 0); the collector may
/// rewrite it in place. A panic in `visit_roots` fails the cycle that
/// triggered it with [`GcError::LockPoisoned`].
pub trait RootProvider: Send + Sync {
    /// Pass every root slot to `visitor`
    fn visit_roots(&self, visitor: &mut dyn FnMut(&AtomicUsize));
}

struct RootEntry {
    slot: AtomicUsize,
    kind: RootType,
}

#[derive(Default)]
struct Roots {
    entries: FxHashMap<u64, RootEntry>,
    providers: Vec<Arc<dyn RootProvider>>,
}

/// Registered roots and root providers
#[derive(Default)]
pub struct RootSet {
    roots: Mutex<Roots>,
    next_handle: AtomicU64,
}

impl RootSet {
    /// Empty root set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a root holding `raw` (a colored pointer or 0)
    pub fn register(&self, raw: usize, kind: RootType) -> GcResult<RootHandle> {
        let handle = RootHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        let entry = RootEntry {
            slot: AtomicUsize::new(raw),
            kind,
        };
        self.roots.lock().entries.insert(handle.0, entry);
        Ok(handle)
    }

    /// Remove a root
    pub fn unregister(&self, handle: RootHandle) -> GcResult<()> {
        self.roots
            .lock()
            .entries
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(GcError::UnknownRoot(handle.0))
    }

    /// Run `f` on the slot behind `handle`
    pub fn with_slot<T>(
        &self,
        handle: RootHandle,
        f: impl FnOnce(&AtomicUsize) -> GcResult<T>,
    ) -> GcResult<T> {
        let roots = self.roots.lock();
        let entry = roots
            .entries
            .get(&handle.0)
            .ok_or(GcError::UnknownRoot(handle.0))?;
        f(&entry.slot)
    }

    /// Kind of a root
    pub fn kind(&self, handle: RootHandle) -> GcResult<RootType> {
        let roots = self.roots.lock();
        roots
            .entries
            .get(&handle.0)
            .map(|entry| entry.kind)
            .ok_or(GcError::UnknownRoot(handle.0))
    }

    /// Add a provider; it stays registered for the life of the root set
    pub fn add_provider(&self, provider: Arc<dyn RootProvider>) -> GcResult<()> {
        self.roots.lock().providers.push(provider);
        Ok(())
    }

    /// Remove a provider added with [`add_provider`](Self::add_provider);
    /// returns whether it was registered
    pub fn remove_provider(&self, provider: &Arc<dyn RootProvider>) -> bool {
        let mut roots = self.roots.lock();
        let before = roots.providers.len();
        roots
            .providers
            .retain(|registered| !Arc::ptr_eq(registered, provider));
        roots.providers.len() != before
    }

    /// Registered roots (providers not counted)
    pub fn len(&self) -> usize {
        self.roots.lock().entries.len()
    }

    /// Whether no root is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every root slot: registered roots first, then providers.
    /// Stops at the first provider that panics.
    pub fn for_each_slot(&self, visitor: &mut dyn FnMut(&AtomicUsize)) -> GcResult<()> {
        let roots = self.roots.lock();
        for entry in roots.entries.values() {
            visitor(&entry.slot);
        }
        for provider in &roots.providers {
            catch_unwind(AssertUnwindSafe(|| provider.visit_roots(&mut *visitor)))
                .map_err(|_| GcError::LockPoisoned("root provider panicked".to_string()))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RootSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let roots = self.roots.lock();
        f.debug_struct("RootSet")
            .field("roots", &roots.entries.len())
            .field("providers", &roots.providers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slots(Vec<AtomicUsize>);

    impl RootProvider for Slots {
        fn visit_roots(&self, visitor: &mut dyn FnMut(&AtomicUsize)) {
            for slot in &self.0 {
                visitor(slot);
            }
        }
    }

    #[test]
    fn test_register_and_unregister() {
        let roots = RootSet::new();
        let a = roots.register(0x1000, RootType::Global).unwrap();
        let b = roots.register(0x2000, RootType::Stack).unwrap();
        assert_ne!(a, b);
        assert_eq!(roots.len(), 2);
        assert_eq!(roots.kind(b).unwrap(), RootType::Stack);

        roots.unregister(a).unwrap();
        assert!(matches!(roots.unregister(a), Err(GcError::UnknownRoot(_))));
        assert!(matches!(
            roots.with_slot(a, |_| Ok(())),
            Err(GcError::UnknownRoot(_))
        ));
        let value = roots
            .with_slot(b, |slot| Ok(slot.load(Ordering::Acquire)))
            .unwrap();
        assert_eq!(value, 0x2000);
    }

    #[test]
    fn test_enumeration_includes_providers() {
        let roots = RootSet::new();
        roots.register(0x1000, RootType::Handle).unwrap();
        let provider = Arc::new(Slots(vec![AtomicUsize::new(0x3000), AtomicUsize::new(0)]));
        roots.add_provider(provider.clone()).unwrap();

        let mut seen = Vec::new();
        roots
            .for_each_slot(&mut |slot| seen.push(slot.load(Ordering::Acquire)))
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec![0, 0x1000, 0x3000]);

        roots
            .for_each_slot(&mut |slot| slot.store(0x4000, Ordering::Release))
            .unwrap();
        assert_eq!(provider.0[1].load(Ordering::Acquire), 0x4000);
    }

    #[test]
    fn test_panicking_provider_fails_enumeration_only() {
        struct Panics;
        impl RootProvider for Panics {
            fn visit_roots(&self, _visitor: &mut dyn FnMut(&AtomicUsize)) {
                panic!("provider failed");
            }
        }

        let roots = RootSet::new();
        let panics: Arc<dyn RootProvider> = Arc::new(Panics);
        roots.add_provider(panics.clone()).unwrap();
        assert!(matches!(
            roots.for_each_slot(&mut |_| {}),
            Err(GcError::LockPoisoned(_))
        ));

        // the set stays usable
        let handle = roots.register(0x1000, RootType::Global).unwrap();
        assert_eq!(roots.kind(handle).unwrap(), RootType::Global);
        assert!(roots.remove_provider(&panics));
        assert!(!roots.remove_provider(&panics));
        let mut seen = 0;
        roots.for_each_slot(&mut |_| seen += 1).unwrap();
        assert_eq!(seen, 1);
    }
}
