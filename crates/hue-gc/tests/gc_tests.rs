//! GC correctness tests
//!
//! Single-mutator scenarios: objects reachable from roots survive any
//! number of cycles with their contents intact, unreachable ones are
//! reclaimed.

mod common;

use common::{collector, node, test_config};
use hue_gc::{
    Address, Collector, ErrorKind, FixedSlots, GcConfig, GcError, GcGeneration, RootProvider,
    RootType,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn test_hundred_objects_end_to_end() {
    let collector = collector();
    let mut mutator = collector.mutator();

    let mut roots = Vec::new();
    for i in 0..100 {
        let object = mutator.allocate(64).unwrap();
        mutator.write_word(object, 0, i).unwrap();
        roots.push(collector.register_root(Some(object), RootType::Handle).unwrap());
    }

    mutator.collect(GcGeneration::Young).unwrap();
    for (i, root) in roots.iter().enumerate() {
        let object = collector.root(*root).unwrap().expect("rooted object");
        assert_eq!(mutator.read_word(object, 0).unwrap(), i);
        assert_eq!(mutator.size_of(object).unwrap(), 64);
    }

    let used_before = collector.heap_occupancy().used_bytes;
    for root in roots.drain(50..) {
        collector.unregister_root(root).unwrap();
    }
    mutator.collect(GcGeneration::Full).unwrap();
    let used_after = collector.heap_occupancy().used_bytes;
    assert!(
        used_after < used_before,
        "used bytes did not shrink: {used_before} -> {used_after}"
    );

    for (i, root) in roots.iter().enumerate() {
        let object = collector.root(*root).unwrap().expect("rooted object");
        assert_eq!(mutator.read_word(object, 0).unwrap(), i);
    }
    assert_eq!(collector.stats().cycles, 2);
}

#[test]
fn test_linked_list_survives_many_cycles() {
    let collector = collector();
    let layout = collector
        .register_layout(Arc::new(FixedSlots(vec![0])))
        .unwrap();
    let mut mutator = collector.mutator();

    let root = collector.register_root(None, RootType::Global).unwrap();
    for i in 0..1000 {
        let head = collector.root(root).unwrap();
        let next = node(&mut mutator, layout, i).unwrap();
        mutator.store_ref(next, 0, head).unwrap();
        collector.set_root(root, Some(next)).unwrap();
    }

    for generation in [
        GcGeneration::Young,
        GcGeneration::Young,
        GcGeneration::Full,
        GcGeneration::Old,
        GcGeneration::Full,
    ] {
        mutator.collect(generation).unwrap();

        let mut current = collector.root(root).unwrap();
        let mut expected = 1000;
        while let Some(object) = current {
            expected -= 1;
            assert_eq!(mutator.read_word(object, 8).unwrap(), expected);
            current = mutator.load_ref(object, 0).unwrap();
        }
        assert_eq!(expected, 0, "list truncated after a {generation:?} cycle");
    }

    // three young-or-full evacuations push every node past the tenure threshold
    assert!(collector.stats().bytes_promoted > 0);
}

#[test]
fn test_unreachable_objects_are_reclaimed() {
    let collector = collector();
    let mut mutator = collector.mutator();

    let keeper = mutator.allocate(128).unwrap();
    mutator.write_word(keeper, 120, 0xfeed).unwrap();
    let root = collector.register_root(Some(keeper), RootType::Stack).unwrap();

    for _ in 0..20_000 {
        mutator.allocate(200).unwrap();
    }
    let committed_before = collector.heap_occupancy().committed_bytes;

    mutator.collect(GcGeneration::Full).unwrap();
    let summary = collector.stats();
    assert!(summary.regions_retired > 0);
    assert!(summary.bytes_reclaimed > 0);
    assert!(collector.heap_occupancy().committed_bytes < committed_before);

    // reuse the reclaimed space without disturbing the survivor
    for _ in 0..20_000 {
        let object = mutator.allocate(200).unwrap();
        mutator.write_word(object, 0, usize::MAX).unwrap();
    }
    let keeper = collector.root(root).unwrap().unwrap();
    assert_eq!(mutator.read_word(keeper, 120).unwrap(), 0xfeed);
    assert_eq!(mutator.read_word(keeper, 0).unwrap(), 0);
}

#[test]
fn test_exhaustion_is_reported_after_escalation() {
    common::init_tracing();
    let collector = Collector::new(GcConfig {
        max_heap_size: 8 * 1024 * 1024,
        min_heap_size: 1024 * 1024,
        initial_heap_size: 1024 * 1024,
        ..test_config()
    })
    .unwrap();
    let mut mutator = collector.mutator();

    let mut roots = Vec::new();
    let err = loop {
        match mutator.allocate(48 * 1024) {
            Ok(object) => {
                roots.push(collector.register_root(Some(object), RootType::Handle).unwrap())
            }
            Err(err) => break err,
        }
        assert!(roots.len() < 1000, "heap never filled up");
    };
    assert!(matches!(err, GcError::OutOfMemory { .. } | GcError::OutOfRegions { .. }));
    assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
    assert!(err.is_recoverable());
    // one young and one full cycle were tried first
    assert!(collector.stats().cycles >= 2);

    for root in roots.drain(..) {
        collector.unregister_root(root).unwrap();
    }
    mutator.allocate(48 * 1024).unwrap();
}

#[test]
fn test_invalid_arguments_are_rejected() {
    let collector = collector();
    let mut mutator = collector.mutator();
    let object = mutator.allocate(16).unwrap();

    assert!(matches!(
        collector.register_root(Some(Address::new(0x1234_5678)), RootType::Global),
        Err(GcError::InvalidPointer { .. })
    ));
    assert_eq!(
        collector.unregister_root(hue_gc::RootHandle(9999)),
        Err(GcError::UnknownRoot(9999))
    );
    assert!(matches!(
        collector.register_finalizer(Address::new(object.as_usize() + 4), || {}),
        Err(GcError::InvalidPointer { .. })
    ));
    assert_eq!(
        Collector::new(GcConfig {
            small_region_size: 3 * 1024 * 1024,
            ..test_config()
        })
        .err()
        .map(|err| err.kind()),
        Some(ErrorKind::InvariantViolation)
    );
}

#[test]
fn test_finalizer_runs_once_object_is_unreachable() {
    let collector = collector();
    let mut mutator = collector.mutator();
    let ran = Arc::new(AtomicUsize::new(0));

    let doomed = mutator.allocate(32).unwrap();
    let kept = mutator.allocate(32).unwrap();
    let root = collector.register_root(Some(kept), RootType::Global).unwrap();
    for object in [doomed, kept] {
        let ran = ran.clone();
        collector
            .register_finalizer(object, move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    mutator.collect(GcGeneration::Full).unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    // the finalizer does not keep its object alive
    assert!(mutator.read_word(doomed, 0).is_err());

    collector.unregister_root(root).unwrap();
    mutator.collect(GcGeneration::Full).unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 2);

    mutator.collect(GcGeneration::Full).unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 2);
}

struct SlotProvider {
    slots: Vec<AtomicUsize>,
}

impl RootProvider for SlotProvider {
    fn visit_roots(&self, visitor: &mut dyn FnMut(&AtomicUsize)) {
        for slot in &self.slots {
            visitor(slot);
        }
    }
}

#[test]
fn test_root_provider_slots_are_traced_and_healed() {
    let collector = collector();
    let provider = Arc::new(SlotProvider {
        slots: (0..8).map(|_| AtomicUsize::new(0)).collect(),
    });
    collector.add_root_provider(provider.clone()).unwrap();
    let mut mutator = collector.mutator();

    for (i, slot) in provider.slots.iter().enumerate() {
        let object = mutator.allocate(16).unwrap();
        mutator.write_word(object, 0, i * 7).unwrap();
        collector.store_slot(slot, Some(object)).unwrap();
    }

    mutator.collect(GcGeneration::Young).unwrap();
    mutator.collect(GcGeneration::Full).unwrap();

    for (i, slot) in provider.slots.iter().enumerate() {
        let object = collector.load_slot(slot).unwrap().unwrap();
        assert_eq!(mutator.read_word(object, 0).unwrap(), i * 7);
    }
}

#[test]
fn test_statistics_after_cycles() {
    let collector = collector();
    let mut mutator = collector.mutator();
    let object = mutator.allocate(64).unwrap();
    let _root = collector.register_root(Some(object), RootType::Global).unwrap();

    mutator.collect(GcGeneration::Young).unwrap();
    mutator.collect(GcGeneration::Full).unwrap();

    let summary = collector.stats();
    assert_eq!(summary.cycles, 2);
    assert_eq!(summary.minor_cycles, 1);
    assert_eq!(summary.major_cycles, 1);
    assert_eq!(summary.pause_count, 6);
    assert!(summary.pause_p50 <= summary.pause_max);
    assert!(summary.pause_p99 <= summary.pause_max);
    assert!(summary.objects_relocated >= 2);
    assert!(summary.last_cycle.is_some_and(|cycle| !cycle.minor));
    assert_eq!(summary.occupancy.max_bytes, 64 * 1024 * 1024);

    let state = collector.state();
    assert_eq!(state.phase, hue_gc::GcPhase::Idle);
    assert_eq!(state.epoch, 2);
    assert_eq!(state.cycles, 2);
}

#[test]
fn test_non_generational_heap() {
    common::init_tracing();
    let collector = Collector::new(GcConfig {
        generational: false,
        ..test_config()
    })
    .unwrap();
    let mut mutator = collector.mutator();
    let object = mutator.allocate(64).unwrap();
    mutator.write_word(object, 0, 17).unwrap();
    let root = collector.register_root(Some(object), RootType::Global).unwrap();
    for _ in 0..1000 {
        mutator.allocate(64).unwrap();
    }

    mutator.collect(GcGeneration::Full).unwrap();

    let occupancy = collector.heap_occupancy();
    assert_eq!(occupancy.young_regions, 0);
    let object = collector.root(root).unwrap().unwrap();
    assert_eq!(mutator.read_word(object, 0).unwrap(), 17);
}

#[test]
fn test_weak_references_follow_reachability() {
    let collector = collector();
    let layout = collector
        .register_layout(Arc::new(FixedSlots(vec![0])))
        .unwrap();
    let mut mutator = collector.mutator();

    let kept = node(&mut mutator, layout, 7).unwrap();
    let dropped = node(&mut mutator, layout, 8).unwrap();
    let root = collector.register_root(Some(kept), RootType::Global).unwrap();
    let to_kept = collector.create_weak(kept).unwrap();
    let to_dropped = collector.create_weak(dropped).unwrap();

    mutator.collect(GcGeneration::Young).unwrap();

    assert!(collector.is_weak_cleared(to_dropped).unwrap());
    assert_eq!(mutator.load_weak(to_dropped).unwrap(), None);
    assert!(!collector.is_weak_cleared(to_kept).unwrap());
    let moved = mutator.load_weak(to_kept).unwrap().unwrap();
    assert_eq!(Some(moved), collector.root(root).unwrap());
    assert_eq!(mutator.read_word(moved, 8).unwrap(), 7);
    assert_eq!(collector.stats().weak_refs_cleared, 1);

    // a weak reference alone does not keep its referent
    collector.unregister_root(root).unwrap();
    mutator.collect(GcGeneration::Full).unwrap();
    assert!(collector.is_weak_cleared(to_kept).unwrap());

    collector.drop_weak(to_kept).unwrap();
    assert_eq!(
        collector.drop_weak(to_kept),
        Err(GcError::UnknownWeakRef(to_kept.0))
    );
}

#[test]
fn test_barrier_statistics_count_healing() {
    let collector = collector();
    let layout = collector
        .register_layout(Arc::new(FixedSlots(vec![0])))
        .unwrap();
    let mut mutator = collector.mutator();

    let parent = node(&mut mutator, layout, 1).unwrap();
    let child = node(&mut mutator, layout, 2).unwrap();
    mutator.store_ref(parent, 0, Some(child)).unwrap();
    let root = collector.register_root(Some(parent), RootType::Global).unwrap();
    mutator.collect(GcGeneration::Young).unwrap();

    let before = collector.stats().barriers;
    let parent = collector.root(root).unwrap().unwrap();
    mutator.load_ref(parent, 0).unwrap();
    mutator.load_ref(parent, 0).unwrap();
    let after = collector.stats().barriers;

    assert!(after.healed > before.healed);
    assert!(after.fast_path > before.fast_path);
    assert!(after.total() >= before.total() + 2);
}
