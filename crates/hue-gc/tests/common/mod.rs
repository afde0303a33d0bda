//! Helpers shared by the integration tests

#![allow(dead_code)]

use hue_gc::{Address, Collector, GcConfig, GcResult, Mutator};
use std::sync::Once;
use tracing_subscriber::filter::EnvFilter;

const KB: usize = 1024;
const MB: usize = 1024 * KB;

static TRACING: Once = Once::new();

/// Route collector logs to the test output; `RUST_LOG=hue::gc=debug` shows
/// cycle details
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A small heap with 1MB regions so a few thousand objects span many regions
pub fn test_config() -> GcConfig {
    GcConfig {
        max_heap_size: 64 * MB,
        min_heap_size: 4 * MB,
        initial_heap_size: 4 * MB,
        gc_threads: Some(2),
        small_region_size: MB,
        medium_region_size: 4 * MB,
        small_threshold: 64 * KB,
        large_threshold: MB,
        tlab_size: 16 * KB,
        tlab_min_size: 4 * KB,
        tlab_max_size: 256 * KB,
        // cycles only when a test asks for one
        gc_trigger_ratio: 1.0,
        ..GcConfig::default()
    }
}

pub fn collector() -> Collector {
    init_tracing();
    Collector::new(test_config()).expect("collector")
}

/// Allocate a node with a reference slot at offset 0 and a value at offset 8
pub fn node(mutator: &mut Mutator, layout: hue_gc::LayoutId, value: usize) -> GcResult<Address> {
    let object = mutator.allocate_with_layout(16, layout)?;
    mutator.write_word(object, 8, value)?;
    Ok(object)
}
