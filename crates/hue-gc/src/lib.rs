//! # Hue Garbage Collector
//!
//! Concurrent, generational, region-based collector with colored pointers.
//!
//! ## Design
//!
//! - **Regions**: the heap is a reserved address range handed out as small,
//!   medium and large regions; memory is reclaimed a region at a time
//! - **Allocation**: per-thread bump allocation (TLABs), no atomics on the
//!   fast path
//! - **Colored pointers**: four metadata bits (`Marked0`, `Marked1`,
//!   `Remapped`, `Finalizable`) above the 44-bit address
//! - **Load barrier**: pointers with the wrong color are healed in place,
//!   relocating their target on demand
//! - **Concurrent marking and relocation**: only root snapshot, remark and
//!   relocation start stop the mutators
//! - **Finalizers and weak references**: neither keeps its object alive;
//!   both are resolved at the end of marking
//!
//! ## Usage
//!
//! ```ignore
//! let collector = Collector::new(GcConfig::default())?;
//! let mut mutator = collector.mutator();
//! let object = mutator.allocate(64)?;
//! let root = collector.register_root(Some(object), RootType::Global)?;
//! collector.request_gc(GcGeneration::Young, GcReason::Explicit)?;
//! mutator.poll();
//! let object = collector.root(root)?;
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod allocator;
pub mod barrier;
pub mod collector;
pub mod colored;
pub mod config;
pub mod error;
pub mod finalization;
pub mod forwarding;
pub mod heap;
pub mod livemap;
pub mod marker;
pub mod memory;
pub mod mutator;
pub mod numa;
pub mod object;
pub mod region;
pub mod relocator;
pub mod roots;
pub mod safepoint;
pub mod sizing;
pub mod state;
pub mod stats;
pub mod weak;

pub use collector::{Collector, GcGeneration, GcReason, GcState};
pub use colored::ColoredPointer;
pub use config::GcConfig;
pub use error::{ErrorKind, GcError, GcResult};
pub use heap::HeapOccupancy;
pub use mutator::Mutator;
pub use object::{AllSlots, Address, FixedSlots, LayoutId, NoPointers, PointerMap};
pub use relocator::RelocationObserver;
pub use roots::{RootHandle, RootProvider, RootType};
pub use safepoint::{MutatorId, SafePointState};
pub use state::GcPhase;
pub use stats::{BarrierCounts, Summary};
pub use weak::WeakRef;
