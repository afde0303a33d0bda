//! NUMA placement hints
//!
//! Regions are tagged with a node round-robin when `numa_aware` is set. The
//! tag is advisory: memory is not bound to the node.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Detected NUMA nodes and the round-robin cursor
#[derive(Debug)]
pub struct NumaTopology {
    nodes: usize,
    enabled: bool,
    next: AtomicUsize,
}

impl NumaTopology {
    /// Detect the node count; `enabled = false` disables tagging
    pub fn detect(enabled: bool) -> Self {
        let nodes = if enabled { node_count() } else { 1 };
        if enabled {
            tracing::debug!(target: "hue::gc", nodes, "NUMA topology detected");
        }
        Self::with_nodes(nodes, enabled)
    }

    /// Fixed node count
    pub fn with_nodes(nodes: usize, enabled: bool) -> Self {
        Self {
            nodes: nodes.max(1),
            enabled,
            next: AtomicUsize::new(0),
        }
    }

    /// Number of nodes
    pub fn nodes(&self) -> usize {
        self.nodes
    }

    /// Node for the next region
    pub fn next_node(&self) -> Option<u16> {
        if !self.enabled {
            return None;
        }
        let node = self.next.fetch_add(1, Ordering::Relaxed) % self.nodes;
        u16::try_from(node).ok()
    }
}

#[cfg(target_os = "linux")]
fn node_count() -> usize {
    std::fs::read_dir("/sys/devices/system/node")
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|entry| {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    name.strip_prefix("node")
                        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
                })
                .count()
        })
        .unwrap_or(1)
        .max(1)
}

#[cfg(not(target_os = "linux"))]
fn node_count() -> usize {
    1
}
