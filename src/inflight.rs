//! Per-(node, capability) inflight accounting
//!
//! Admission control for command dispatch: a cell exists for every
//! capability a connected worker currently declares, and `inflight` never
//! exceeds the worker's declared `max_inflight`. Reservations hand out a
//! guard that releases exactly once on every terminal path, including drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::protocol::CapabilityDecl;

/// Cell key: node id plus capability name normalized to lower case
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CellKey {
    node_id: String,
    capability: String,
}

impl CellKey {
    fn new(node_id: &str, capability: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            capability: capability.to_lowercase(),
        }
    }
}

#[derive(Debug)]
struct Cell {
    inflight: u32,
    max_inflight: u32,
}

/// One worker's inflight counters, for observability
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInflightSnapshot {
    /// Worker node id
    pub node_id: String,
    /// Per-capability counters
    pub capabilities: Vec<CapabilityInflight>,
}

/// One capability's counters
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityInflight {
    /// Capability name (lower-cased)
    pub capability: String,
    /// Currently reserved slots
    pub inflight: u32,
    /// Declared limit
    pub max_inflight: u32,
}

/// Reservation table shared by router, sessions, and the task manager
#[derive(Debug, Default)]
pub struct InflightTable {
    cells: DashMap<CellKey, Cell>,
}

impl InflightTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a node's cells from its hello declarations.
    ///
    /// All prior cells for the node are dropped; counters restart at zero.
    pub fn reset_node(&self, node_id: &str, declarations: &[CapabilityDecl]) {
        self.cells.retain(|key, _| key.node_id != node_id);
        for decl in declarations {
            self.cells.insert(
                CellKey::new(node_id, &decl.name),
                Cell {
                    inflight: 0,
                    max_inflight: decl.max_inflight,
                },
            );
        }
    }

    /// Remove every cell for a node
    pub fn remove_node(&self, node_id: &str) {
        self.cells.retain(|key, _| key.node_id != node_id);
    }

    /// Try to reserve one slot on `(node_id, capability)`.
    ///
    /// Succeeds only while `inflight < max_inflight`; the increment happens
    /// under the cell's map shard lock, so concurrent reservations cannot
    /// overshoot the limit.
    pub fn try_reserve(
        self: &Arc<Self>,
        node_id: &str,
        capability: &str,
    ) -> Option<ReservationGuard> {
        let key = CellKey::new(node_id, capability);
        let mut cell = self.cells.get_mut(&key)?;
        if cell.inflight >= cell.max_inflight {
            return None;
        }
        cell.inflight += 1;
        drop(cell);

        Some(ReservationGuard {
            table: Arc::clone(self),
            key,
            released: AtomicBool::new(false),
        })
    }

    fn release(&self, key: &CellKey) {
        if let Some(mut cell) = self.cells.get_mut(key) {
            cell.inflight = cell.inflight.saturating_sub(1);
        }
        // A missing cell means the node re-helloed or dropped since the
        // reservation; its counters were already reset.
    }

    /// Current counters for one cell, if it exists
    #[must_use]
    pub fn cell(&self, node_id: &str, capability: &str) -> Option<(u32, u32)> {
        self.cells
            .get(&CellKey::new(node_id, capability))
            .map(|c| (c.inflight, c.max_inflight))
    }

    /// Per-worker snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> Vec<WorkerInflightSnapshot> {
        let mut by_node: std::collections::BTreeMap<String, Vec<CapabilityInflight>> =
            std::collections::BTreeMap::new();
        for entry in &self.cells {
            by_node
                .entry(entry.key().node_id.clone())
                .or_default()
                .push(CapabilityInflight {
                    capability: entry.key().capability.clone(),
                    inflight: entry.value().inflight,
                    max_inflight: entry.value().max_inflight,
                });
        }
        by_node
            .into_iter()
            .map(|(node_id, mut capabilities)| {
                capabilities.sort_by(|a, b| a.capability.cmp(&b.capability));
                WorkerInflightSnapshot {
                    node_id,
                    capabilities,
                }
            })
            .collect()
    }
}

/// Releases one reserved slot exactly once.
///
/// Dropping the guard releases the slot, so every terminal path (success,
/// failure, timeout, cancel, session close) settles the counter without
/// coordination. Calling [`ReservationGuard::release`] early is equivalent.
#[derive(Debug)]
pub struct ReservationGuard {
    table: Arc<InflightTable>,
    key: CellKey,
    released: AtomicBool,
}

impl ReservationGuard {
    /// Node id the reservation is held on
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.key.node_id
    }

    /// Release the slot now instead of at drop
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.table.release(&self.key);
            debug!(node_id = %self.key.node_id, capability = %self.key.capability, "Released inflight slot");
        }
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        self.release();
    }
}
