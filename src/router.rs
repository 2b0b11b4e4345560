//! Capability router
//!
//! Picks the worker a new command lands on. Selection is intentionally
//! simple: online declarers of the capability in `registered_at` order,
//! optionally narrowed to the caller's own workers, first one with a free
//! inflight slot wins. The contract is only that a worker's declared limit
//! is never exceeded and that placement is reproducible.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::inflight::{InflightTable, ReservationGuard};
use crate::registry::{WorkerRecord, WorkerRegistry};
use crate::{Error, Result};

/// Routes capabilities to workers with capacity
pub struct CapabilityRouter {
    registry: Arc<WorkerRegistry>,
    inflight: Arc<InflightTable>,
}

impl CapabilityRouter {
    /// Create a router over the shared registry and inflight table
    pub fn new(registry: Arc<WorkerRegistry>, inflight: Arc<InflightTable>) -> Self {
        Self { registry, inflight }
    }

    /// Pick an eligible worker and reserve one slot on it.
    ///
    /// `owner_scope` restricts candidates to workers whose `owner_id` label
    /// matches (owner-pinned capabilities such as host-shell execution).
    ///
    /// # Errors
    ///
    /// [`Error::NoWorker`] when no online worker declares the capability
    /// (within the owner scope); [`Error::NoCapacity`] when all candidates
    /// are at their declared limit.
    pub fn pick(
        &self,
        capability: &str,
        owner_scope: Option<&str>,
        now: DateTime<Utc>,
        offline_ttl: chrono::Duration,
    ) -> Result<(WorkerRecord, ReservationGuard)> {
        let candidates: Vec<WorkerRecord> = self
            .registry
            .online_by_capability(capability, now, offline_ttl)
            .into_iter()
            .filter(|record| {
                owner_scope.is_none_or(|owner| record.owner_id() == Some(owner))
            })
            .collect();

        if candidates.is_empty() {
            return Err(Error::NoWorker(capability.to_string()));
        }

        for record in candidates {
            if let Some(guard) = self.inflight.try_reserve(&record.node_id, capability) {
                debug!(
                    node_id = %record.node_id,
                    capability,
                    "Routed capability to worker"
                );
                return Ok((record, guard));
            }
        }

        Err(Error::NoCapacity(capability.to_string()))
    }
}
