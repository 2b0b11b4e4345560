//! Worker registry and liveness
//!
//! Membership set of worker nodes keyed by node id. Membership changes are
//! serialized behind one lock so readers always observe a consistent record;
//! online/offline status is never stored, it is derived from `last_seen_at`
//! at read time.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::identity::WorkerType;
use crate::protocol::{CapabilityDecl, Hello};
use crate::{Error, Result};

/// Label key carrying the owning account id
pub const LABEL_OWNER_ID: &str = "owner_id";
/// Label key carrying the worker type (`normal` / `sys`)
pub const LABEL_WORKER_TYPE: &str = "worker_type";

/// Derived worker liveness status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Heartbeating within the offline TTL
    Online,
    /// Silent for longer than the offline TTL
    Offline,
}

/// One registered worker
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    /// Stable node id
    pub node_id: String,
    /// Display name
    pub node_name: String,
    /// Executor kind
    pub executor_kind: String,
    /// Declared capabilities, in declaration order
    pub capabilities: Vec<CapabilityDecl>,
    /// Labels from the hello frame
    pub labels: HashMap<String, String>,
    /// Worker semantic version
    pub version: String,
    /// First successful hello
    pub registered_at: DateTime<Utc>,
    /// Last inbound frame of any kind
    pub last_seen_at: DateTime<Utc>,
    /// Current session id; empty while no session is live
    pub session_id: String,
}

impl WorkerRecord {
    /// Owner id label, if present
    #[must_use]
    pub fn owner_id(&self) -> Option<&str> {
        self.labels.get(LABEL_OWNER_ID).map(String::as_str)
    }

    /// Worker type label; missing or unknown values read as `normal`
    #[must_use]
    pub fn worker_type(&self) -> WorkerType {
        self.labels
            .get(LABEL_WORKER_TYPE)
            .map_or(WorkerType::Normal, |v| WorkerType::from_label(v))
    }

    /// Does this worker declare `capability` (case-insensitive)?
    #[must_use]
    pub fn declares(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.name.eq_ignore_ascii_case(capability))
    }

    /// Liveness derived from `last_seen_at` against `now`
    #[must_use]
    pub fn status(&self, now: DateTime<Utc>, offline_ttl: chrono::Duration) -> WorkerStatus {
        if now - self.last_seen_at <= offline_ttl {
            WorkerStatus::Online
        } else {
            WorkerStatus::Offline
        }
    }
}

/// Serializable worker snapshot with status computed at read time
#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    /// Stable node id
    pub node_id: String,
    /// Display name
    pub node_name: String,
    /// Executor kind
    pub executor_kind: String,
    /// Declared capabilities
    pub capabilities: Vec<CapabilityDecl>,
    /// Labels
    pub labels: HashMap<String, String>,
    /// Worker semantic version
    pub version: String,
    /// First successful hello
    pub registered_at: DateTime<Utc>,
    /// Last inbound frame
    pub last_seen_at: DateTime<Utc>,
    /// Whether a session is currently live
    pub connected: bool,
    /// Derived status
    pub status: WorkerStatus,
}

impl WorkerView {
    fn from_record(record: &WorkerRecord, now: DateTime<Utc>, offline_ttl: chrono::Duration) -> Self {
        Self {
            node_id: record.node_id.clone(),
            node_name: record.node_name.clone(),
            executor_kind: record.executor_kind.clone(),
            capabilities: record.capabilities.clone(),
            labels: record.labels.clone(),
            version: record.version.clone(),
            registered_at: record.registered_at,
            last_seen_at: record.last_seen_at,
            connected: !record.session_id.is_empty(),
            status: record.status(now, offline_ttl),
        }
    }
}

/// Optional list filters
#[derive(Debug, Clone, Default)]
pub struct WorkerFilter {
    /// Only workers declaring this capability (case-insensitive)
    pub capability: Option<String>,
    /// Only workers with this derived status
    pub status: Option<WorkerStatus>,
}

/// Registry counters for observability
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    /// Registered workers
    pub total: usize,
    /// Derived-online workers
    pub online: usize,
    /// Derived-offline workers
    pub offline: usize,
    /// Online workers whose last heartbeat is older than `stale_after`
    pub stale: usize,
}

/// The live membership set
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerRecord>>,
}

impl WorkerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or refresh a record from an accepted hello.
    ///
    /// Capabilities and labels replace prior values; `registered_at` is
    /// preserved on refresh. Returns the superseded session id when the node
    /// already had a different live session — the caller must tear that
    /// session down.
    pub fn upsert(&self, hello: &Hello, session_id: &str, now: DateTime<Utc>) -> Option<String> {
        let mut workers = self.workers.write();
        match workers.get_mut(&hello.node_id) {
            Some(record) => {
                let superseded = (!record.session_id.is_empty()
                    && record.session_id != session_id)
                    .then(|| record.session_id.clone());

                record.node_name = hello.node_name.clone();
                record.executor_kind = hello.executor_kind.clone();
                record.capabilities = hello.capabilities.clone();
                record.labels = hello.labels.clone();
                record.version = hello.version.clone();
                record.last_seen_at = now;
                record.session_id = session_id.to_string();

                if superseded.is_some() {
                    info!(node_id = %hello.node_id, "Worker reconnected, superseding prior session");
                }
                superseded
            }
            None => {
                workers.insert(
                    hello.node_id.clone(),
                    WorkerRecord {
                        node_id: hello.node_id.clone(),
                        node_name: hello.node_name.clone(),
                        executor_kind: hello.executor_kind.clone(),
                        capabilities: hello.capabilities.clone(),
                        labels: hello.labels.clone(),
                        version: hello.version.clone(),
                        registered_at: now,
                        last_seen_at: now,
                        session_id: session_id.to_string(),
                    },
                );
                info!(node_id = %hello.node_id, "Worker registered");
                None
            }
        }
    }

    /// Record a heartbeat. The session id must match the live session.
    pub fn heartbeat(&self, node_id: &str, session_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut workers = self.workers.write();
        let record = workers
            .get_mut(node_id)
            .ok_or_else(|| Error::NotFound(node_id.to_string()))?;
        if record.session_id != session_id {
            return Err(Error::SessionReplaced(node_id.to_string()));
        }
        record.last_seen_at = now;
        Ok(())
    }

    /// Stamp `last_seen_at` for any inbound frame on the live session
    pub fn touch(&self, node_id: &str, now: DateTime<Utc>) {
        if let Some(record) = self.workers.write().get_mut(node_id) {
            record.last_seen_at = now;
        }
    }

    /// Clear the session id, but only if it still matches `session_id`.
    ///
    /// A session that was already superseded must not clobber its successor.
    pub fn clear_session(&self, node_id: &str, session_id: &str) {
        if let Some(record) = self.workers.write().get_mut(node_id) {
            if record.session_id == session_id {
                record.session_id.clear();
                debug!(node_id, "Session detached from worker record");
            }
        }
    }

    /// Remove a worker record entirely
    pub fn drop_worker(&self, node_id: &str) -> Option<WorkerRecord> {
        let removed = self.workers.write().remove(node_id);
        if removed.is_some() {
            info!(node_id, "Worker dropped from registry");
        }
        removed
    }

    /// Fetch a record clone
    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<WorkerRecord> {
        self.workers.read().get(node_id).cloned()
    }

    /// List workers sorted by `registered_at` ascending, paged.
    ///
    /// Returns the page and the total match count.
    #[must_use]
    pub fn list(
        &self,
        filter: &WorkerFilter,
        page: usize,
        page_size: usize,
        now: DateTime<Utc>,
        offline_ttl: chrono::Duration,
    ) -> (Vec<WorkerView>, usize) {
        let workers = self.workers.read();
        let mut matched: Vec<&WorkerRecord> = workers
            .values()
            .filter(|record| {
                filter
                    .capability
                    .as_deref()
                    .is_none_or(|cap| record.declares(cap))
                    && filter
                        .status
                        .is_none_or(|status| record.status(now, offline_ttl) == status)
            })
            .collect();
        matched.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });

        let total = matched.len();
        let page_size = page_size.max(1);
        let views = matched
            .into_iter()
            .skip(page.saturating_mul(page_size))
            .take(page_size)
            .map(|record| WorkerView::from_record(record, now, offline_ttl))
            .collect();
        (views, total)
    }

    /// Owner- and type-scoped listing: only records whose `owner_id` label
    /// equals the caller and whose `worker_type` label equals the request.
    #[must_use]
    pub fn list_scoped(
        &self,
        filter: &WorkerFilter,
        page: usize,
        page_size: usize,
        now: DateTime<Utc>,
        offline_ttl: chrono::Duration,
        owner_id: &str,
        worker_type: WorkerType,
    ) -> (Vec<WorkerView>, usize) {
        let workers = self.workers.read();
        let mut matched: Vec<&WorkerRecord> = workers
            .values()
            .filter(|record| {
                record.owner_id() == Some(owner_id)
                    && record.worker_type() == worker_type
                    && filter
                        .capability
                        .as_deref()
                        .is_none_or(|cap| record.declares(cap))
                    && filter
                        .status
                        .is_none_or(|status| record.status(now, offline_ttl) == status)
            })
            .collect();
        matched.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });

        let total = matched.len();
        let page_size = page_size.max(1);
        let views = matched
            .into_iter()
            .skip(page.saturating_mul(page_size))
            .take(page_size)
            .map(|record| WorkerView::from_record(record, now, offline_ttl))
            .collect();
        (views, total)
    }

    /// Status counts plus the second-order stale count
    #[must_use]
    pub fn stats(
        &self,
        now: DateTime<Utc>,
        offline_ttl: chrono::Duration,
        stale_after: chrono::Duration,
    ) -> RegistryStats {
        let workers = self.workers.read();
        let mut stats = RegistryStats {
            total: workers.len(),
            online: 0,
            offline: 0,
            stale: 0,
        };
        for record in workers.values() {
            match record.status(now, offline_ttl) {
                WorkerStatus::Online => {
                    stats.online += 1;
                    if now - record.last_seen_at > stale_after {
                        stats.stale += 1;
                    }
                }
                WorkerStatus::Offline => stats.offline += 1,
            }
        }
        stats
    }

    /// Online workers declaring `capability`, in `registered_at` order.
    ///
    /// This ordering makes router placement reproducible.
    #[must_use]
    pub fn online_by_capability(
        &self,
        capability: &str,
        now: DateTime<Utc>,
        offline_ttl: chrono::Duration,
    ) -> Vec<WorkerRecord> {
        let workers = self.workers.read();
        let mut matched: Vec<WorkerRecord> = workers
            .values()
            .filter(|record| {
                record.declares(capability)
                    && record.status(now, offline_ttl) == WorkerStatus::Online
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        matched
    }
}
