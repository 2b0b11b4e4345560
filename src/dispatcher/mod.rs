//! Dispatcher facade
//!
//! Wires the registry, session layer, router, inflight table, task manager,
//! and identity verifier into the single surface the transport consumes:
//! submit / get / cancel, the echo probe, and the observability snapshots.

mod echo;

use std::sync::Arc;

use chrono::TimeDelta;

use crate::clock::SharedClock;
use crate::config::DispatcherConfig;
use crate::identity::IdentityVerifier;
use crate::inflight::{InflightTable, WorkerInflightSnapshot};
use crate::registry::{RegistryStats, WorkerFilter, WorkerRegistry, WorkerView};
use crate::router::CapabilityRouter;
use crate::session::SessionManager;
use crate::task::{
    CancelResult, SubmitRequest, SubmitResult, Task, TaskManager, spawn_retention_sweep,
};
use crate::{identity::WorkerType, Result};

/// The control-plane dispatcher
pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    inflight: Arc<InflightTable>,
    sessions: Arc<SessionManager>,
    tasks: Arc<TaskManager>,
    router: CapabilityRouter,
    verifier: Arc<IdentityVerifier>,
    clock: SharedClock,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Assemble a dispatcher from its collaborators
    pub fn new(
        verifier: Arc<IdentityVerifier>,
        clock: SharedClock,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        let registry = Arc::new(WorkerRegistry::new());
        let inflight = Arc::new(InflightTable::new());
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&registry),
            Arc::clone(&inflight),
            Arc::clone(&verifier),
            Arc::clone(&clock),
            config.clone(),
        ));
        let tasks = Arc::new(TaskManager::new(
            CapabilityRouter::new(Arc::clone(&registry), Arc::clone(&inflight)),
            Arc::clone(&sessions),
            Arc::clone(&clock),
            config.clone(),
        ));
        let router = CapabilityRouter::new(Arc::clone(&registry), Arc::clone(&inflight));

        Arc::new(Self {
            registry,
            inflight,
            sessions,
            tasks,
            router,
            verifier,
            clock,
            config,
        })
    }

    /// Start background maintenance (retention sweep)
    pub fn start_background(&self) {
        spawn_retention_sweep(Arc::clone(&self.tasks));
    }

    /// Submit a task (sync or async per the request's mode)
    pub async fn submit_task(&self, request: SubmitRequest) -> Result<SubmitResult> {
        self.tasks.submit(request).await
    }

    /// Fetch a task snapshot, owner-gated
    #[must_use]
    pub fn get_task(&self, task_id: &str, owner_id: &str) -> Option<Task> {
        self.tasks.get(task_id, owner_id)
    }

    /// Cancel a task, owner-gated
    pub fn cancel_task(&self, task_id: &str, owner_id: &str) -> Result<CancelResult> {
        self.tasks.cancel(task_id, owner_id)
    }

    /// Per-worker inflight counters
    #[must_use]
    pub fn inflight_stats(&self) -> Vec<WorkerInflightSnapshot> {
        self.inflight.snapshot()
    }

    /// Registry status counts
    #[must_use]
    pub fn registry_stats(&self) -> RegistryStats {
        let now = self.clock.now();
        self.registry.stats(
            now,
            TimeDelta::from_std(self.config.offline_ttl).unwrap_or(TimeDelta::MAX),
            TimeDelta::from_std(self.config.stale_after).unwrap_or(TimeDelta::MAX),
        )
    }

    /// List workers, sorted by registration time
    #[must_use]
    pub fn list_workers(
        &self,
        filter: &WorkerFilter,
        page: usize,
        page_size: usize,
    ) -> (Vec<WorkerView>, usize) {
        let now = self.clock.now();
        self.registry.list(
            filter,
            page,
            page_size,
            now,
            TimeDelta::from_std(self.config.offline_ttl).unwrap_or(TimeDelta::MAX),
        )
    }

    /// List only the caller's workers of the requested type
    #[must_use]
    pub fn list_workers_scoped(
        &self,
        filter: &WorkerFilter,
        page: usize,
        page_size: usize,
        owner_id: &str,
        worker_type: WorkerType,
    ) -> (Vec<WorkerView>, usize) {
        let now = self.clock.now();
        self.registry.list_scoped(
            filter,
            page,
            page_size,
            now,
            TimeDelta::from_std(self.config.offline_ttl).unwrap_or(TimeDelta::MAX),
            owner_id,
            worker_type,
        )
    }

    /// Drop a worker entirely: record, session, counters
    pub fn drop_worker(&self, node_id: &str) {
        self.sessions.drop_node(node_id);
    }

    /// Session manager, consumed by the worker transport
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Identity verifier, consumed by the identity admin surface
    #[must_use]
    pub fn verifier(&self) -> &Arc<IdentityVerifier> {
        &self.verifier
    }

    /// Dispatcher configuration
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }
}
