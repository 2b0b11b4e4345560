//! Task manager
//!
//! Owns the task table and drives every task from submission to a terminal
//! state: idempotency begin, worker pick, inflight reservation, dispatch,
//! sync-wait or background waiter, cancellation, and retention eviction.
//! The terminal transition and the inflight release happen exactly once per
//! task regardless of which path resolves it first.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::DispatcherConfig;
use crate::idempotency::{BeginOutcome, IdemKey, IdempotencyIndex};
use crate::router::CapabilityRouter;
use crate::session::{CommandOutcome, SessionManager};
use crate::{Error, Result};

use super::{Task, TaskMode, TaskStatus};

/// One task submission
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Requested capability
    pub capability: String,
    /// Capability-specific input
    pub input: Value,
    /// Sync or async
    pub mode: TaskMode,
    /// Requested timeout; `None` selects the configured default
    pub timeout: Option<Duration>,
    /// Optional idempotency request id
    pub request_id: Option<String>,
    /// Owner resolved by the transport from the authenticated caller
    pub owner_id: String,
}

/// Submission outcome
#[derive(Debug, Clone)]
pub struct SubmitResult {
    /// Task snapshot at return time
    pub task: Task,
    /// Whether the snapshot is terminal
    pub completed: bool,
}

/// Cancellation outcome
#[derive(Debug, Clone)]
pub struct CancelResult {
    /// Task snapshot after the call
    pub task: Task,
    /// The task was already terminal; nothing changed
    pub already_terminal: bool,
}

/// Task table plus the machinery that moves tasks through it
pub struct TaskManager {
    tasks: DashMap<String, Task>,
    idempotency: IdempotencyIndex,
    router: CapabilityRouter,
    sessions: Arc<SessionManager>,
    clock: SharedClock,
    config: DispatcherConfig,
}

impl TaskManager {
    /// Create a task manager over the shared routing machinery
    pub fn new(
        router: CapabilityRouter,
        sessions: Arc<SessionManager>,
        clock: SharedClock,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            tasks: DashMap::new(),
            idempotency: IdempotencyIndex::new(),
            router,
            sessions,
            clock,
            config,
        }
    }

    fn offline_ttl(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.offline_ttl).unwrap_or(TimeDelta::MAX)
    }

    /// Submit a task.
    ///
    /// Sync mode blocks until the task reaches a terminal state, bounded by
    /// its deadline. Async mode returns immediately; a background waiter
    /// performs the terminal transition when the command resolves.
    pub async fn submit(self: &Arc<Self>, request: SubmitRequest) -> Result<SubmitResult> {
        let task_id = Uuid::new_v4().to_string();
        let request_id = request
            .request_id
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string();

        let now = self.clock.now();
        let timeout = self.config.clamp_task_timeout(request.timeout);
        let deadline_at = now + TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX);

        let task = Task {
            task_id: task_id.clone(),
            capability: request.capability.clone(),
            owner_id: request.owner_id.clone(),
            input: request.input.clone(),
            mode: request.mode,
            request_id: request_id.clone(),
            status: TaskStatus::Queued,
            result: None,
            error_code: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            deadline_at,
            completed_at: None,
            node_id: None,
            command_id: None,
        };

        // The idempotency claim and the task-row insertion happen under one
        // lock: two concurrent submits with the same key cannot both create,
        // and the loser always finds the winner's row already in the table.
        let idem_key = IdemKey::new(&request.owner_id, &request_id);
        match &idem_key {
            Some(key) => {
                let row = &self.tasks;
                let insert_task = task.clone();
                match self.idempotency.begin_with(key.clone(), &task_id, || {
                    row.insert(task_id.clone(), insert_task);
                }) {
                    BeginOutcome::Created => {}
                    BeginOutcome::InFlight(existing) | BeginOutcome::Terminal(existing) => {
                        let task = self
                            .tasks
                            .get(&existing)
                            .map(|t| t.clone())
                            .ok_or_else(|| Error::RequestInProgress(request_id.clone()))?;
                        debug!(task_id = %existing, request_id, "Replayed idempotent submit");
                        let completed = task.status.is_terminal();
                        return Ok(SubmitResult { task, completed });
                    }
                }
            }
            None => {
                self.tasks.insert(task_id.clone(), task);
            }
        }
        info!(task_id, capability = %request.capability, mode = ?request.mode, "Task created");

        // A zero deadline times out before any capacity is reserved.
        if timeout.is_zero() {
            let snapshot = self.settle_or_current(
                &task_id,
                TaskStatus::Timeout,
                None,
                Some(("deadline_exceeded", "task deadline elapsed before dispatch")),
            );
            return Ok(SubmitResult {
                task: snapshot.ok_or_else(|| Error::NotFound(task_id))?,
                completed: true,
            });
        }

        let owner_scope = self
            .config
            .is_owner_pinned(&request.capability)
            .then_some(request.owner_id.as_str());

        let (record, guard) = match self.router.pick(
            &request.capability,
            owner_scope,
            now,
            self.offline_ttl(),
        ) {
            Ok(picked) => picked,
            Err(err @ (Error::NoWorker(_) | Error::NoCapacity(_))) => {
                return self.fail_before_dispatch(&task_id, idem_key.as_ref(), &err);
            }
            Err(err) => return Err(err),
        };

        let Some(session) = self.sessions.session_for_node(&record.node_id) else {
            // Worker shown online but its session is already gone; treat it
            // like a session close at dispatch time.
            drop(guard);
            let err = Error::SessionClosed;
            return self.fail_before_dispatch(&task_id, idem_key.as_ref(), &err);
        };

        if let Some(mut task) = self.tasks.get_mut(&task_id) {
            // A concurrent cancel (via an idempotent attach) may have won;
            // dropping the guard returns the slot and the snapshot stands.
            if task.transition(TaskStatus::Running, self.clock.now()).is_err() {
                let snapshot = task.clone();
                return Ok(SubmitResult {
                    task: snapshot,
                    completed: true,
                });
            }
            task.node_id = Some(record.node_id.clone());
        }

        let handle = match session
            .dispatch(
                &request.capability,
                request.input,
                &request.owner_id,
                Some(&task_id),
                guard,
            )
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                let snapshot = self.settle_or_current(
                    &task_id,
                    TaskStatus::Failed,
                    None,
                    Some((err.kind(), "worker session closed before dispatch")),
                );
                return Ok(SubmitResult {
                    task: snapshot.ok_or_else(|| Error::NotFound(task_id))?,
                    completed: true,
                });
            }
        };

        if let Some(mut task) = self.tasks.get_mut(&task_id) {
            task.command_id = Some(handle.command_id().to_string());
        }

        // The waiter always runs, even for sync submits: if the caller's
        // transport gives up mid-wait, the terminal transition still happens
        // exactly once in the background.
        let (done_tx, done_rx) = oneshot::channel();
        let manager = Arc::clone(self);
        let waiter_task_id = task_id.clone();
        tokio::spawn(async move {
            let outcome = handle.wait(timeout).await;
            // finish yields None when another terminal path won (cancel);
            // report whatever state the task ended up in.
            let snapshot = manager
                .finish(&waiter_task_id, &outcome)
                .or_else(|| manager.tasks.get(&waiter_task_id).map(|t| t.clone()));
            if let Some(snapshot) = snapshot {
                let _ = done_tx.send(snapshot);
            }
        });

        match request.mode {
            TaskMode::Sync => match done_rx.await {
                Ok(snapshot) => Ok(SubmitResult {
                    task: snapshot,
                    completed: true,
                }),
                Err(_) => {
                    // Waiter died without reporting (panic or eviction);
                    // contain it at this boundary instead of tearing down.
                    error!(task_id, "Task waiter dropped without settling");
                    let snapshot = self.settle_or_current(
                        &task_id,
                        TaskStatus::Failed,
                        None,
                        Some(("internal", "task waiter terminated unexpectedly")),
                    );
                    Ok(SubmitResult {
                        task: snapshot.ok_or_else(|| Error::NotFound(task_id))?,
                        completed: true,
                    })
                }
            },
            TaskMode::Async => {
                let task = self
                    .tasks
                    .get(&task_id)
                    .map(|t| t.clone())
                    .ok_or_else(|| Error::NotFound(task_id))?;
                let completed = task.status.is_terminal();
                Ok(SubmitResult { task, completed })
            }
        }
    }

    /// Fail a still-queued task for a pre-dispatch routing error and drop
    /// the idempotency claim so the caller may retry with the same key.
    fn fail_before_dispatch(
        &self,
        task_id: &str,
        idem_key: Option<&IdemKey>,
        err: &Error,
    ) -> Result<SubmitResult> {
        warn!(task_id, kind = err.kind(), "Task failed before dispatch");
        let message = err.to_string();
        let snapshot = self.settle_or_current(
            task_id,
            TaskStatus::Failed,
            None,
            Some((err.kind(), message.as_str())),
        );
        if let Some(key) = idem_key {
            self.idempotency.forget(key);
        }
        Ok(SubmitResult {
            task: snapshot.ok_or_else(|| Error::NotFound(task_id.to_string()))?,
            completed: true,
        })
    }

    /// Apply the terminal mapping for a command outcome.
    ///
    /// Returns `None` when the task is gone or already terminal (for
    /// example a cancel that won the race); the outcome is then discarded.
    fn finish(&self, task_id: &str, outcome: &CommandOutcome) -> Option<Task> {
        match outcome {
            CommandOutcome::Success {
                payload,
                completed_unix_ms: _,
            } => self.settle(task_id, TaskStatus::Succeeded, Some(payload.clone()), None),
            CommandOutcome::Failure { code, message } => {
                self.settle(task_id, TaskStatus::Failed, None, Some((code, message)))
            }
            CommandOutcome::TimedOut => self.settle(
                task_id,
                TaskStatus::Timeout,
                None,
                Some(("deadline_exceeded", "task deadline exceeded")),
            ),
            CommandOutcome::SessionClosed => self.settle(
                task_id,
                TaskStatus::Failed,
                None,
                Some(("session_closed", "worker session closed")),
            ),
            CommandOutcome::Canceled => self.settle(
                task_id,
                TaskStatus::Canceled,
                None,
                Some(("canceled", "canceled by owner")),
            ),
        }
    }

    /// [`TaskManager::settle`], falling back to the task's current snapshot
    /// when a different terminal path already won.
    fn settle_or_current(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<(&str, &str)>,
    ) -> Option<Task> {
        self.settle(task_id, status, result, error)
            .or_else(|| self.tasks.get(task_id).map(|t| t.clone()))
    }

    /// Move a task to a terminal state exactly once and finalize its
    /// idempotency entry. Returns the terminal snapshot, or `None` when the
    /// task is missing or a different terminal state won the race.
    fn settle(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<(&str, &str)>,
    ) -> Option<Task> {
        let now = self.clock.now();
        let snapshot = {
            let mut task = self.tasks.get_mut(task_id)?;
            if task.transition(status, now).is_err() {
                return None;
            }
            task.result = result;
            if let Some((code, message)) = error {
                task.error_code = Some(code.to_string());
                task.error_message = Some(message.to_string());
            }
            task.clone()
        };

        if let Some(key) = IdemKey::new(&snapshot.owner_id, &snapshot.request_id) {
            self.idempotency.finalize(&key);
        }
        info!(task_id, status = ?snapshot.status, "Task settled");
        Some(snapshot)
    }

    /// Fetch a task snapshot, gated by ownership.
    ///
    /// A task under a different owner reads as absent so existence never
    /// leaks across tenants.
    #[must_use]
    pub fn get(&self, task_id: &str, owner_id: &str) -> Option<Task> {
        self.tasks
            .get(task_id)
            .filter(|task| task.owner_id == owner_id)
            .map(|task| task.clone())
    }

    /// Cancel a task.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the task does not exist or belongs to a
    /// different owner. A task already terminal is reported via
    /// `already_terminal`, not an error, so cancel stays idempotent.
    pub fn cancel(&self, task_id: &str, owner_id: &str) -> Result<CancelResult> {
        let (snapshot, routing) = {
            let mut task = self
                .tasks
                .get_mut(task_id)
                .filter(|task| task.owner_id == owner_id)
                .ok_or_else(|| Error::NotFound(task_id.to_string()))?;

            if task.status.is_terminal() {
                return Ok(CancelResult {
                    task: task.clone(),
                    already_terminal: true,
                });
            }

            task.transition(TaskStatus::Canceled, self.clock.now())?;
            task.error_code = Some("canceled".to_string());
            task.error_message = Some("canceled by owner".to_string());
            let routing = task.node_id.clone().zip(task.command_id.clone());
            (task.clone(), routing)
        };

        if let Some(key) = IdemKey::new(&snapshot.owner_id, &snapshot.request_id) {
            self.idempotency.finalize(&key);
        }

        // Resolve the pending command outside the task entry lock. The
        // worker's eventual result frame is discarded; the reservation
        // releases as the pending entry drops.
        if let Some((node_id, command_id)) = routing {
            if let Some(session) = self.sessions.session_for_node(&node_id) {
                session.resolve(&command_id, CommandOutcome::Canceled);
            }
        }

        info!(task_id, "Task canceled");
        Ok(CancelResult {
            task: snapshot,
            already_terminal: false,
        })
    }

    /// Evict completed tasks older than the retention window, along with
    /// their idempotency entries.
    pub fn sweep_retention(&self) -> usize {
        let now = self.clock.now();
        let retention = TimeDelta::from_std(self.config.task_retention).unwrap_or(TimeDelta::MAX);

        let expired: Vec<(String, Option<IdemKey>)> = self
            .tasks
            .iter()
            .filter_map(|task| {
                let completed_at = task.completed_at?;
                (now - completed_at > retention).then(|| {
                    (
                        task.task_id.clone(),
                        IdemKey::new(&task.owner_id, &task.request_id),
                    )
                })
            })
            .collect();

        let count = expired.len();
        for (task_id, key) in expired {
            // Entry first: an entry must never point at an evicted task.
            if let Some(key) = key {
                self.idempotency.forget(&key);
            }
            self.tasks.remove(&task_id);
        }
        if count > 0 {
            debug!(count, "Evicted completed tasks past retention");
        }
        count
    }

    /// Current number of tracked tasks
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Number of tracked idempotency entries
    #[must_use]
    pub fn idempotency_entries(&self) -> usize {
        self.idempotency.len()
    }
}

/// Spawn the periodic retention sweep.
///
/// Runs every `sweep_interval` and stops when the manager has no other
/// owners left (server shutdown).
pub fn spawn_retention_sweep(manager: Arc<TaskManager>) {
    let interval = manager.config.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if Arc::strong_count(&manager) <= 1 {
                break;
            }
            manager.sweep_retention();
        }
    });
}
