//! Task records and the task status state machine
//!
//! A task is the dispatcher-side lifecycle record over zero or one wire
//! commands. Status only ever moves forward along
//! `queued → running → (succeeded | failed | timeout | canceled)`, with the
//! direct `queued → terminal` edge for pre-dispatch failures; terminal
//! states are absorbing.

mod manager;

pub use manager::{
    CancelResult, SubmitRequest, SubmitResult, TaskManager, spawn_retention_sweep,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Task execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    /// Caller blocks until the task reaches a terminal state or its deadline
    #[default]
    Sync,
    /// Caller gets a task id immediately and polls for the result
    Async,
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, not yet dispatched
    Queued,
    /// Dispatched to a worker
    Running,
    /// Worker returned a result
    Succeeded,
    /// Worker or dispatcher reported an error
    Failed,
    /// Local deadline elapsed
    Timeout,
    /// Canceled by the owner
    Canceled,
}

impl TaskStatus {
    /// Terminal states are absorbing
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Timeout | Self::Canceled
        )
    }
}

/// One task record; clones of this serve as caller-visible snapshots
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    /// Opaque task id
    pub task_id: String,
    /// Requested capability
    pub capability: String,
    /// Owning account; gates all visibility
    pub owner_id: String,
    /// Capability-specific input, passed through opaquely
    pub input: Value,
    /// Execution mode
    pub mode: TaskMode,
    /// Caller-supplied request id; empty when none was given
    pub request_id: String,
    /// Current status
    pub status: TaskStatus,
    /// Result payload, set when succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error code, set on failed/timeout/canceled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Error message, set on failed/timeout/canceled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
    /// Last transition instant
    pub updated_at: DateTime<Utc>,
    /// Hard deadline for the whole task
    pub deadline_at: DateTime<Utc>,
    /// Set exactly when the task reaches a terminal state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Worker the task was dispatched to, once running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Command id of the dispatched wire command, once running
    #[serde(skip)]
    pub command_id: Option<String>,
}

impl Task {
    /// Apply a status transition, enforcing the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Terminal`] when the task is already terminal, and
    /// [`Error::Internal`] for edges the machine does not admit.
    pub fn transition(&mut self, to: TaskStatus, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::Terminal(self.task_id.clone()));
        }
        let admitted = match (self.status, to) {
            (TaskStatus::Queued, TaskStatus::Running) => true,
            (TaskStatus::Queued | TaskStatus::Running, target) if target.is_terminal() => true,
            _ => false,
        };
        if !admitted {
            return Err(Error::Internal(format!(
                "inadmissible task transition {:?} -> {to:?}",
                self.status
            )));
        }
        self.status = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }
}
