//! Pending-command correlation
//!
//! One exchange lives inside each worker session. Dispatch installs a
//! pending entry keyed by `command_id` and returns a handle the caller can
//! await; the worker's `command-result` frame, a local deadline, an explicit
//! cancel, or session teardown resolves the entry. Whichever path wins
//! removes the entry first, so resolution happens exactly once and the
//! reservation guard inside the entry releases with it.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::inflight::ReservationGuard;
use crate::protocol::CommandResult;

/// Terminal outcome of one dispatched command
#[derive(Debug)]
pub enum CommandOutcome {
    /// Worker returned a result payload
    Success {
        /// Capability-specific result payload
        payload: Value,
        /// Worker-side completion timestamp (millis since epoch)
        completed_unix_ms: i64,
    },
    /// Worker returned an error pair
    Failure {
        /// Worker-supplied error code
        code: String,
        /// Worker-supplied error message
        message: String,
    },
    /// The local deadline elapsed before the worker answered
    TimedOut,
    /// The session closed while the command was pending
    SessionClosed,
    /// The owner canceled the task locally
    Canceled,
}

/// One installed pending command
#[derive(Debug)]
struct PendingCommand {
    capability: String,
    owner_id: String,
    task_id: Option<String>,
    tx: oneshot::Sender<CommandOutcome>,
    /// Releases the inflight slot when the entry is consumed or dropped
    _guard: ReservationGuard,
}

type PendingMap = Arc<DashMap<String, PendingCommand>>;

/// Correlation table for one session
#[derive(Debug, Default)]
pub struct CommandExchange {
    pending: PendingMap,
}

impl CommandExchange {
    /// Create an empty exchange
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Install a pending entry and return `(command_id, handle)`.
    ///
    /// The caller enqueues the matching `command-dispatch` frame; the handle
    /// resolves exactly once.
    pub fn install(
        &self,
        capability: &str,
        owner_id: &str,
        task_id: Option<&str>,
        guard: ReservationGuard,
    ) -> (String, PendingHandle) {
        let command_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            command_id.clone(),
            PendingCommand {
                capability: capability.to_string(),
                owner_id: owner_id.to_string(),
                task_id: task_id.map(str::to_string),
                tx,
                _guard: guard,
            },
        );
        trace!(command_id, capability, "Installed pending command");
        (
            command_id.clone(),
            PendingHandle {
                command_id,
                rx,
                pending: Arc::clone(&self.pending),
            },
        )
    }

    /// Resolve a pending command with `outcome`.
    ///
    /// Returns `false` when the command is unknown (already resolved or
    /// timed out); late worker results land here and are discarded.
    pub fn resolve(&self, command_id: &str, outcome: CommandOutcome) -> bool {
        match self.pending.remove(command_id) {
            Some((_, entry)) => {
                debug!(
                    command_id,
                    capability = %entry.capability,
                    owner_id = %entry.owner_id,
                    task_id = ?entry.task_id,
                    "Resolved pending command"
                );
                // The receiver may have given up (sync caller gone); the
                // entry removal alone settles the reservation.
                let _ = entry.tx.send(outcome);
                true
            }
            None => {
                debug!(command_id, "Discarding result for unknown command");
                false
            }
        }
    }

    /// Resolve from a worker `command-result` frame
    pub fn resolve_result(&self, result: CommandResult) -> bool {
        let outcome = match result.error {
            Some(err) => CommandOutcome::Failure {
                code: err.code,
                message: err.message,
            },
            None => CommandOutcome::Success {
                payload: result.payload.unwrap_or(Value::Null),
                completed_unix_ms: result.completed_unix_ms,
            },
        };
        self.resolve(&result.command_id, outcome)
    }

    /// Fail every pending command with `session closed`.
    ///
    /// Called on session teardown; each entry resolves exactly once and its
    /// reservation releases as the entry drops.
    pub fn fail_all_closed(&self) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for command_id in ids {
            if self.resolve(&command_id, CommandOutcome::SessionClosed) {
                failed += 1;
            }
        }
        failed
    }

    /// Number of unresolved commands
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Return `true` when no command is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Awaitable side of one pending command
#[derive(Debug)]
pub struct PendingHandle {
    command_id: String,
    rx: oneshot::Receiver<CommandOutcome>,
    pending: PendingMap,
}

impl PendingHandle {
    /// Command id this handle correlates with
    #[must_use]
    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    /// Wait for resolution, bounded by `deadline`.
    ///
    /// On expiry the pending entry is removed (releasing its reservation)
    /// and the worker's later result, if any, will be discarded.
    pub async fn wait(self, deadline: std::time::Duration) -> CommandOutcome {
        match tokio::time::timeout(deadline, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without resolving: the session was torn down
            // and its exchange discarded wholesale.
            Ok(Err(_)) => CommandOutcome::SessionClosed,
            Err(_) => {
                drop(self.pending.remove(&self.command_id));
                CommandOutcome::TimedOut
            }
        }
    }
}
