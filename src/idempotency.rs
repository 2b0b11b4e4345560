//! Tenant-scoped idempotency index for task submission
//!
//! Prevents duplicate task creation when callers retry a submit due to
//! timeouts or lost responses.
//!
//! # How it works
//!
//! 1. A caller may supply a `request_id` with its submit.
//! 2. `begin` is consulted under the entry lock, atomically with the
//!    reservation of the new task id: two concurrent submits with the same
//!    `(owner_id, request_id)` can never both observe `Created`.
//!    - No entry → record `InFlight(new_task_id)`, proceed with creation.
//!    - `InFlight` entry → the caller is told which task is already running.
//!    - `Terminal` entry → idempotent replay of the stored task.
//! 3. `finalize` flips the entry to `Terminal` when its task completes.
//! 4. The retention sweep evicts the entry together with its task.
//!
//! An empty `request_id` bypasses the index entirely.

use dashmap::DashMap;
use tracing::debug;

// ── Key & state ───────────────────────────────────────────────────────────────

/// Index key: the owner id scopes request ids per tenant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdemKey {
    /// Account the request arrived under
    pub owner_id: String,
    /// Caller-supplied request id
    pub request_id: String,
}

impl IdemKey {
    /// Build a key; returns `None` for empty request ids (index bypass)
    #[must_use]
    pub fn new(owner_id: &str, request_id: &str) -> Option<Self> {
        let request_id = request_id.trim();
        if request_id.is_empty() {
            return None;
        }
        Some(Self {
            owner_id: owner_id.to_string(),
            request_id: request_id.to_string(),
        })
    }
}

/// Coarse state of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    InFlight,
    Terminal,
}

#[derive(Debug, Clone)]
struct Entry {
    task_id: String,
    state: EntryState,
}

/// Outcome of [`IdempotencyIndex::begin`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// No prior entry; the new task id is now registered as in-flight
    Created,
    /// A task for this key is still in flight
    InFlight(String),
    /// A task for this key already reached a terminal state
    Terminal(String),
}

// ── IdempotencyIndex ──────────────────────────────────────────────────────────

/// Map of `(owner_id, request_id)` → task id with per-key serialization
#[derive(Debug, Default)]
pub struct IdempotencyIndex {
    entries: DashMap<IdemKey, Entry>,
}

impl IdempotencyIndex {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim `key` for `new_task_id`, or report the existing task.
    ///
    /// The check-and-insert happens under the entry lock, which is what makes
    /// task creation race-free for concurrent submits sharing a key.
    pub fn begin(&self, key: IdemKey, new_task_id: &str) -> BeginOutcome {
        self.begin_with(key, new_task_id, || ())
    }

    /// Like [`IdempotencyIndex::begin`], but runs `create` while the entry
    /// lock is held when the claim succeeds.
    ///
    /// Task submission passes its task-row insertion as `create`: the row is
    /// visible before the claim is, so a concurrent submit that observes
    /// `InFlight` can always read the task it is being pointed at. `create`
    /// must not touch this index.
    pub fn begin_with(&self, key: IdemKey, new_task_id: &str, create: impl FnOnce()) -> BeginOutcome {
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                create();
                slot.insert(Entry {
                    task_id: new_task_id.to_string(),
                    state: EntryState::InFlight,
                });
                BeginOutcome::Created
            }
            dashmap::mapref::entry::Entry::Occupied(slot) => match slot.get().state {
                EntryState::InFlight => BeginOutcome::InFlight(slot.get().task_id.clone()),
                EntryState::Terminal => BeginOutcome::Terminal(slot.get().task_id.clone()),
            },
        }
    }

    /// Flip `key` from in-flight to terminal once its task completes
    pub fn finalize(&self, key: &IdemKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.state = EntryState::Terminal;
        }
    }

    /// Drop `key` entirely.
    ///
    /// Used by the retention sweep, and by submit when task creation fails
    /// before dispatch (the caller may retry with the same request id).
    pub fn forget(&self, key: &IdemKey) {
        if self.entries.remove(key).is_some() {
            debug!(owner_id = %key.owner_id, request_id = %key.request_id, "Forgot idempotency entry");
        }
    }

    /// Task id currently registered for `key`, if any
    #[must_use]
    pub fn task_id(&self, key: &IdemKey) -> Option<String> {
        self.entries.get(key).map(|e| e.task_id.clone())
    }

    /// Current number of tracked entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Return `true` when the index is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn key(owner: &str, request: &str) -> IdemKey {
        IdemKey::new(owner, request).expect("non-empty request id")
    }

    // ── IdemKey ───────────────────────────────────────────────────────────────

    #[test]
    fn empty_request_id_bypasses_index() {
        // GIVEN: an empty or whitespace request id
        // WHEN: building a key
        // THEN: no key is produced
        assert!(IdemKey::new("acct-1", "").is_none());
        assert!(IdemKey::new("acct-1", "   ").is_none());
    }

    #[test]
    fn request_id_is_trimmed() {
        // GIVEN: a request id with surrounding whitespace
        // WHEN: building keys with and without the whitespace
        // THEN: both map to the same key
        assert_eq!(key("acct-1", " req-1 "), key("acct-1", "req-1"));
    }

    // ── begin ─────────────────────────────────────────────────────────────────

    #[test]
    fn begin_creates_for_unknown_key() {
        // GIVEN: an empty index
        // WHEN: beginning a new key
        // THEN: Created, and the task id is registered
        let index = IdempotencyIndex::new();
        let outcome = index.begin(key("acct-1", "req-1"), "task-1");
        assert_eq!(outcome, BeginOutcome::Created);
        assert_eq!(index.task_id(&key("acct-1", "req-1")).as_deref(), Some("task-1"));
    }

    #[test]
    fn begin_reports_in_flight_task() {
        // GIVEN: a key already claimed and not yet finalized
        // WHEN: beginning the same key again
        // THEN: InFlight with the original task id
        let index = IdempotencyIndex::new();
        index.begin(key("acct-1", "req-1"), "task-1");
        let outcome = index.begin(key("acct-1", "req-1"), "task-2");
        assert_eq!(outcome, BeginOutcome::InFlight("task-1".into()));
    }

    #[test]
    fn begin_reports_terminal_task() {
        // GIVEN: a key whose task has been finalized
        // WHEN: beginning the same key again
        // THEN: Terminal with the original task id (idempotent replay)
        let index = IdempotencyIndex::new();
        index.begin(key("acct-1", "req-1"), "task-1");
        index.finalize(&key("acct-1", "req-1"));
        let outcome = index.begin(key("acct-1", "req-1"), "task-2");
        assert_eq!(outcome, BeginOutcome::Terminal("task-1".into()));
    }

    #[test]
    fn keys_are_owner_scoped() {
        // GIVEN: the same request id under two owners
        // WHEN: both begin
        // THEN: both are Created (distinct tasks)
        let index = IdempotencyIndex::new();
        assert_eq!(index.begin(key("acct-1", "req-1"), "task-1"), BeginOutcome::Created);
        assert_eq!(index.begin(key("acct-2", "req-1"), "task-2"), BeginOutcome::Created);
        assert_eq!(index.len(), 2);
    }

    // ── forget ────────────────────────────────────────────────────────────────

    #[test]
    fn forget_makes_key_reusable() {
        // GIVEN: a claimed key
        // WHEN: forgetting it
        // THEN: a new begin is Created again
        let index = IdempotencyIndex::new();
        index.begin(key("acct-1", "req-1"), "task-1");
        index.forget(&key("acct-1", "req-1"));
        assert_eq!(index.begin(key("acct-1", "req-1"), "task-2"), BeginOutcome::Created);
    }

    // ── concurrency ───────────────────────────────────────────────────────────

    #[test]
    fn concurrent_begins_admit_exactly_one_created() {
        // GIVEN: many threads racing on the same key with distinct task ids
        // WHEN: all call begin concurrently
        // THEN: exactly one observes Created
        let index = Arc::new(IdempotencyIndex::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let index = Arc::clone(&index);
                thread::spawn(move || {
                    index.begin(key("acct-1", "req-race"), &format!("task-{i}"))
                })
            })
            .collect();

        let outcomes: Vec<BeginOutcome> = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .collect();

        let created = outcomes
            .iter()
            .filter(|o| matches!(o, BeginOutcome::Created))
            .count();
        assert_eq!(created, 1);
        assert_eq!(index.len(), 1);
    }
}
