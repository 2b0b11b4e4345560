//! Worker session layer
//!
//! One session per live worker channel. The session owns the write side of
//! the channel (a single serialized sender, drained by the connection's
//! writer task) and the pending-command exchange for everything dispatched
//! on it. The manager enforces single-session-per-node: a hello for a node
//! with a live session supersedes it atomically, failing its pending
//! commands with `session_closed`.

mod exchange;

pub use exchange::{CommandExchange, CommandOutcome, PendingHandle};

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::DispatcherConfig;
use crate::identity::IdentityVerifier;
use crate::inflight::{InflightTable, ReservationGuard};
use crate::protocol::{
    CommandDispatch, CommandResult, DispatcherFrame, Heartbeat, HeartbeatAck, Hello, HelloAck,
    PROTOCOL_VERSION,
};
use crate::registry::{LABEL_OWNER_ID, LABEL_WORKER_TYPE, WorkerRegistry};
use crate::{Error, Result};

/// One live worker session
#[derive(Debug)]
pub struct Session {
    /// Session id issued at hello-ack
    pub session_id: String,
    /// Node the session belongs to
    pub node_id: String,
    outbound: mpsc::Sender<DispatcherFrame>,
    exchange: CommandExchange,
    closed: CancellationToken,
}

impl Session {
    /// Enqueue an outbound frame on the session's serialized writer
    pub async fn send(&self, frame: DispatcherFrame) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| Error::SessionClosed)
    }

    /// Dispatch a command on this session.
    ///
    /// Installs the pending entry (taking ownership of the reservation
    /// guard), enqueues the `command-dispatch` frame, and returns the
    /// awaitable handle. On enqueue failure the entry resolves
    /// `session_closed` immediately and the reservation releases.
    pub async fn dispatch(
        &self,
        capability: &str,
        payload: Value,
        owner_id: &str,
        task_id: Option<&str>,
        guard: ReservationGuard,
    ) -> Result<PendingHandle> {
        if self.closed.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        let (command_id, handle) = self.exchange.install(capability, owner_id, task_id, guard);
        let frame = DispatcherFrame::CommandDispatch(CommandDispatch {
            command_id: command_id.clone(),
            capability: capability.to_string(),
            payload,
        });
        if self.send(frame).await.is_err() {
            self.exchange.resolve(&command_id, CommandOutcome::SessionClosed);
            return Err(Error::SessionClosed);
        }
        debug!(
            session_id = %self.session_id,
            node_id = %self.node_id,
            command_id,
            capability,
            "Dispatched command"
        );
        Ok(handle)
    }

    /// Resolve one pending command (cancel path)
    pub fn resolve(&self, command_id: &str, outcome: CommandOutcome) -> bool {
        self.exchange.resolve(command_id, outcome)
    }

    /// Number of unresolved commands on this session
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.exchange.len()
    }

    /// Token cancelled when the session ends; the connection's reader and
    /// writer tasks watch it to shut down.
    #[must_use]
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn close(&self) {
        self.closed.cancel();
        let failed = self.exchange.fail_all_closed();
        if failed > 0 {
            warn!(
                session_id = %self.session_id,
                node_id = %self.node_id,
                failed,
                "Failed pending commands on session close"
            );
        }
    }
}

/// Owns all live sessions; enforces the session protocol
pub struct SessionManager {
    registry: Arc<WorkerRegistry>,
    inflight: Arc<InflightTable>,
    verifier: Arc<IdentityVerifier>,
    clock: SharedClock,
    config: DispatcherConfig,
    by_session: DashMap<String, Arc<Session>>,
    by_node: DashMap<String, String>,
}

impl SessionManager {
    /// Create a session manager over the shared registry and inflight table
    pub fn new(
        registry: Arc<WorkerRegistry>,
        inflight: Arc<InflightTable>,
        verifier: Arc<IdentityVerifier>,
        clock: SharedClock,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            inflight,
            verifier,
            clock,
            config,
            by_session: DashMap::new(),
            by_node: DashMap::new(),
        }
    }

    /// Validate a hello's shape before touching identity or registry
    fn validate_hello(hello: &Hello) -> Result<()> {
        if hello.node_id.trim().is_empty() {
            return Err(Error::Protocol("hello without node_id".into()));
        }
        if hello.capabilities.is_empty() {
            return Err(Error::Protocol("hello declares no capabilities".into()));
        }
        for decl in &hello.capabilities {
            if decl.name.trim().is_empty() {
                return Err(Error::Protocol("empty capability name".into()));
            }
            if decl.max_inflight == 0 {
                return Err(Error::Protocol(format!(
                    "non-positive max_inflight for capability {}",
                    decl.name
                )));
            }
        }
        Ok(())
    }

    /// Accept a hello and open a session.
    ///
    /// Verifies identity, issues a fresh session id, registers the worker
    /// (superseding any prior session for the node), and resets the node's
    /// inflight cells. Returns the session and the `hello-ack` to send.
    pub async fn open(
        &self,
        mut hello: Hello,
        outbound: mpsc::Sender<DispatcherFrame>,
    ) -> Result<(Arc<Session>, HelloAck)> {
        Self::validate_hello(&hello)?;

        let verified = self
            .verifier
            .verify(&hello.node_id, &hello.worker_secret)
            .await?;

        // Ownership labels come from the verified identity, not from
        // whatever the worker claimed.
        hello
            .labels
            .insert(LABEL_OWNER_ID.to_string(), verified.owner_id.clone());
        hello.labels.insert(
            LABEL_WORKER_TYPE.to_string(),
            verified.worker_type.as_str().to_string(),
        );

        let session_id = Uuid::new_v4().to_string();
        let now = self.clock.now();

        let superseded = self.registry.upsert(&hello, &session_id, now);
        if let Some(old_session_id) = superseded {
            self.terminate(&old_session_id, "superseded by new hello");
        }
        self.inflight.reset_node(&hello.node_id, &hello.capabilities);

        let session = Arc::new(Session {
            session_id: session_id.clone(),
            node_id: hello.node_id.clone(),
            outbound,
            exchange: CommandExchange::new(),
            closed: CancellationToken::new(),
        });
        self.by_session.insert(session_id.clone(), Arc::clone(&session));
        self.by_node.insert(hello.node_id.clone(), session_id.clone());

        info!(
            node_id = %hello.node_id,
            session_id,
            capabilities = hello.capabilities.len(),
            owner_id = %verified.owner_id,
            "Session opened"
        );

        let ack = HelloAck {
            session_id,
            heartbeat_interval_secs: self.config.heartbeat_interval_secs,
            heartbeat_jitter_pct: self.config.heartbeat_jitter_pct,
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        Ok((session, ack))
    }

    /// Handle a heartbeat frame on `session_id`.
    ///
    /// A mismatched session id is a protocol violation; the caller must
    /// tear the channel down on error.
    pub fn handle_heartbeat(&self, session_id: &str, heartbeat: &Heartbeat) -> Result<HeartbeatAck> {
        if heartbeat.session_id != session_id {
            return Err(Error::SessionReplaced(heartbeat.node_id.clone()));
        }
        self.registry
            .heartbeat(&heartbeat.node_id, session_id, self.clock.now())?;
        Ok(HeartbeatAck {})
    }

    /// Handle a command-result frame arriving on `session_id`.
    ///
    /// Late results for commands that already timed out or were canceled
    /// are discarded silently.
    pub fn handle_result(&self, session_id: &str, result: CommandResult) -> Result<()> {
        let session = self
            .by_session
            .get(session_id)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| Error::Protocol("result on unknown session".into()))?;

        self.registry.touch(&session.node_id, self.clock.now());
        session.exchange.resolve_result(result);
        Ok(())
    }

    /// Fetch the live session for a node, if any
    #[must_use]
    pub fn session_for_node(&self, node_id: &str) -> Option<Arc<Session>> {
        let session_id = self.by_node.get(node_id)?.clone();
        self.by_session.get(&session_id).map(|s| Arc::clone(&s))
    }

    /// Fetch a session by id
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.by_session.get(session_id).map(|s| Arc::clone(&s))
    }

    /// Terminate one session: fail its pending commands, detach it from the
    /// worker record, and drop it from the maps.
    pub fn terminate(&self, session_id: &str, reason: &str) {
        let Some((_, session)) = self.by_session.remove(session_id) else {
            return;
        };
        session.close();
        self.registry.clear_session(&session.node_id, session_id);
        self.by_node
            .remove_if(&session.node_id, |_, live| live == session_id);
        info!(
            session_id,
            node_id = %session.node_id,
            reason,
            "Session terminated"
        );
    }

    /// Drop a worker entirely: registry record, live session, inflight cells
    pub fn drop_node(&self, node_id: &str) {
        let live = self.by_node.get(node_id).map(|s| s.clone());
        if let Some(session_id) = live {
            self.terminate(&session_id, "worker dropped");
        }
        self.registry.drop_worker(node_id);
        self.inflight.remove_node(node_id);
    }

    /// Number of live sessions
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.by_session.len()
    }
}
