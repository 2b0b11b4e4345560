//! Frame types carried over the worker channel
//!
//! Frames travel as JSON text messages on the bi-directional worker stream.
//! Command payload bodies are capability-specific JSON; the dispatcher
//! passes them through without inspection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One capability declaration inside a `hello` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDecl {
    /// Capability name (matched case-insensitively)
    pub name: String,
    /// Maximum concurrent commands the worker accepts for this capability
    pub max_inflight: u32,
}

/// Worker → dispatcher frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// First frame on a new channel; authenticates and registers the worker
    Hello(Hello),
    /// Periodic liveness signal
    Heartbeat(Heartbeat),
    /// Completion of a previously dispatched command
    CommandResult(CommandResult),
}

/// Dispatcher → worker frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatcherFrame {
    /// Accepts a `hello` and issues the session id
    HelloAck(HelloAck),
    /// Acknowledges a heartbeat
    HeartbeatAck(HeartbeatAck),
    /// Dispatches one command to the worker
    CommandDispatch(CommandDispatch),
}

/// Worker registration frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// Stable worker node id
    pub node_id: String,
    /// Human-readable worker name
    pub node_name: String,
    /// Executor kind (e.g. `python-sandbox`, `shell-container`, `host-shell`)
    pub executor_kind: String,
    /// Capabilities the worker serves, with per-capability limits
    pub capabilities: Vec<CapabilityDecl>,
    /// Free-form labels; `owner_id` and `worker_type` are significant
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Worker semantic version
    pub version: String,
    /// Shared secret presented for identity verification
    pub worker_secret: String,
}

/// Session grant returned for an accepted `hello`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAck {
    /// Fresh session id; every subsequent inbound frame must carry it
    pub session_id: String,
    /// Interval at which the worker should heartbeat
    pub heartbeat_interval_secs: u64,
    /// Jitter percentage the worker should apply to the interval
    pub heartbeat_jitter_pct: u8,
    /// Protocol version the dispatcher speaks
    pub protocol_version: String,
}

/// Liveness signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Worker node id
    pub node_id: String,
    /// Session id issued at hello-ack
    pub session_id: String,
}

/// Heartbeat acknowledgement
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatAck {}

/// One command dispatched to a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDispatch {
    /// Correlates the eventual `command-result`
    pub command_id: String,
    /// Capability the payload targets
    pub capability: String,
    /// Capability-specific payload, passed through opaquely
    pub payload: Value,
}

/// Completion frame for a dispatched command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Id of the command this result answers
    pub command_id: String,
    /// Capability-specific result payload, present on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Error pair, present on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
    /// Worker-side completion timestamp (millis since epoch)
    pub completed_unix_ms: i64,
}

/// Worker-reported command failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandError {
    /// Machine-readable code (`session_not_found`, `session_busy`,
    /// `invalid_payload`, or capability-specific)
    pub code: String,
    /// Human-readable message
    pub message: String,
}
