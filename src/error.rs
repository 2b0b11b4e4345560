//! Error types for the sandbox gateway

use std::io;

use thiserror::Error;

/// Result type alias for the sandbox gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Sandbox gateway errors
///
/// The transport layer maps these onto HTTP statuses via [`Error::kind`];
/// the dispatcher core never speaks HTTP itself.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No online worker declares the requested capability
    #[error("No online worker for capability: {0}")]
    NoWorker(String),

    /// Every eligible worker is at its per-capability inflight limit
    #[error("No capacity for capability: {0}")]
    NoCapacity(String),

    /// Another in-flight task exists for the same (owner, request-id)
    #[error("Request already in progress: {0}")]
    RequestInProgress(String),

    /// Task does not exist, or exists under a different owner
    #[error("Task not found: {0}")]
    NotFound(String),

    /// Cancel attempted on a task already in a terminal state
    #[error("Task already terminal: {0}")]
    Terminal(String),

    /// Worker identity verification failed
    #[error("Unauthenticated worker")]
    Unauthenticated,

    /// Heartbeat or frame carried a session id that is no longer current
    #[error("Session replaced for node: {0}")]
    SessionReplaced(String),

    /// The worker session ended while a command was still pending
    #[error("Session closed")]
    SessionClosed,

    /// Local deadline elapsed before the worker returned a result
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Error returned by the worker, surfaced verbatim
    #[error("Worker error {code}: {message}")]
    Worker {
        /// Worker-supplied error code (e.g. `session_busy`, `invalid_payload`)
        code: String,
        /// Worker-supplied error message
        message: String,
    },

    /// No online worker declares the echo capability
    #[error("No echo worker online")]
    NoEchoWorker,

    /// Echo probe timed out
    #[error("Echo timed out")]
    EchoTimeout,

    /// Malformed or protocol-violating frame on a worker session
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a worker-surfaced error from a wire `(code, message)` pair
    pub fn worker(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Worker {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Stable snake_case kind string consumed by the transport for status
    /// mapping and recorded on failed tasks as the error code.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Config(_) => "config",
            Self::NoWorker(_) => "no_worker",
            Self::NoCapacity(_) => "no_capacity",
            Self::RequestInProgress(_) => "request_in_progress",
            Self::NotFound(_) => "not_found",
            Self::Terminal(_) => "terminal",
            Self::Unauthenticated => "unauthenticated",
            Self::SessionReplaced(_) => "session_replaced",
            Self::SessionClosed => "session_closed",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Worker { code, .. } => code,
            Self::NoEchoWorker => "no_echo_worker",
            Self::EchoTimeout => "echo_timeout",
            Self::Protocol(_) => "protocol",
            Self::Io(_) => "io",
            Self::Json(_) => "invalid_payload",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
