//! Sandbox Gateway Library
//!
//! Control-plane dispatcher for a self-hosted code-execution sandbox
//! platform.
//!
//! # Features
//!
//! - **Worker registry**: heartbeat-driven liveness with derived status
//! - **Capability routing**: per-capability inflight limits, never exceeded
//! - **Task lifecycle**: sync and async submission, cancellation, retention
//! - **Idempotency**: tenant-scoped request-id replay protection
//! - **Worker channel**: bi-directional WebSocket frame protocol
//! - **Echo fast-path**: task-free connectivity probe

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod idempotency;
pub mod inflight;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod task;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
