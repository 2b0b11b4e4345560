//! Gateway assembly and lifecycle
//!
//! Builds the dispatcher from configuration, serves the thin HTTP edge and
//! the worker WebSocket endpoint, and handles graceful shutdown. All
//! dispatch semantics live below in the dispatcher; this layer only
//! resolves owners and re-encodes results.

mod server;
mod ws;

pub use server::{AppState, create_router};

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use crate::clock::SystemClock;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::identity::{FileIdentityStore, IdentityStore, IdentityVerifier};
use crate::Result;

/// The assembled control plane
pub struct Gateway {
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
}

impl Gateway {
    /// Build a gateway from configuration.
    ///
    /// Opens the durable identity store and resolves the secret-hash key;
    /// everything else is process-local state.
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(FileIdentityStore::open(&config.identity.store_path)?);
        let hmac_key = config.identity.resolve_hmac_key()?;
        let verifier = Arc::new(IdentityVerifier::new(
            store as Arc<dyn IdentityStore>,
            hmac_key,
        ));
        let dispatcher = Dispatcher::new(verifier, Arc::new(SystemClock), config.dispatcher.clone());
        Ok(Self {
            config: Arc::new(config),
            dispatcher,
        })
    }

    /// The dispatcher behind this gateway
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Serve until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        self.dispatcher.start_background();

        let state = Arc::new(AppState {
            dispatcher: Arc::clone(&self.dispatcher),
            config: Arc::clone(&self.config),
        });
        let app = create_router(state);

        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(addr, "Dispatcher listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Dispatcher shutdown complete");
        Ok(())
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
