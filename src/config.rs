//! Configuration management

use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Caller authentication configuration
    pub auth: AuthConfig,
    /// Worker identity store configuration
    pub identity: IdentityConfig,
    /// Dispatcher configuration
    pub dispatcher: DispatcherConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8400,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Caller authentication: static bearer tokens mapped to owner ids.
///
/// The dispatcher core only ever sees the resolved owner id. With auth
/// disabled every request resolves to `dev_owner_id` so owner scoping in
/// the task manager still applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable caller authentication
    pub enabled: bool,
    /// Accepted bearer tokens
    pub tokens: Vec<CallerToken>,
    /// Owner id assigned to all callers when auth is disabled
    pub dev_owner_id: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tokens: Vec::new(),
            dev_owner_id: "local-dev".to_string(),
        }
    }
}

/// One accepted caller token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerToken {
    /// Bearer token value
    pub token: String,
    /// Owner id the token resolves to
    pub owner_id: String,
}

/// Worker identity store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the durable identity store (JSON file)
    pub store_path: String,
    /// Key for the keyed secret hash. Supports `env:VAR_NAME` indirection
    /// so the key never has to live in the config file.
    pub hmac_key: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            store_path: "workers.json".to_string(),
            hmac_key: "env:SANDBOX_GATEWAY_HMAC_KEY".to_string(),
        }
    }
}

impl IdentityConfig {
    /// Resolve the HMAC key, expanding `env:` indirection
    pub fn resolve_hmac_key(&self) -> Result<Vec<u8>> {
        if let Some(var) = self.hmac_key.strip_prefix("env:") {
            let value = std::env::var(var)
                .map_err(|_| Error::Config(format!("HMAC key env var not set: {var}")))?;
            Ok(value.into_bytes())
        } else if self.hmac_key.is_empty() {
            Err(Error::Config("identity.hmac_key must not be empty".into()))
        } else {
            Ok(self.hmac_key.clone().into_bytes())
        }
    }
}

/// Dispatcher tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Heartbeat silence after which a worker is reported offline
    #[serde(with = "humantime_serde")]
    pub offline_ttl: Duration,
    /// Online workers silent longer than this count as stale in stats
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
    /// Task timeout applied when the request does not carry one
    #[serde(with = "humantime_serde")]
    pub default_task_timeout: Duration,
    /// Upper bound for caller-supplied task timeouts
    #[serde(with = "humantime_serde")]
    pub max_task_timeout: Duration,
    /// Lower bound for echo probe timeouts
    #[serde(with = "humantime_serde")]
    pub echo_timeout_min: Duration,
    /// Upper bound for echo probe timeouts
    #[serde(with = "humantime_serde")]
    pub echo_timeout_max: Duration,
    /// Completed tasks are evicted this long after completion
    #[serde(with = "humantime_serde")]
    pub task_retention: Duration,
    /// Interval of the retention sweep
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Heartbeat interval advertised to workers at hello-ack
    pub heartbeat_interval_secs: u64,
    /// Heartbeat jitter percentage advertised to workers
    pub heartbeat_jitter_pct: u8,
    /// Capabilities that must run on the caller's own workers
    pub owner_pinned_capabilities: Vec<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            offline_ttl: Duration::from_secs(60),
            stale_after: Duration::from_secs(30),
            default_task_timeout: Duration::from_secs(30),
            max_task_timeout: Duration::from_secs(600),
            echo_timeout_min: Duration::from_secs(1),
            echo_timeout_max: Duration::from_secs(30),
            task_retention: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            heartbeat_interval_secs: 15,
            heartbeat_jitter_pct: 20,
            owner_pinned_capabilities: vec!["hostExec".to_string()],
        }
    }
}

impl DispatcherConfig {
    /// Clamp a caller-supplied task timeout into the configured bounds.
    ///
    /// `None` selects the default timeout. An explicit zero is kept as-is:
    /// the task manager turns it into an immediate `timeout` without ever
    /// reserving capacity.
    #[must_use]
    pub fn clamp_task_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            None => self.default_task_timeout,
            Some(d) => d.min(self.max_task_timeout),
        }
    }

    /// Clamp an echo probe timeout into the configured echo range
    #[must_use]
    pub fn clamp_echo_timeout(&self, requested: Option<Duration>) -> Duration {
        let requested = requested.unwrap_or(self.echo_timeout_max);
        requested.clamp(self.echo_timeout_min, self.echo_timeout_max)
    }

    /// Is `capability` routed only to the caller's own workers?
    #[must_use]
    pub fn is_owner_pinned(&self, capability: &str) -> bool {
        self.owner_pinned_capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(capability))
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (SANDBOX_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("SANDBOX_GATEWAY_").split("__"));

        figment.extract().map_err(|e| Error::Config(e.to_string()))
    }

    /// Resolve a caller bearer token to its owner id.
    ///
    /// Returns `None` for unknown tokens. With auth disabled, every caller
    /// (token or not) resolves to the synthetic dev owner id.
    #[must_use]
    pub fn resolve_owner(&self, bearer: Option<&str>) -> Option<String> {
        if !self.auth.enabled {
            return Some(self.auth.dev_owner_id.clone());
        }
        let token = bearer?;
        self.auth
            .tokens
            .iter()
            .find(|t| t.token == token)
            .map(|t| t.owner_id.clone())
    }
}
