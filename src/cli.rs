//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// Control-plane dispatcher for a self-hosted code-execution sandbox platform
#[derive(Parser, Debug)]
#[command(name = "sandbox-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "SANDBOX_GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "SANDBOX_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "SANDBOX_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "SANDBOX_GATEWAY_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "SANDBOX_GATEWAY_LOG_FORMAT")]
    pub log_format: Option<String>,
}
