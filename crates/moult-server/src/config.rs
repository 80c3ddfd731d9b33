//! Server configuration from the command line and environment.
//!
//! # Command Line
//!
//! - `--listen <addr>`: bind address for a cold start. Default: `127.0.0.1:8080`
//! - `--snapshot <path>`: state snapshot location. Default: `moult-state.json`
//! - `--inherit-listener`: adopt the listening socket passed down by the
//!   previous generation instead of binding
//!
//! # Environment Variables
//!
//! - `MOULT_DRAIN_TIMEOUT_SECS`: how long to wait for open connections to
//!   close during a handoff. Default: `30`
//! - `MOULT_LOG_FORMAT`: `pretty` or `json`. Default: `pretty`
//! - `RUST_LOG`: log filter

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing::info;

/// Default connection drain timeout.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Command line of the server binary.
#[derive(Debug, Parser)]
#[command(name = "moult-server", version, about = "Gracefully restartable command/query server")]
pub struct Cli {
    /// Address to bind when not inheriting a listener
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Where application state is saved on shutdown and restored on start
    #[arg(long, default_value = "moult-state.json")]
    pub snapshot: PathBuf,

    /// Adopt the listener passed down by the previous process generation
    #[arg(long = "inherit-listener")]
    pub inherit_listener: bool,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MOULT_DRAIN_TIMEOUT_SECS must be a whole number of seconds, got {0:?}")]
    InvalidDrainTimeout(String),

    #[error("MOULT_LOG_FORMAT must be 'pretty' or 'json', got {0:?}")]
    InvalidLogFormat(String),
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_lowercase().as_str() {
            "pretty" | "" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(ConfigError::InvalidLogFormat(raw.to_string())),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Effective server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub snapshot_path: PathBuf,
    pub inherit_listener: bool,
    pub drain_timeout: Duration,
    pub log_format: LogFormat,
}

impl ServerConfig {
    /// Combine the command line with environment settings.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        Self::from_parts(
            cli,
            std::env::var("MOULT_DRAIN_TIMEOUT_SECS").ok(),
            std::env::var("MOULT_LOG_FORMAT").ok(),
        )
    }

    fn from_parts(
        cli: Cli,
        drain_timeout: Option<String>,
        log_format: Option<String>,
    ) -> Result<Self, ConfigError> {
        let drain_timeout = match drain_timeout {
            Some(raw) => raw
                .trim()
                .parse()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::InvalidDrainTimeout(raw))?,
            None => DEFAULT_DRAIN_TIMEOUT,
        };

        let log_format = match log_format {
            Some(raw) => LogFormat::parse(&raw)?,
            None => LogFormat::default(),
        };

        Ok(Self {
            listen: cli.listen,
            snapshot_path: cli.snapshot,
            inherit_listener: cli.inherit_listener,
            drain_timeout,
            log_format,
        })
    }

    /// Log the current server configuration.
    pub fn log_config(&self) {
        if self.inherit_listener {
            info!("Listener: inherited from previous generation");
        } else {
            info!("Listener: {}", self.listen);
        }
        info!("Snapshot: {}", self.snapshot_path.display());
        info!("Connection drain timeout: {}s", self.drain_timeout.as_secs());
        info!("Log format: {}", self.log_format);
    }

    /// Configuration for tests: ephemeral port, short drain timeout.
    #[cfg(test)]
    pub fn test(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            snapshot_path: snapshot_path.into(),
            inherit_listener: false,
            drain_timeout: Duration::from_secs(5),
            log_format: LogFormat::Pretty,
        }
    }
}
