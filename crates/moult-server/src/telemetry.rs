//! Logging setup for Moult Server.
//!
//! # Configuration
//!
//! Environment variables:
//! - `RUST_LOG`: Log filter (default: `info,moult_server=debug,moult_handoff=debug,moult_cqrs=debug`)
//! - `MOULT_LOG_FORMAT`: `pretty` (default) or `json`

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;

const DEFAULT_FILTER: &str = "info,moult_server=debug,moult_handoff=debug,moult_cqrs=debug";

/// Install the global tracing subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true)
                .pretty();
            registry.with(fmt_layer).try_init()?;
        }
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true);
            registry.with(fmt_layer).try_init()?;
        }
    }

    tracing::info!(format = %format, "Telemetry initialized");
    Ok(())
}

/// Flush logging before exit.
///
/// The fmt layers write synchronously, so this only marks the end of the
/// process in the log.
pub fn shutdown() {
    tracing::info!("Telemetry shutdown complete");
}
