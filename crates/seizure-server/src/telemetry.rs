//! Logging setup for Seizure Server.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;

const DEFAULT_FILTER: &str = "info,seizure_server=debug,seizure_xmpp=debug";

/// Initialize the global tracing subscriber.
///
/// # Configuration
///
/// Environment variables:
/// - `RUST_LOG`: Log filter (default: info, debug for seizure crates)
pub fn init(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

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
                .with_target(true)
                .json()
                .with_current_span(true);
            registry.with(fmt_layer).try_init()?;
        }
    }

    tracing::info!(format = ?format, "Telemetry initialized");

    Ok(())
}
