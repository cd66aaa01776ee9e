//! Core library for the vpnctl session manager
//!
//! This crate provides the server catalog, the tunnel process controller,
//! the connection session state machine and the status fan-out used by
//! front-ends.

pub mod error;
pub mod types;

pub mod auth;
pub mod catalog;
pub mod config;
pub mod vpn;

/// Environment variable holding the log filter directive
pub const LOG_ENV: &str = "VPNCTL_LOG";

/// Initialize logging infrastructure
///
/// Sets up tracing with systemd journal logging when running under systemd.
/// Otherwise logs to stderr with pretty formatting. The filter comes from
/// `VPNCTL_LOG` and defaults to `info`.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    // Try to use systemd journal logging if available
    #[cfg(target_os = "linux")]
    {
        if std::env::var("JOURNAL_STREAM").is_ok() {
            let journal_layer = tracing_journald::layer()?;
            tracing_subscriber::registry()
                .with(journal_layer)
                .with(filter)
                .try_init()?;
            return Ok(());
        }
    }

    // Fallback to stderr logging with pretty formatting
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
        .with(filter)
        .try_init()?;

    Ok(())
}
