//! Core library for the tunwarden tunnel supervisor
//!
//! This crate keeps AmneziaWG tunnels alive across network changes: it
//! tracks tunnel state, selects the kernel or userspace engine, watches
//! connectivity and cycles running tunnels when the network changes.

pub mod error;
pub mod types;

pub mod backend;
pub mod config;
pub mod context;
pub mod network;
pub mod reconnection;
pub mod tunnel;

/// Environment variable holding the log level filter
pub const LOG_ENV: &str = "TUNWARDEN_LOG";

/// Initialize logging infrastructure
///
/// Sets up tracing with systemd journal logging when running under systemd.
/// Otherwise logs to stderr. The level comes from `TUNWARDEN_LOG` and
/// defaults to `info`.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let level = log_level_from_env();

    #[cfg(target_os = "linux")]
    {
        if std::env::var("JOURNAL_STREAM").is_ok() {
            let journal_layer = tracing_journald::layer()?;
            tracing_subscriber::registry()
                .with(journal_layer)
                .with(level)
                .try_init()?;
            return Ok(());
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(level)
        .try_init()?;

    Ok(())
}

fn log_level_from_env() -> tracing_subscriber::filter::LevelFilter {
    std::env::var(LOG_ENV)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO)
}
