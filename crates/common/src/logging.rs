//! Logging setup
//!
//! `RUST_LOG` takes precedence when set; otherwise the configured default
//! filter applies. Initialization is fallible rather than panicking when a
//! global subscriber is already installed, so embedders that bring their
//! own tracing setup keep it.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global tracing subscriber
pub fn setup_logging(default_filter: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| {
            crate::Error::Config(format!(
                "Invalid log filter `{}`: {}",
                default_filter, e
            ))
        })?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| crate::Error::Other(format!("Logging already initialized: {}", e)))?;

    Ok(())
}
