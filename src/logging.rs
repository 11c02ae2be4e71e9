//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! The filter comes from the `DAGFLOW_LOG` environment variable using
//! `EnvFilter` directives (e.g. "debug" or "dagflow=trace"), defaulting to `info`.

use std::error::Error;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "DAGFLOW_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging() -> Result<(), Box<dyn Error + Send + Sync>> {
    let filter = filter_from(std::env::var(LOG_ENV).ok().as_deref());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init()
}

/// Unparseable or missing directives fall back to `info`.
fn filter_from(raw: Option<&str>) -> EnvFilter {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| EnvFilter::try_new(s).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}
