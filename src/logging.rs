//! Global `tracing` subscriber setup.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Set to `json` for one JSON object per log line.
pub const LOG_FORMAT_ENV: &str = "FIRMCARVE_LOG_FORMAT";

/// Install the global subscriber. `RUST_LOG` selects levels (default
/// `info`). Calling this twice is harmless.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().json().with_target(false).with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).compact().with_writer(std::io::stderr))
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("logging already initialised");
    }
}
