//! Logging bootstrap for CARP components.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize tracing with an explicit fallback level and output format.
///
/// RUST_LOG still wins when it is set.
pub fn init_with(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}
