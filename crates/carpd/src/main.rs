//! carpd binary

use carpd::{Config, Daemon};

#[tokio::main]
async fn main() -> common::Result<()> {
    // Can't use tracing until the logging section is known
    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return Err(e.into());
        }
    };

    let level = config.logging.level.as_deref().unwrap_or("info");
    common::logging::init_with(level, config.logging.json());

    tracing::info!(
        interfaces = config.interfaces.len(),
        coordinators = config.coordinators.len(),
        "carpd starting"
    );

    Daemon::new(config).run().await
}
