//! carpd: CARP failover daemon.
//!
//! Reads a YAML description of parent links and carp interfaces, opens raw
//! CARP sockets on every parent and runs the engine until SIGINT or SIGTERM.
//! On shutdown every master bows out so a backup takes over at once.

pub mod config;
pub mod daemon;
pub mod metrics_server;

pub use config::{Config, ConfigError};
pub use daemon::{Daemon, apply_config};
pub use metrics_server::MetricsServer;
