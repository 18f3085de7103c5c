//! Common error types for the CARP workspace.

use std::fmt;

/// A specialized Result type for CARP daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type shared by the engine and the daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CARP error: {0}")]
    Carp(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new engine error.
    pub fn carp(msg: impl fmt::Display) -> Self {
        Error::Carp(msg.to_string())
    }

    /// Create a new transport error.
    pub fn transport(msg: impl fmt::Display) -> Self {
        Error::Transport(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }
}
