//! Errors reported by the CARP engine.

use std::io;

/// A specialized Result type for administrative CARP operations.
pub type Result<T> = std::result::Result<T, CarpError>;

/// Administrative error. Packet processing never fails with one of these.
#[derive(Debug, thiserror::Error)]
pub enum CarpError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("vhid {0} is already in use")]
    DuplicateVhid(u8),

    #[error("advskew {skew} of vhid {vhid} is out of range")]
    SkewOutOfRange { vhid: u8, skew: u8 },

    #[error("too many vhids: {count} (at most {max})")]
    TooManyVhids { count: usize, max: usize },

    #[error("permission denied")]
    PermissionDenied,

    #[error("interface {0} is not multicast capable")]
    NotMulticastCapable(String),

    #[error("interface {0} cannot carry CARP")]
    UnsupportedInterface(String),

    #[error("no such interface: {0}")]
    NoSuchInterface(String),

    #[error("interface {0} already exists")]
    AlreadyExists(String),

    #[error("{0} is not attached to a parent interface")]
    NoParentInterface(String),

    #[error("address family not supported")]
    AddressFamilyNotSupported,
}

impl CarpError {
    pub fn invalid(msg: impl std::fmt::Display) -> Self {
        CarpError::InvalidArgument(msg.to_string())
    }
}

impl From<CarpError> for common::Error {
    fn from(err: CarpError) -> Self {
        common::Error::carp(err)
    }
}

/// Failure reported by a transport adapter while sending.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no buffer space available")]
    NoBuffers,

    #[error("host is down")]
    HostDown,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Classify an OS error the way the send path needs it.
    pub fn from_io(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOBUFS) => TransportError::NoBuffers,
            Some(libc::EHOSTDOWN) => TransportError::HostDown,
            _ => TransportError::Io(err),
        }
    }
}

impl From<TransportError> for common::Error {
    fn from(err: TransportError) -> Self {
        common::Error::transport(err)
    }
}
