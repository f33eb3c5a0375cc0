use crate::{completion_queue::WCError, impl_into_io_error};
use std::io;
use thiserror::Error;

/// Broad class of an engine error.
///
/// Every `Error` maps onto exactly one kind, so callers can branch on the class
/// without matching on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Address or route resolution failed or timed out
    Resolution,
    /// Connection attempt rejected or failed
    Connect,
    /// Memory registration failed
    Registration,
    /// A work completion reported a non-success status
    Completion,
    /// A malformed header or chunked message
    Protocol,
    /// Allocation failed or a fixed capacity was exceeded
    Resource,
    /// The operation is not valid in the current connection state
    InvalidState,
    /// The transport provider rejected a call
    Provider,
}

/// Error returned by engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// Address or route resolution failed
    #[error("address or route resolution failed: {0}")]
    Resolution(String),
    /// Connection attempt failed
    #[error("connection attempt failed: {0}")]
    Connect(String),
    /// Memory registration failed
    #[error("memory registration failed: {0}")]
    Registration(String),
    /// Work completion error
    #[error("work completion failed: {0}")]
    Completion(#[from] WCError),
    /// Protocol format error
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Resource exhaustion
    #[error("resource exhausted: {0}")]
    Resource(String),
    /// Invalid state transition or operation
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Error reported by the transport provider
    #[error("transport provider error: {0}")]
    Provider(#[from] io::Error),
}

impl Error {
    /// The class of this error
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match *self {
            Self::Resolution(_) => ErrorKind::Resolution,
            Self::Connect(_) => ErrorKind::Connect,
            Self::Registration(_) => ErrorKind::Registration,
            Self::Completion(_) => ErrorKind::Completion,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Resource(_) => ErrorKind::Resource,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Provider(_) => ErrorKind::Provider,
        }
    }

    /// Shorthand for a protocol error
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Shorthand for an invalid state error
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

/// Result of engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl_into_io_error!(Error);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_follows_variant() {
        assert_eq!(
            Error::protocol("bad tag").kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            Error::from(WCError::LocLenErr).kind(),
            ErrorKind::Completion
        );
        let provider_err = io::Error::new(io::ErrorKind::NotConnected, "gone");
        assert_eq!(Error::from(provider_err).kind(), ErrorKind::Provider);
    }

    #[test]
    fn converts_into_io_error() {
        let err: io::Error = Error::invalid_state("closed").into();
        assert!(err.to_string().contains("closed"));
    }
}
