//! Error taxonomy shared by routing, tending and the request engine.

use std::io;

use thiserror::Error;

/// Result code carried in a server response header.
pub type ResultCode = u8;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input detected before any network activity.
    #[error("client error: {0}")]
    Client(String),

    /// No node is known for the cluster yet.
    #[error("no node available to serve the request")]
    RoutingUnavailable,

    /// Transient transport failure (connect, read or write).
    #[error("connection error: {0}")]
    Connection(String),

    /// The server sent something we could not make sense of.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The request deadline elapsed.
    #[error("request timed out")]
    Timeout,

    /// Well-formed response carrying a non-zero result code.
    #[error("server returned result code {0}")]
    ServerStatus(ResultCode),

    /// The caller cancelled the request through its handle.
    #[error("request cancelled")]
    Cancelled,

    /// The cluster was closed while the request was outstanding.
    #[error("cluster closed")]
    ClusterClosed,
}

impl Error {
    pub(crate) fn client(message: impl Into<String>) -> Self {
        Error::Client(message.into())
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }

    /// Whether the request engine may retry the command on another node.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transient() {
        let err: Error = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(err.is_transient());
        assert!(!Error::ServerStatus(2).is_transient());
        assert!(!Error::Timeout.is_transient());
    }
}
