//! Transport error types.

use std::io;

use thiserror::Error;

use crate::address::Address;

/// Errors raised by the TCP transport.
///
/// Only [`TransportError::Bind`] and [`TransportError::Config`] are returned
/// to callers directly. Everything else is recovered inside the owning
/// session and surfaces on the bus as a disconnect event (and, for dialed
/// connections, as a [`crate::DialerEvent::Error`]).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The listener could not bind its socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested bind address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The dialer could not connect.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Requested remote address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The dialer gave up waiting for the connection.
    #[error("timed out connecting to {addr} after {timeout_ms}ms")]
    ConnectTimeout {
        /// Requested remote address.
        addr: String,
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// I/O failure on an established connection.
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    /// The peer sent bytes the codec cannot decode.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The peer sent a wildcard address in `to` or `from`.
    #[error("wildcard address from peer: {address}")]
    WildcardViolation {
        /// Offending address.
        address: Address,
    },

    /// The outbound queue for the session is full.
    #[error("outbound queue full")]
    Backpressure,

    /// The session is already closed.
    #[error("session closed")]
    Closed,

    /// Invalid transport configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Convenience alias for transport results.
pub type Result<T, E = TransportError> = std::result::Result<T, E>;
