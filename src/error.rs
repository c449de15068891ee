//! Error type shared by the dial, read, and write paths.

use std::io;
use std::time::Duration;

/// Errors delivered through a connection's result channels.
///
/// The detection-driven variants ([`DnsHijacked`](ConnError::DnsHijacked),
/// [`ResponseHijacked`](ConnError::ResponseHijacked)) override the
/// transport's own success signal: the underlying socket operation
/// succeeded, but the caller still sees a failure.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// Underlying socket failure, passed through verbatim.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The dial, or an operation waiting on the dial, exceeded the timeout.
    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),

    /// The dial landed on an address that does not belong to the
    /// legitimate destination.
    #[error("DNS hijacked")]
    DnsHijacked,

    /// The read returned bytes that look forged by an intermediary.
    #[error("response is hijacked")]
    ResponseHijacked,

    /// Only `"tcp"` targets can be dialed.
    #[error("unsupported network {0:?}")]
    UnsupportedNetwork(String),

    /// Operation on a closed connection.
    #[error("connection closed")]
    Closed,

    /// A second dial was triggered on the same connection.
    #[error("dial already triggered")]
    AlreadyDialed,
}
