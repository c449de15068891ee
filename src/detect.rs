//! Interference detection interface.
//!
//! The heuristics live outside this crate; a connection only consumes the
//! three judgments below and folds them into its detour decision. Handing
//! the detector in at construction (rather than reading a process-wide
//! global) lets tests substitute their own.

use tokio::net::TcpStream;

use crate::error::ConnError;

/// Interference judgments consumed by [`DirectConn`](crate::direct::DirectConn).
pub trait Detector: Send + Sync {
    /// Whether a freshly dialed connection landed on a poisoned address.
    fn dns_poisoned(&self, conn: &TcpStream) -> bool;

    /// Whether the shape of an error suggests network-level tampering.
    fn tampering_suspected(&self, err: &ConnError) -> bool;

    /// Whether response bytes look forged by an intermediary rather than
    /// sent by the genuine destination.
    fn fake_response(&self, data: &[u8]) -> bool;
}
