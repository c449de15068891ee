//! Sidestep - interference-aware direct connections.
//!
//! A per-destination connection strategy that dials directly while grading
//! live signals of network interference (DNS poisoning, connection-level
//! tampering, forged responses) and exposes a detour decision for a
//! higher-level transport selector.

pub mod detect;
pub mod direct;
pub mod error;
pub mod eventual;
