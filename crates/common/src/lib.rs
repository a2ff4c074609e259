//! Shared types for the placement-relay workspace.
//!
//! Both the coordinator and the edge agent depend on this crate so that the
//! snapshot model and its wire encoding can never drift apart.

#![warn(missing_docs)]

/// Placement snapshot DTOs.
pub mod api;
/// Length-prefixed JSON framing used between coordinator and agents.
pub mod wire;
/// Build metadata generated at compile time.
pub mod version;
