//! Shared types for the slipway deployment-orchestrator workspace.
//!
//! Keep cross-crate DTOs here so the orchestrator and external clients agree
//! on the wire format.

#![warn(missing_docs)]

/// Shared API DTOs for cross-crate use.
pub mod api;
