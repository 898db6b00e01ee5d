// shardflow-core/src/status/mod.rs
// ============================================================================
// Module: Shardflow Status Store Backends
// Description: Reference status store implementations.
// Purpose: Host the document-style in-memory backend.
// Dependencies: crate submodules
// ============================================================================

//! ## Overview
//! Status store backends implement [`crate::interfaces::StatusStore`]. The
//! in-memory backend lives here; the durable relational backend lives in the
//! `shardflow-status-sqlite` crate.

pub mod memory;

pub use memory::InMemoryStatusStore;
pub use memory::SharedStatusStore;
