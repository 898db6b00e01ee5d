// shardflow-status-sqlite/src/lib.rs
// ============================================================================
// Module: Shardflow SQLite Status Store
// Description: Durable relational status store backend.
// Purpose: Persist the coordinator's single source of truth on SQLite.
// Dependencies: async-trait, rusqlite, serde, serde_json, shardflow-core,
//               thiserror, tokio
// ============================================================================

//! ## Overview
//! `shardflow-status-sqlite` is the relational backend of the status store
//! contract: row-version CAS on migration records, fenced progress writes,
//! an append-only event history with publish flags, and the lock table with
//! per-resource fencing counters. Deployments that prefer the document
//! back-end semantics use the in-memory reference or their own store behind
//! the same contract.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod store;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use store::SqliteJournalMode;
pub use store::SqliteStatusConfig;
pub use store::SqliteStatusError;
pub use store::SqliteStatusStore;
pub use store::SqliteSyncMode;
