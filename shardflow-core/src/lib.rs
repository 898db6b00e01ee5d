// shardflow-core/src/lib.rs
// ============================================================================
// Module: Shardflow Core
// Description: Data model, interfaces, and reference backends.
// Purpose: Define the deterministic core the coordination engine drives.
// Dependencies: async-trait, serde, serde_jcs, serde_json, sha2, thiserror
// ============================================================================

//! ## Overview
//! `shardflow-core` holds the canonical data model of the migration
//! coordination service (requests, plans, migration state, per-shard
//! progress, events, locks), the backend-agnostic interfaces the engine
//! drives (store driver, status store, event bus, backup catalog), and the
//! in-memory reference implementations used by tests and demos.
//!
//! The core is deterministic: it never reads wall-clock time, never performs
//! ambient I/O, and all shared mutation flows through the status store's
//! append-or-CAS operations.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod driver;
pub mod interfaces;
pub mod status;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use crate::core::*;
pub use crate::driver::InMemoryStoreDriver;
pub use crate::interfaces::BackupCatalog;
pub use crate::interfaces::BackupError;
pub use crate::interfaces::CommandEnvelope;
pub use crate::interfaces::CommandSource;
pub use crate::interfaces::DriverConn;
pub use crate::interfaces::DriverError;
pub use crate::interfaces::EventPublisher;
pub use crate::interfaces::HealthStatus;
pub use crate::interfaces::MigrationCommand;
pub use crate::interfaces::MigrationFilter;
pub use crate::interfaces::NoBackupCatalog;
pub use crate::interfaces::NullPublisher;
pub use crate::interfaces::PublishError;
pub use crate::interfaces::RecordBatch;
pub use crate::interfaces::SchemaOutcome;
pub use crate::interfaces::StatusStore;
pub use crate::interfaces::StatusStoreError;
pub use crate::interfaces::StoreDriver;
pub use crate::interfaces::TxnSupport;
pub use crate::status::InMemoryStatusStore;
pub use crate::status::SharedStatusStore;
