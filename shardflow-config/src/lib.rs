// shardflow-config/src/lib.rs
// ============================================================================
// Module: Shardflow Config
// Description: Configuration crate for the migration coordinator.
// Purpose: Parse and validate operator configuration fail-closed.
// Dependencies: serde, shardflow-core, shardflow-engine, thiserror, toml
// ============================================================================

//! ## Overview
//! `shardflow-config` loads the coordinator's TOML configuration: store
//! connections per backend, topology source, parallelism, batch bounds,
//! lock TTL, event bus backend, rollback policy, and retry settings. All
//! inputs are untrusted: files are size-limited and every field is
//! validated against hard limits before the engine sees it.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use config::ConfigError;
pub use config::EngineSection;
pub use config::EventBusKind;
pub use config::EventBusSection;
pub use config::ShardEntry;
pub use config::ShardflowConfig;
pub use config::StatusStoreSection;
pub use config::StoresSection;
pub use config::TopologySection;
pub use config::TopologySource;
