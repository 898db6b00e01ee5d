// shardflow-broker/src/lib.rs
// ============================================================================
// Module: Shardflow Broker
// Description: Event bus adapter with interchangeable backends.
// Purpose: Publish lifecycle events and source migration commands.
// Dependencies: serde, serde_json, shardflow-core, thiserror, tokio
// ============================================================================

//! ## Overview
//! `shardflow-broker` adapts the engine's event and command contracts onto
//! interchangeable in-process backends: a channel sink/source pair for
//! embedded deployments and a JSON-lines log sink for audit pipelines. Both
//! deliver at-least-once with per-migration-id ordering; consumers dedupe by
//! event id with [`EventDeduper`]. The concrete broker wire protocols live
//! with their deployments behind the same [`Sink`] contract.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod adapter;
pub mod payload;
pub mod sink;
pub mod source;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use adapter::AdapterError;
pub use adapter::EventBusAdapter;
pub use adapter::EventBusAdapterBuilder;
pub use payload::EventDeduper;
pub use payload::EventEnvelope;
pub use sink::ChannelSink;
pub use sink::LogSink;
pub use sink::Sink;
pub use sink::SinkError;
pub use source::ChannelSource;
pub use source::InlineSource;
