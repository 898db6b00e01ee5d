// shardflow-broker/src/sink/mod.rs
// ============================================================================
// Module: Broker Sinks
// Description: Interchangeable delivery backends for outbound events.
// Purpose: Define the sink contract both bus backends implement.
// Dependencies: thiserror, crate::payload
// ============================================================================

//! ## Overview
//! A sink delivers one envelope to its backend. Both backends promise
//! at-least-once delivery with per-migration-id ordering; the engine keeps
//! events buffered in the status store until a sink accepts them, so a lost
//! bus never halts a migration.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

use crate::payload::EventEnvelope;

pub mod channel;
pub mod log;

pub use channel::ChannelSink;
pub use log::LogSink;

// ============================================================================
// SECTION: Sink Contract
// ============================================================================

/// Sink delivery errors.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The backend rejected or dropped the envelope.
    #[error("sink delivery failure: {0}")]
    Delivery(String),
    /// Writing the delivery record failed.
    #[error("sink log write failure: {0}")]
    LogWriteFailed(String),
}

/// Outbound event sink.
pub trait Sink: Send + Sync {
    /// Delivers one envelope.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] when delivery fails; the caller leaves the
    /// event buffered for a later drain.
    fn deliver(&self, envelope: &EventEnvelope) -> Result<(), SinkError>;
}
