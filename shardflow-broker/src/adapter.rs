// shardflow-broker/src/adapter.rs
// ============================================================================
// Module: Broker Adapter
// Description: Composite publisher wiring the engine to one sink backend.
// Purpose: Implement the engine's publisher contract over interchangeable
//          bus backends.
// Dependencies: shardflow-core, crate::{payload, sink}
// ============================================================================

//! ## Overview
//! `EventBusAdapter` is the thin shim between the engine and a bus backend.
//! It renders event records into wire envelopes and delivers them through
//! the configured sink. Delivery failures surface as publish errors; the
//! engine's event log keeps failed events buffered in the status store and
//! drains them once the sink recovers, so bus loss never halts a migration.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use shardflow_core::EventRecord;
use shardflow_core::interfaces::EventPublisher;
use shardflow_core::interfaces::PublishError;
use thiserror::Error;

use crate::payload::EventEnvelope;
use crate::sink::Sink;

// ============================================================================
// SECTION: Adapter Errors
// ============================================================================

/// Errors raised assembling the adapter.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// No sink was configured.
    #[error("event bus adapter has no sink configured")]
    MissingSink,
}

// ============================================================================
// SECTION: Adapter
// ============================================================================

/// Builder for the event bus adapter.
#[derive(Default)]
pub struct EventBusAdapterBuilder {
    /// Configured sink.
    sink: Option<Arc<dyn Sink>>,
}

impl EventBusAdapterBuilder {
    /// Registers the sink used for delivery.
    #[must_use]
    pub fn sink(mut self, sink: impl Sink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Builds the adapter.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::MissingSink`] when no sink is configured.
    pub fn build(self) -> Result<EventBusAdapter, AdapterError> {
        Ok(EventBusAdapter {
            sink: self.sink.ok_or(AdapterError::MissingSink)?,
        })
    }
}

/// Composite event bus adapter over one sink backend.
pub struct EventBusAdapter {
    /// Delivery sink.
    sink: Arc<dyn Sink>,
}

impl std::fmt::Debug for EventBusAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBusAdapter").finish_non_exhaustive()
    }
}

impl EventBusAdapter {
    /// Returns a builder for the adapter.
    #[must_use]
    pub fn builder() -> EventBusAdapterBuilder {
        EventBusAdapterBuilder::default()
    }
}

impl EventPublisher for EventBusAdapter {
    fn publish(&self, record: &EventRecord) -> Result<(), PublishError> {
        let envelope = EventEnvelope::from_record(record);
        self.sink.deliver(&envelope).map_err(|err| PublishError::Publish(err.to_string()))
    }
}
