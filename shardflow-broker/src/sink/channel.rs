// shardflow-broker/src/sink/channel.rs
// ============================================================================
// Module: Broker Channel Sink
// Description: In-process channel delivery backend.
// Purpose: Deliver envelopes over an unbounded channel for embedded
//          deployments and tests.
// Dependencies: tokio, crate::{payload, sink}
// ============================================================================

//! ## Overview
//! `ChannelSink` pushes envelopes into a tokio unbounded channel. Sends are
//! synchronous and ordered, so per-migration ordering holds trivially; a
//! closed receiver surfaces as a delivery failure and the events stay
//! buffered in the status store.

// ============================================================================
// SECTION: Imports
// ============================================================================

use tokio::sync::mpsc;

use crate::payload::EventEnvelope;
use crate::sink::Sink;
use crate::sink::SinkError;

// ============================================================================
// SECTION: Channel Sink
// ============================================================================

/// In-process channel sink.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    /// Delivery channel.
    sender: mpsc::UnboundedSender<EventEnvelope>,
}

impl ChannelSink {
    /// Creates a sink and the receiver its envelopes arrive on.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
            },
            receiver,
        )
    }
}

impl Sink for ChannelSink {
    fn deliver(&self, envelope: &EventEnvelope) -> Result<(), SinkError> {
        self.sender
            .send(envelope.clone())
            .map_err(|err| SinkError::Delivery(err.to_string()))
    }
}
