// shardflow-broker/src/source/channel.rs
// ============================================================================
// Module: Broker Channel Source
// Description: In-process channel source for inbound commands.
// Purpose: Receive command envelopes pushed by an embedded transport.
// Dependencies: shardflow-core, tokio
// ============================================================================

//! ## Overview
//! `ChannelSource` drains a tokio unbounded channel without blocking; an
//! empty channel yields no command and the loop polls again later.

// ============================================================================
// SECTION: Imports
// ============================================================================

use shardflow_core::interfaces::CommandEnvelope;
use shardflow_core::interfaces::CommandSource;
use tokio::sync::mpsc;

// ============================================================================
// SECTION: Channel Source
// ============================================================================

/// In-process channel command source.
#[derive(Debug)]
pub struct ChannelSource {
    /// Inbound channel.
    receiver: mpsc::UnboundedReceiver<CommandEnvelope>,
}

impl ChannelSource {
    /// Creates a source and the sender commands are pushed through.
    #[must_use]
    pub fn new() -> (mpsc::UnboundedSender<CommandEnvelope>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            sender,
            Self {
                receiver,
            },
        )
    }
}

impl CommandSource for ChannelSource {
    fn next_command(&mut self) -> Option<CommandEnvelope> {
        self.receiver.try_recv().ok()
    }
}
