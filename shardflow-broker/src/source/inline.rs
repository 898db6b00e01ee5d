// shardflow-broker/src/source/inline.rs
// ============================================================================
// Module: Broker Inline Source
// Description: Pre-seeded command source for tests and replays.
// Purpose: Yield a fixed command sequence in order.
// Dependencies: shardflow-core
// ============================================================================

//! ## Overview
//! `InlineSource` serves a fixed queue of command envelopes. Tests and
//! offline replays use it to drive the command loop deterministically.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::VecDeque;

use shardflow_core::interfaces::CommandEnvelope;
use shardflow_core::interfaces::CommandSource;

// ============================================================================
// SECTION: Inline Source
// ============================================================================

/// Pre-seeded command source.
#[derive(Debug, Default)]
pub struct InlineSource {
    /// Queued commands in arrival order.
    commands: VecDeque<CommandEnvelope>,
}

impl InlineSource {
    /// Creates a source over a fixed command sequence.
    #[must_use]
    pub fn new(commands: impl IntoIterator<Item = CommandEnvelope>) -> Self {
        Self {
            commands: commands.into_iter().collect(),
        }
    }
}

impl CommandSource for InlineSource {
    fn next_command(&mut self) -> Option<CommandEnvelope> {
        self.commands.pop_front()
    }
}
