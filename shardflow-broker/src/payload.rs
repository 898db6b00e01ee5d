// shardflow-broker/src/payload.rs
// ============================================================================
// Module: Broker Payloads
// Description: Wire envelopes for outbound events and consumer dedupe.
// Purpose: Give both bus backends one stable wire shape keyed per migration.
// Dependencies: serde, serde_json, shardflow-core
// ============================================================================

//! ## Overview
//! Outbound lifecycle events travel as [`EventEnvelope`]s: the wire type is
//! `migration.<kind>`, the ordering key is the migration id, and the event
//! id drives consumer-side dedupe under at-least-once delivery.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use shardflow_core::EventId;
use shardflow_core::EventRecord;
use shardflow_core::MigrationId;
use shardflow_core::Timestamp;

// ============================================================================
// SECTION: Event Envelope
// ============================================================================

/// Wire envelope for one outbound lifecycle event.
///
/// # Invariants
/// - `wire_type` is `migration.<kind>` for the kinds of the event model.
/// - `migration_id` is the per-key ordering key on every backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Outbound message type.
    #[serde(rename = "type")]
    pub wire_type: String,
    /// Event identifier for consumer dedupe.
    pub event_id: EventId,
    /// Ordering key.
    pub migration_id: MigrationId,
    /// Event timestamp.
    pub timestamp: Timestamp,
    /// Kind-specific details.
    pub details: Value,
}

impl EventEnvelope {
    /// Builds the wire envelope for an event record.
    #[must_use]
    pub fn from_record(record: &EventRecord) -> Self {
        Self {
            wire_type: record.kind.wire_type(),
            event_id: record.event_id.clone(),
            migration_id: record.migration_id.clone(),
            timestamp: record.timestamp,
            details: record.payload.clone(),
        }
    }
}

// ============================================================================
// SECTION: Consumer Dedupe
// ============================================================================

/// Event-id dedupe for at-least-once consumers.
#[derive(Debug, Default, Clone)]
pub struct EventDeduper {
    /// Seen event ids.
    seen: BTreeSet<String>,
}

impl EventDeduper {
    /// Creates an empty deduper.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an envelope; returns false for a duplicate delivery.
    pub fn observe(&mut self, envelope: &EventEnvelope) -> bool {
        self.seen.insert(envelope.event_id.as_str().to_string())
    }
}
