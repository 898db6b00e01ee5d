// shardflow-core/src/core/event.rs
// ============================================================================
// Module: Shardflow Lifecycle Events
// Description: Append-only lifecycle events for audit and progress replay.
// Purpose: Record every externally visible migration transition.
// Dependencies: serde, serde_json, crate::core
// ============================================================================

//! ## Overview
//! Events are the append-only audit trail of a migration. They are stored in
//! the status store first and published to the event bus at-least-once;
//! consumers dedupe by event id. Events for one migration are published in
//! state-transition order under the migration id as the ordering key.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::core::identifiers::EventId;
use crate::core::identifiers::MigrationId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Event Kind
// ============================================================================

/// Lifecycle event kind.
///
/// # Invariants
/// - Variants are stable for serialization and wire-type derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Migration record created.
    Created,
    /// Execution started.
    Started,
    /// A planned step started on a shard.
    StepStarted,
    /// Batch progress on a shard.
    Progress,
    /// A planned step completed on a shard.
    StepCompleted,
    /// A planned step failed on a shard.
    StepFailed,
    /// Post-validation failed.
    ValidationFailed,
    /// Migration failed.
    Failed,
    /// Migration rolled back.
    RolledBack,
    /// Migration completed.
    Completed,
    /// Migration cancelled.
    Cancelled,
}

impl EventKind {
    /// Returns a stable label for the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::StepStarted => "step_started",
            Self::Progress => "progress",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::ValidationFailed => "validation_failed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns the outbound wire type (`migration.<kind>`).
    #[must_use]
    pub fn wire_type(self) -> String {
        format!("migration.{}", self.as_str())
    }
}

// ============================================================================
// SECTION: Event Record
// ============================================================================

/// Append-only event record.
///
/// # Invariants
/// - `event_id` is unique; consumers dedupe on it.
/// - Records are never mutated after append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Event identifier.
    pub event_id: EventId,
    /// Owning migration.
    pub migration_id: MigrationId,
    /// Event kind.
    pub kind: EventKind,
    /// Event timestamp.
    pub timestamp: Timestamp,
    /// Kind-specific payload.
    pub payload: Value,
}

impl EventRecord {
    /// Creates a new event record.
    #[must_use]
    pub fn new(
        event_id: EventId,
        migration_id: MigrationId,
        kind: EventKind,
        timestamp: Timestamp,
        payload: Value,
    ) -> Self {
        Self {
            event_id,
            migration_id,
            kind,
            timestamp,
            payload,
        }
    }
}
