// shardflow-engine/src/events.rs
// ============================================================================
// Module: Engine Event Log
// Description: Durable-first lifecycle event emission with bus drain.
// Purpose: Record every event in the status store, then publish it
//          at-least-once without letting bus loss halt a migration.
// Dependencies: serde_json, shardflow-core, crate::clock
// ============================================================================

//! ## Overview
//! Events are appended to the status store before any publish attempt, so
//! the audit trail survives bus outages. A successful publish marks the
//! event; failed publishes leave it buffered for [`EventLog::drain`], which
//! republishes unpublished events in append order (preserving per-migration
//! ordering). Event identifiers embed the coordinator's owner token, keeping
//! them unique across crash-restarted coordinators.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde_json::Value;
use shardflow_core::EventId;
use shardflow_core::EventKind;
use shardflow_core::EventRecord;
use shardflow_core::MigrationId;
use shardflow_core::OwnerToken;
use shardflow_core::StatusStore;
use shardflow_core::StatusStoreError;
use shardflow_core::interfaces::EventPublisher;

use crate::clock::Clock;

// ============================================================================
// SECTION: Event Log
// ============================================================================

/// Durable-first event emitter shared by the orchestrator and executors.
pub struct EventLog {
    /// Status store holding the durable event history.
    status: Arc<dyn StatusStore>,
    /// Bus publisher; failures are buffered, never fatal.
    publisher: Arc<dyn EventPublisher>,
    /// Timestamp source.
    clock: Arc<dyn Clock>,
    /// Coordinator owner token embedded in event identifiers.
    owner: OwnerToken,
    /// Per-coordinator event sequence.
    sequence: AtomicU64,
}

impl EventLog {
    /// Creates an event log for one coordinator instance.
    #[must_use]
    pub fn new(
        status: Arc<dyn StatusStore>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        owner: OwnerToken,
    ) -> Self {
        Self {
            status,
            publisher,
            clock,
            owner,
            sequence: AtomicU64::new(0),
        }
    }

    /// Appends and publishes one lifecycle event.
    ///
    /// The append is mandatory; the publish is best-effort and drained later
    /// on failure.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when the durable append fails.
    pub async fn emit(
        &self,
        migration_id: &MigrationId,
        kind: EventKind,
        payload: Value,
    ) -> Result<(), StatusStoreError> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let record = EventRecord::new(
            EventId::new(format!("{}:{migration_id}:{sequence}", self.owner)),
            migration_id.clone(),
            kind,
            self.clock.now(),
            payload,
        );
        self.status.append_event(&record).await?;
        if self.publisher.publish(&record).is_ok() {
            self.status.mark_event_published(&record.event_id).await?;
        }
        Ok(())
    }

    /// Republishes buffered events in append order.
    ///
    /// Stops at the first publish failure to preserve per-migration order.
    /// Returns the number of events drained.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when reading or marking events fails.
    pub async fn drain(&self, limit: usize) -> Result<usize, StatusStoreError> {
        let pending = self.status.unpublished_events(limit).await?;
        let mut drained = 0;
        for record in pending {
            if self.publisher.publish(&record).is_err() {
                break;
            }
            self.status.mark_event_published(&record.event_id).await?;
            drained += 1;
        }
        Ok(drained)
    }
}
