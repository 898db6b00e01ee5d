// shardflow-core/src/core/state.rs
// ============================================================================
// Module: Shardflow Migration State
// Description: Migration records, state machine, and per-shard progress.
// Purpose: Capture the durable execution state driven by the orchestrator.
// Dependencies: serde, crate::core
// ============================================================================

//! ## Overview
//! A [`MigrationRecord`] is the live execution record of one migration; a
//! [`ShardProgress`] tracks one `(migration, step, shard)` unit. Records are
//! mutated exclusively through the status store's append-or-CAS operations
//! and are never destroyed; terminal records remain for audit. The legal
//! state-machine walks are encoded in [`MigrationState::can_transition_to`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::error::ErrorClass;
use crate::core::hashing::HashDigest;
use crate::core::identifiers::IdempotencyKey;
use crate::core::identifiers::MigrationId;
use crate::core::identifiers::OwnerToken;
use crate::core::identifiers::RequestId;
use crate::core::identifiers::ShardId;
use crate::core::identifiers::StepId;
use crate::core::identifiers::StreamCursor;
use crate::core::request::StoreClass;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Migration State Machine
// ============================================================================

/// Migration lifecycle state.
///
/// # Invariants
/// - Variants are stable for serialization and contract matching.
/// - Legal transitions are encoded in [`MigrationState::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// Record created, not yet planned.
    Created,
    /// Planner is materializing the plan.
    Planning,
    /// Plan stored; waiting for leases and pre-validation.
    Pending,
    /// Stages are executing.
    Running,
    /// Post-validation in progress.
    Validating,
    /// Terminal success.
    Completed,
    /// A fatal step or validation failure was observed.
    Failing,
    /// Compensations are being applied in reverse completion order.
    RollingBack,
    /// Terminal: compensations applied.
    RolledBack,
    /// External cancel observed; draining in-flight batches.
    Cancelling,
    /// Terminal: cancelled.
    Cancelled,
    /// Terminal failure (structural error, halt policy, or unrecoverable rollback).
    Failed,
}

impl MigrationState {
    /// Returns true for terminal states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack | Self::Cancelled | Self::Failed)
    }

    /// Returns true when the transition to `next` is legal.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Created, Self::Planning)
            | (Self::Planning, Self::Pending)
            | (Self::Pending, Self::Running)
            | (Self::Running, Self::Validating)
            | (Self::Validating, Self::Completed)
            | (Self::Pending | Self::Running | Self::Validating, Self::Failing)
            | (Self::Failing, Self::RollingBack)
            | (Self::RollingBack, Self::RolledBack)
            | (Self::Failing | Self::RollingBack, Self::Failed)
            | (Self::Planning | Self::Pending, Self::Failed)
            | (Self::Cancelling, Self::Cancelled) => true,
            (from, Self::Cancelling) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Returns a stable label for the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Planning => "planning",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Validating => "validating",
            Self::Completed => "completed",
            Self::Failing => "failing",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

// ============================================================================
// SECTION: Failure Detail
// ============================================================================

/// Failure detail stored on the migration record and in the failed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    /// Offending step, when known.
    pub step_id: Option<StepId>,
    /// Offending shard, when known.
    pub shard_id: Option<ShardId>,
    /// Error class per the taxonomy.
    pub class: ErrorClass,
    /// Underlying error message.
    pub message: String,
}

// ============================================================================
// SECTION: Aggregate Counters
// ============================================================================

/// Aggregate counters maintained on the migration record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCounters {
    /// Total planned steps.
    pub steps_total: u64,
    /// Steps that reached `completed` or `skipped`.
    pub steps_completed: u64,
    /// Sum of per-shard items processed.
    pub items_processed: u64,
}

// ============================================================================
// SECTION: Migration Record
// ============================================================================

/// Final outcome recorded on terminal migrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// Migration completed and validated.
    Completed,
    /// Migration rolled back after failure.
    RolledBack,
    /// Migration was cancelled.
    Cancelled,
    /// Migration failed; lists steps whose compensation was unavailable.
    Failed {
        /// Steps whose rollback was unrecoverable.
        unrecoverable_steps: Vec<StepId>,
    },
}

/// Live execution record for one migration.
///
/// # Invariants
/// - `version` increments on every CAS mutation.
/// - `state` only changes along legal state-machine walks.
/// - Terminal records are never destroyed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Migration identifier.
    pub migration_id: MigrationId,
    /// Originating request identifier.
    pub request_id: RequestId,
    /// Human-readable name from the request.
    pub name: String,
    /// Target store class.
    pub store_class: StoreClass,
    /// Idempotency key from the request.
    pub idempotency_key: IdempotencyKey,
    /// Current lifecycle state.
    pub state: MigrationState,
    /// Digest of the stored plan, set once planning completes.
    pub plan_digest: Option<HashDigest>,
    /// Coordinator ownership token.
    pub owner_token: OwnerToken,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Execution start timestamp.
    pub started_at: Option<Timestamp>,
    /// Terminal timestamp.
    pub ended_at: Option<Timestamp>,
    /// Zero-based index of the stage currently executing.
    pub current_stage: Option<usize>,
    /// Aggregate counters.
    pub counters: AggregateCounters,
    /// Final outcome for terminal records.
    pub outcome: Option<MigrationOutcome>,
    /// Last recorded failure.
    pub error: Option<FailureDetail>,
    /// CAS version.
    pub version: u64,
}

impl MigrationRecord {
    /// Returns true when the record is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns true when this record's locks may be revoked.
    ///
    /// Terminal migrations release their leases, with one exception: a
    /// failure with unrecoverable rollback steps keeps its locks until an
    /// operator acknowledges the damage.
    #[must_use]
    pub fn locks_revocable(&self) -> bool {
        if !self.is_terminal() {
            return false;
        }
        !matches!(
            &self.outcome,
            Some(MigrationOutcome::Failed {
                unrecoverable_steps,
            }) if !unrecoverable_steps.is_empty()
        )
    }
}

// ============================================================================
// SECTION: Shard Progress
// ============================================================================

/// Per-shard step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    /// Not yet dispatched.
    Pending,
    /// An executor owns the unit.
    Running,
    /// Step completed on this shard.
    Completed,
    /// Step failed on this shard.
    Failed,
    /// Step skipped (already satisfied).
    Skipped,
}

impl ProgressStatus {
    /// Returns true when no further work is required for the unit.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// Progress record for one `(migration, step, shard)` unit.
///
/// # Invariants
/// - At most one record per key is `running` at any instant.
/// - `items_processed` is monotonically non-decreasing, including across resume.
/// - `last_checkpoint` only advances after the batch it describes is durable
///   at the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardProgress {
    /// Owning migration.
    pub migration_id: MigrationId,
    /// Planned step identifier.
    pub step_id: StepId,
    /// Target shard.
    pub shard_id: ShardId,
    /// Unit status.
    pub status: ProgressStatus,
    /// Items processed so far.
    pub items_processed: u64,
    /// Total items when known.
    pub total_items: Option<u64>,
    /// Opaque resume cursor.
    pub last_checkpoint: Option<StreamCursor>,
    /// Unit start timestamp.
    pub started_at: Option<Timestamp>,
    /// Unit end timestamp.
    pub ended_at: Option<Timestamp>,
    /// Failure message when `status` is `failed`.
    pub error: Option<String>,
    /// CAS version.
    pub version: u64,
}

impl ShardProgress {
    /// Creates a pending progress record for a unit.
    #[must_use]
    pub const fn pending(migration_id: MigrationId, step_id: StepId, shard_id: ShardId) -> Self {
        Self {
            migration_id,
            step_id,
            shard_id,
            status: ProgressStatus::Pending,
            items_processed: 0,
            total_items: None,
            last_checkpoint: None,
            started_at: None,
            ended_at: None,
            error: None,
            version: 0,
        }
    }
}
