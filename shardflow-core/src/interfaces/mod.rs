// shardflow-core/src/interfaces/mod.rs
// ============================================================================
// Module: Shardflow Interfaces
// Description: Backend-agnostic contracts for drivers, status, events, backup.
// Purpose: Define the seams the coordination engine drives without embedding
//          backend-specific details.
// Dependencies: async-trait, serde, thiserror, crate::core
// ============================================================================

//! ## Overview
//! Interfaces define how the engine integrates with backing stores, the
//! status store, the event bus, and the backup collaborator. Implementations
//! must be deterministic where the contract says so and fail closed on
//! missing or invalid data. All mutation of shared state flows through the
//! status store's append-or-CAS operations.

// ============================================================================
// SECTION: Imports
// ============================================================================

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::error::Classify;
use crate::core::error::ErrorClass;
use crate::core::event::EventRecord;
use crate::core::identifiers::CollectionName;
use crate::core::identifiers::EventId;
use crate::core::identifiers::IdempotencyKey;
use crate::core::identifiers::MigrationId;
use crate::core::identifiers::OwnerToken;
use crate::core::identifiers::ShardId;
use crate::core::identifiers::SnapshotId;
use crate::core::identifiers::StepId;
use crate::core::identifiers::StreamCursor;
use crate::core::lock::FencingToken;
use crate::core::lock::LockRecord;
use crate::core::lock::LockResource;
use crate::core::plan::Plan;
use crate::core::record::Record;
use crate::core::request::MigrationRequest;
use crate::core::request::SchemaChange;
use crate::core::request::StoreClass;
use crate::core::state::MigrationRecord;
use crate::core::state::MigrationState;
use crate::core::state::ShardProgress;
use crate::core::time::Timestamp;
use crate::core::topology::ShardInfo;

// ============================================================================
// SECTION: Driver Capability Types
// ============================================================================

/// Backend health as observed over one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Backend is healthy.
    Ok,
    /// Backend is reachable but degraded; the batch pump backs off.
    Degraded,
    /// Backend is unreachable.
    Down,
}

/// Transaction capability of a backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnSupport {
    /// Multi-statement transactions via `begin`/`commit`/`rollback`.
    Multi,
    /// No multi-statement transactions; `apply_batch` is internally atomic
    /// (upsert-by-id with ordered acknowledgement).
    SingleBatch,
}

/// Outcome of a schema application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaOutcome {
    /// The change was applied by this call.
    Applied,
    /// The backend-native marker showed the change was already applied.
    AlreadyApplied,
}

/// One streamed batch of source records.
///
/// # Invariants
/// - The batch is snapshot-consistent for its cursor window.
/// - `next_cursor` of `None` means the stream is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    /// Batch records in cursor order.
    pub records: Vec<Record>,
    /// Cursor for the next batch, or `None` at end of stream.
    pub next_cursor: Option<StreamCursor>,
}

// ============================================================================
// SECTION: Driver Errors
// ============================================================================

/// Store driver errors.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Connection could not be established or was lost.
    #[error("driver connection error: {0}")]
    Connection(String),
    /// Backend call timed out.
    #[error("driver timeout: {0}")]
    Timeout(String),
    /// Backend asked for the call to be retried later.
    #[error("driver retry-later: {0}")]
    RetryLater(String),
    /// Schema change conflicts with the backend state.
    #[error("schema conflict: {0}")]
    SchemaConflict(String),
    /// Backend rejected the operation as invalid.
    #[error("driver rejected operation: {0}")]
    Rejected(String),
    /// Operation is unsupported by this backend.
    #[error("driver operation unsupported: {0}")]
    Unsupported(String),
}

impl Classify for DriverError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Connection(_) | Self::Timeout(_) | Self::RetryLater(_) => ErrorClass::Transient,
            Self::SchemaConflict(_) | Self::Rejected(_) => ErrorClass::Logical,
            Self::Unsupported(_) => ErrorClass::Structural,
        }
    }
}

// ============================================================================
// SECTION: Store Driver Contract
// ============================================================================

/// Capability each backing-store backend implements.
///
/// The orchestrator holds one driver per store class from configuration; all
/// backend-specific behavior stays behind this contract.
#[async_trait]
pub trait StoreDriver: Send + Sync {
    /// Acquires and health-checks a connection to one shard.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the shard is unreachable.
    async fn open(&self, shard: &ShardInfo) -> Result<Box<dyn DriverConn>, DriverError>;
}

/// One open connection to a shard.
#[async_trait]
pub trait DriverConn: Send {
    /// Returns the transaction capability of this connection.
    fn txn_support(&self) -> TxnSupport;

    /// Probes backend health; drives batch pump backoff.
    async fn health(&mut self) -> HealthStatus;

    /// Applies a schema change idempotently.
    ///
    /// Implementations must detect "already applied" via a backend-native
    /// marker and must be safe to retry after a partial crash.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the change cannot be applied.
    async fn apply_schema(
        &mut self,
        collection: &CollectionName,
        change: &SchemaChange,
    ) -> Result<SchemaOutcome, DriverError>;

    /// Applies the store-native down-migration of a schema change.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Unsupported`] when the change has no down
    /// definition.
    async fn revert_schema(
        &mut self,
        collection: &CollectionName,
        change: &SchemaChange,
    ) -> Result<SchemaOutcome, DriverError>;

    /// Streams the next batch from a collection.
    ///
    /// The cursor is opaque and shard-local; `None` starts from the
    /// beginning.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the read fails.
    async fn stream_batch(
        &mut self,
        collection: &CollectionName,
        cursor: Option<&StreamCursor>,
        size: usize,
    ) -> Result<RecordBatch, DriverError>;

    /// Applies transformed records all-or-nothing within one batch.
    ///
    /// Application is an upsert keyed by record id so duplicate replay after
    /// a crash is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the write fails; no partial batch may
    /// remain visible.
    async fn apply_batch(
        &mut self,
        collection: &CollectionName,
        records: &[Record],
    ) -> Result<u64, DriverError>;

    /// Opens a multi-statement transaction where supported.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Unsupported`] for single-batch backends.
    async fn begin(&mut self) -> Result<(), DriverError>;

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the commit fails.
    async fn commit(&mut self) -> Result<(), DriverError>;

    /// Rolls back the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the rollback fails.
    async fn rollback(&mut self) -> Result<(), DriverError>;

    /// Counts records in a collection; used by validation.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the count fails.
    async fn count(&mut self, collection: &CollectionName) -> Result<u64, DriverError>;

    /// Fetches records by id; used by the sampled correctness probe.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the read fails.
    async fn fetch(
        &mut self,
        collection: &CollectionName,
        ids: &[String],
    ) -> Result<Vec<Record>, DriverError>;

    /// Samples up to `limit` records in cursor order; used by validation.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the read fails.
    async fn sample(
        &mut self,
        collection: &CollectionName,
        limit: usize,
    ) -> Result<Vec<Record>, DriverError>;

    /// Returns all values of a field; used by cross-shard probes.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError`] when the read fails.
    async fn field_values(
        &mut self,
        collection: &CollectionName,
        field: &str,
    ) -> Result<Vec<Value>, DriverError>;
}

// ============================================================================
// SECTION: Status Store Errors
// ============================================================================

/// Status store errors.
#[derive(Debug, Error)]
pub enum StatusStoreError {
    /// A record with the same identity already exists.
    #[error("status record already exists: {0}")]
    AlreadyExists(String),
    /// The referenced record does not exist.
    #[error("status record not found: {0}")]
    NotFound(String),
    /// Optimistic CAS failed on a version mismatch.
    #[error("status version conflict (expected {expected}, actual {actual})")]
    VersionConflict {
        /// Version presented by the writer.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },
    /// A write presented a fencing token lower than the highest seen.
    #[error("stale fencing token for {resource} (presented {presented}, required > {required})")]
    StaleFencingToken {
        /// Fenced resource key.
        resource: String,
        /// Token presented by the writer.
        presented: u64,
        /// Highest token the store has seen.
        required: u64,
    },
    /// A progress write would decrease `items_processed`.
    #[error("items_processed regression for {key} ({from} -> {to})")]
    ProgressRegression {
        /// Progress key.
        key: String,
        /// Stored value.
        from: u64,
        /// Presented value.
        to: u64,
    },
    /// The requested migration state transition is illegal.
    #[error("illegal state transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current state.
        from: MigrationState,
        /// Requested state.
        to: MigrationState,
    },
    /// The lock is held by another migration.
    #[error("lock busy: {resource} held by {holder}")]
    LockBusy {
        /// Contended resource key.
        resource: String,
        /// Current holder.
        holder: String,
    },
    /// The caller does not hold the lock.
    #[error("lock not held: {0}")]
    LockNotHeld(String),
    /// The status store is unavailable.
    #[error("status store unavailable: {0}")]
    Unavailable(String),
    /// Stored data failed integrity or serialization checks.
    #[error("status store corruption: {0}")]
    Corrupt(String),
    /// The status store reported an error.
    #[error("status store error: {0}")]
    Store(String),
}

impl Classify for StatusStoreError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::VersionConflict {
                ..
            }
            | Self::LockBusy {
                ..
            } => ErrorClass::Contention,
            Self::AlreadyExists(_)
            | Self::NotFound(_)
            | Self::StaleFencingToken {
                ..
            }
            | Self::ProgressRegression {
                ..
            }
            | Self::IllegalTransition {
                ..
            }
            | Self::LockNotHeld(_) => ErrorClass::Logical,
            Self::Unavailable(_) | Self::Corrupt(_) | Self::Store(_) => ErrorClass::Fatal,
        }
    }
}

// ============================================================================
// SECTION: Status Store
// ============================================================================

/// Filter for migration listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationFilter {
    /// Restrict to one lifecycle state.
    pub state: Option<MigrationState>,
    /// Restrict to one store class.
    pub store_class: Option<StoreClass>,
}

/// Durable append-or-CAS store for migration state, progress, events, locks.
///
/// The status store is the single source of truth on crash recovery. All
/// mutations are crash-atomic; readers may see stale but never torn records.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Creates a migration record.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError::AlreadyExists`] on a duplicate id.
    async fn create_migration(&self, record: &MigrationRecord) -> Result<(), StatusStoreError>;

    /// Loads a migration record by id.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when loading fails.
    async fn load_migration(
        &self,
        migration_id: &MigrationId,
    ) -> Result<Option<MigrationRecord>, StatusStoreError>;

    /// Finds a migration by its idempotency key.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when loading fails.
    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<MigrationRecord>, StatusStoreError>;

    /// Lists migrations matching a filter.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when listing fails.
    async fn list_migrations(
        &self,
        filter: &MigrationFilter,
    ) -> Result<Vec<MigrationRecord>, StatusStoreError>;

    /// Compare-and-swap update of a migration record.
    ///
    /// The presented record's `version` must equal the stored version; the
    /// stored record's version is incremented. State changes must follow the
    /// legal state machine.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError::VersionConflict`] on a version mismatch
    /// and [`StatusStoreError::IllegalTransition`] on an illegal state change.
    async fn cas_migration(
        &self,
        record: &MigrationRecord,
    ) -> Result<MigrationRecord, StatusStoreError>;

    /// Claims a migration for a new coordinator by CAS on the owner token.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError::VersionConflict`] when the record moved.
    async fn claim_migration(
        &self,
        migration_id: &MigrationId,
        new_owner: &OwnerToken,
        expected_version: u64,
    ) -> Result<MigrationRecord, StatusStoreError>;

    /// Stores the admitted request for a migration.
    ///
    /// Requests are immutable once admitted; a takeover coordinator reloads
    /// the request to rebuild validation settings and transformer bindings.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when the write fails.
    async fn store_request(
        &self,
        migration_id: &MigrationId,
        request: &MigrationRequest,
    ) -> Result<(), StatusStoreError>;

    /// Loads the admitted request for a migration.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when loading fails.
    async fn load_request(
        &self,
        migration_id: &MigrationId,
    ) -> Result<Option<MigrationRequest>, StatusStoreError>;

    /// Stores the plan for a migration.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when the write fails.
    async fn store_plan(&self, migration_id: &MigrationId, plan: &Plan)
    -> Result<(), StatusStoreError>;

    /// Loads the stored plan for a migration.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when loading fails.
    async fn load_plan(&self, migration_id: &MigrationId) -> Result<Option<Plan>, StatusStoreError>;

    /// Loads one progress record.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when loading fails.
    async fn load_progress(
        &self,
        migration_id: &MigrationId,
        step_id: &StepId,
        shard_id: &ShardId,
    ) -> Result<Option<ShardProgress>, StatusStoreError>;

    /// Lists all progress records of a migration.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when listing fails.
    async fn list_progress(
        &self,
        migration_id: &MigrationId,
    ) -> Result<Vec<ShardProgress>, StatusStoreError>;

    /// Upserts a progress record under a fencing token.
    ///
    /// The write is rejected when the token is lower than the highest token
    /// seen for `resource`, or when `items_processed` would regress.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError::StaleFencingToken`] or
    /// [`StatusStoreError::ProgressRegression`] accordingly.
    async fn upsert_progress(
        &self,
        progress: &ShardProgress,
        resource: &LockResource,
        token: FencingToken,
    ) -> Result<ShardProgress, StatusStoreError>;

    /// Stores the pre-stage validation baseline for a migration.
    ///
    /// The baseline is captured once before the data stages and must survive
    /// coordinator crashes, or post-validation deltas would be computed
    /// against partially migrated counts.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when the write fails.
    async fn store_baseline(
        &self,
        migration_id: &MigrationId,
        baseline: &Value,
    ) -> Result<(), StatusStoreError>;

    /// Loads the stored validation baseline.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when loading fails.
    async fn load_baseline(
        &self,
        migration_id: &MigrationId,
    ) -> Result<Option<Value>, StatusStoreError>;

    /// Appends an event to the migration history.
    ///
    /// Events start unpublished; the event bus adapter marks them published
    /// once delivered.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when the append fails.
    async fn append_event(&self, record: &EventRecord) -> Result<(), StatusStoreError>;

    /// Lists the events of a migration in append order.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when listing fails.
    async fn list_events(
        &self,
        migration_id: &MigrationId,
    ) -> Result<Vec<EventRecord>, StatusStoreError>;

    /// Lists unpublished events across migrations in append order.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when listing fails.
    async fn unpublished_events(&self, limit: usize) -> Result<Vec<EventRecord>, StatusStoreError>;

    /// Marks an event as published to the bus.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when the update fails.
    async fn mark_event_published(&self, event_id: &EventId) -> Result<(), StatusStoreError>;

    /// Acquires an advisory lock non-blocking.
    ///
    /// A fresh fencing token higher than any token previously minted for the
    /// resource is attached to the lease.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError::LockBusy`] when contended.
    async fn try_acquire_lock(
        &self,
        resource: &LockResource,
        holder: &MigrationId,
        now: Timestamp,
        ttl_ms: u64,
    ) -> Result<LockRecord, StatusStoreError>;

    /// Renews a held lock, extending its expiry.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError::LockNotHeld`] when the caller lost the
    /// lease.
    async fn renew_lock(
        &self,
        resource: &LockResource,
        holder: &MigrationId,
        now: Timestamp,
        ttl_ms: u64,
    ) -> Result<LockRecord, StatusStoreError>;

    /// Releases a held lock.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError::LockNotHeld`] when the caller does not
    /// hold the lease.
    async fn release_lock(
        &self,
        resource: &LockResource,
        holder: &MigrationId,
    ) -> Result<(), StatusStoreError>;

    /// Reaps locks that expired past the grace window or whose holder is in
    /// a terminal state. Returns the reaped leases.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when reaping fails.
    async fn reap_stale_locks(
        &self,
        now: Timestamp,
        grace_ms: u64,
    ) -> Result<Vec<LockRecord>, StatusStoreError>;

    /// Lists all live lock leases.
    ///
    /// # Errors
    ///
    /// Returns [`StatusStoreError`] when listing fails.
    async fn list_locks(&self) -> Result<Vec<LockRecord>, StatusStoreError>;
}

// ============================================================================
// SECTION: Event Publisher
// ============================================================================

/// Event publication errors.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The bus rejected or dropped the event.
    #[error("event publish failure: {0}")]
    Publish(String),
}

/// At-least-once publisher for lifecycle events.
///
/// Implementations preserve per-migration-id ordering. Publish failures are
/// recoverable: events stay buffered in the status store until a drain pass
/// succeeds.
pub trait EventPublisher: Send + Sync {
    /// Publishes one lifecycle event.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] when delivery fails.
    fn publish(&self, record: &EventRecord) -> Result<(), PublishError>;
}

/// Publisher that drops all events; used by tests that assert on the status
/// store history only.
#[derive(Debug, Default, Clone)]
pub struct NullPublisher;

impl EventPublisher for NullPublisher {
    fn publish(&self, _record: &EventRecord) -> Result<(), PublishError> {
        Ok(())
    }
}

// ============================================================================
// SECTION: Command Source
// ============================================================================

/// Inbound command consumed from the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MigrationCommand {
    /// `migration.request`: admit and start a migration.
    #[serde(rename = "migration.request")]
    Request {
        /// The migration request.
        request: MigrationRequest,
    },
    /// `migration.cancel`: cancel a live migration.
    #[serde(rename = "migration.cancel")]
    Cancel {
        /// Target migration.
        migration_id: MigrationId,
    },
}

/// Envelope around an inbound command.
///
/// # Invariants
/// - `command_id` is unique; consumers dedupe on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Command identifier for dedupe.
    pub command_id: String,
    /// The command.
    pub command: MigrationCommand,
}

/// Command source for pull-mode ingestion.
pub trait CommandSource: Send {
    /// Returns the next available command, if any.
    fn next_command(&mut self) -> Option<CommandEnvelope>;
}

// ============================================================================
// SECTION: Backup Catalog
// ============================================================================

/// Backup collaborator errors.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The catalog reported an error.
    #[error("backup catalog error: {0}")]
    Catalog(String),
}

/// Pre-step snapshot collaborator used for rollback restore.
#[async_trait]
pub trait BackupCatalog: Send + Sync {
    /// Returns true when this catalog can capture snapshots at all.
    ///
    /// Pre-flight uses this to decide whether a data step without an inverse
    /// transformation still has an available compensation.
    fn supports_capture(&self) -> bool;

    /// Captures a pre-step snapshot when the deployment supports it.
    ///
    /// Returning `Ok(None)` means no snapshot is available for the unit;
    /// rollback then relies on a registered inverse transformation.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError`] when the capture fails.
    async fn capture(
        &self,
        migration_id: &MigrationId,
        step_id: &StepId,
        shard_id: &ShardId,
        collection: &CollectionName,
    ) -> Result<Option<SnapshotId>, BackupError>;

    /// Finds a previously captured snapshot for the unit.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError`] when the lookup fails.
    async fn find(
        &self,
        migration_id: &MigrationId,
        step_id: &StepId,
        shard_id: &ShardId,
    ) -> Result<Option<SnapshotId>, BackupError>;

    /// Restores a snapshot onto its shard.
    ///
    /// # Errors
    ///
    /// Returns [`BackupError`] when the restore fails.
    async fn restore(&self, snapshot_id: &SnapshotId, shard_id: &ShardId)
    -> Result<(), BackupError>;
}

/// Backup catalog that never captures snapshots.
///
/// Deployments without a backup service fall back to inverse-transformation
/// rollback only.
#[derive(Debug, Default, Clone)]
pub struct NoBackupCatalog;

#[async_trait]
impl BackupCatalog for NoBackupCatalog {
    fn supports_capture(&self) -> bool {
        false
    }

    async fn capture(
        &self,
        _migration_id: &MigrationId,
        _step_id: &StepId,
        _shard_id: &ShardId,
        _collection: &CollectionName,
    ) -> Result<Option<SnapshotId>, BackupError> {
        Ok(None)
    }

    async fn find(
        &self,
        _migration_id: &MigrationId,
        _step_id: &StepId,
        _shard_id: &ShardId,
    ) -> Result<Option<SnapshotId>, BackupError> {
        Ok(None)
    }

    async fn restore(
        &self,
        _snapshot_id: &SnapshotId,
        _shard_id: &ShardId,
    ) -> Result<(), BackupError> {
        Err(BackupError::Catalog("no backup catalog configured".to_string()))
    }
}
