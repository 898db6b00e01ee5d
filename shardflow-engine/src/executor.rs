// shardflow-engine/src/executor.rs
// ============================================================================
// Module: Engine Executor
// Description: Drives a single migration step on a single shard.
// Purpose: Apply schema or streamed data work with checkpointed resume,
//          bounded retries, and clean commit-boundary cancellation.
// Dependencies: serde_json, shardflow-core, tokio, tokio-util,
//               crate::{clock, events, pump, retry}
// ============================================================================

//! ## Overview
//! One executor owns one `(backend, shard, step)` unit. Schema steps are
//! idempotent applies; the backend's already-applied marker turns replays
//! into successes. Data steps pull batches through the batch pump, apply the
//! registered transformer, write the batch to the target, and only then
//! advance the durable cursor, so a crash between target apply and cursor
//! advance replays a batch whose upserts are no-ops.
//!
//! Transient and contention errors are retried with the bounded policy;
//! logical and structural errors fail the step immediately. Cancellation is
//! observed between batches and never interrupts a batch mid-apply.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use shardflow_core::Classify;
use shardflow_core::ErrorClass;
use shardflow_core::EventKind;
use shardflow_core::FencingToken;
use shardflow_core::LockResource;
use shardflow_core::MigrationId;
use shardflow_core::PlannedStep;
use shardflow_core::ProgressStatus;
use shardflow_core::Record;
use shardflow_core::SchemaChange;
use shardflow_core::ShardInfo;
use shardflow_core::ShardProgress;
use shardflow_core::StepPayload;
use shardflow_core::StoreClass;
use shardflow_core::TransformFn;
use shardflow_core::TransformId;
use shardflow_core::TransformerRegistry;
use shardflow_core::interfaces::BackupCatalog;
use shardflow_core::interfaces::DriverConn;
use shardflow_core::interfaces::DriverError;
use shardflow_core::interfaces::StatusStore;
use shardflow_core::interfaces::StoreDriver;
use shardflow_core::interfaces::TxnSupport;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::events::EventLog;
use crate::pump::BatchController;
use crate::pump::BatchTuning;
use crate::retry::RetryPolicy;

// ============================================================================
// SECTION: Step Failure
// ============================================================================

/// Typed step failure surfaced to the orchestrator.
#[derive(Debug, Clone)]
pub struct StepFailure {
    /// Taxonomy class of the failure.
    pub class: ErrorClass,
    /// Underlying message.
    pub message: String,
}

impl StepFailure {
    /// Creates a step failure.
    #[must_use]
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Creates a step failure from a classified error.
    #[must_use]
    pub fn from_err(err: &(impl Classify + fmt::Display)) -> Self {
        Self::new(err.class(), err.to_string())
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class.as_str(), self.message)
    }
}

// ============================================================================
// SECTION: Outcomes
// ============================================================================

/// Outcome of one executor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Step completed on this shard.
    Completed {
        /// Source items processed this run plus prior runs.
        items: u64,
    },
    /// The unit was already completed or skipped; nothing ran.
    Skipped,
    /// Cancellation was observed at a commit boundary; the unit is resumable.
    Cancelled {
        /// Items processed before the cancel point.
        items: u64,
    },
}

/// Outcome of a compensating action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationOutcome {
    /// Compensation applied.
    Compensated {
        /// Mechanism used (`schema_down`, `snapshot_restore`, `inverse_transform`).
        method: &'static str,
    },
    /// No compensation is available for the unit.
    Unrecoverable {
        /// Why the unit cannot be compensated.
        reason: String,
    },
}

// ============================================================================
// SECTION: Executor Environment
// ============================================================================

/// Collaborators shared by every executor of one migration.
#[derive(Clone)]
pub struct ExecutorEnv {
    /// Owning migration.
    pub migration_id: MigrationId,
    /// Store class being migrated.
    pub store_class: StoreClass,
    /// Backend driver for the store class.
    pub driver: Arc<dyn StoreDriver>,
    /// Status store.
    pub status: Arc<dyn StatusStore>,
    /// Transformer registry.
    pub transforms: Arc<TransformerRegistry>,
    /// Backup collaborator for rollback restore.
    pub backup: Arc<dyn BackupCatalog>,
    /// Event log.
    pub events: Arc<EventLog>,
    /// Retry policy.
    pub retry: RetryPolicy,
    /// Batch pump tuning.
    pub tuning: BatchTuning,
    /// Timestamp source.
    pub clock: Arc<dyn Clock>,
}

/// Retries a driver call with the bounded policy, or fails the step.
macro_rules! driver_retry {
    ($env:expr, $label:expr, $call:expr) => {{
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match $call.await {
                Ok(value) => break value,
                Err(err) => {
                    let class = Classify::class(&err);
                    if $env.retry.should_retry(class, attempt) {
                        tokio::time::sleep($env.retry.delay_for(class, attempt)).await;
                        continue;
                    }
                    return Err(StepFailure::new(class, format!("{}: {err}", $label)));
                }
            }
        }
    }};
}

// ============================================================================
// SECTION: Step Execution
// ============================================================================

/// Drives one planned step on one shard to completion, failure, or a clean
/// cancellation boundary.
///
/// # Errors
///
/// Returns [`StepFailure`] carrying the taxonomy class; the caller decides
/// between rollback and halt.
#[allow(clippy::too_many_arguments, reason = "executors receive the full per-unit context")]
pub async fn run_step(
    env: &ExecutorEnv,
    step: &PlannedStep,
    shard: &ShardInfo,
    resource: &LockResource,
    token: FencingToken,
    cancel: &CancellationToken,
    batches: &Semaphore,
) -> Result<StepOutcome, StepFailure> {
    let existing = env
        .status
        .load_progress(&env.migration_id, &step.step_id, &step.shard_id)
        .await
        .map_err(|err| StepFailure::from_err(&err))?;

    let mut progress = match existing {
        Some(progress) if progress.status.is_settled() => return Ok(StepOutcome::Skipped),
        // A running record here means crash recovery: resume from its cursor.
        Some(progress) => progress,
        None => ShardProgress::pending(
            env.migration_id.clone(),
            step.step_id.clone(),
            step.shard_id.clone(),
        ),
    };
    progress.status = ProgressStatus::Running;
    if progress.started_at.is_none() {
        progress.started_at = Some(env.clock.now());
    }
    if progress.total_items.is_none() {
        progress.total_items = step.estimated_items;
    }
    progress = upsert(env, progress, resource, token).await?;

    env.events
        .emit(
            &env.migration_id,
            EventKind::StepStarted,
            json!({
                "step_id": step.step_id,
                "shard_id": step.shard_id,
                "kind": step.kind,
                "resumed_from": progress.last_checkpoint,
            }),
        )
        .await
        .map_err(|err| StepFailure::from_err(&err))?;

    let run = match &step.payload {
        StepPayload::Schema {
            change,
        } => run_schema(env, step, shard, change).await.map(|()| DataRun::Finished),
        StepPayload::Data {
            transform,
        } => {
            run_data(env, step, shard, transform, resource, token, cancel, batches, &mut progress)
                .await
        }
    };

    match run {
        Ok(DataRun::Finished) => {
            progress.status = ProgressStatus::Completed;
            progress.ended_at = Some(env.clock.now());
            let progress = upsert(env, progress, resource, token).await?;
            env.events
                .emit(
                    &env.migration_id,
                    EventKind::StepCompleted,
                    json!({
                        "step_id": step.step_id,
                        "shard_id": step.shard_id,
                        "items_processed": progress.items_processed,
                    }),
                )
                .await
                .map_err(|err| StepFailure::from_err(&err))?;
            Ok(StepOutcome::Completed {
                items: progress.items_processed,
            })
        }
        Ok(DataRun::Cancelled) => Ok(StepOutcome::Cancelled {
            items: progress.items_processed,
        }),
        Err(failure) => {
            progress.status = ProgressStatus::Failed;
            progress.ended_at = Some(env.clock.now());
            progress.error = Some(failure.message.clone());
            // Best-effort: the step failure is surfaced even if this write loses.
            let _ = upsert(env, progress, resource, token).await;
            let _ = env
                .events
                .emit(
                    &env.migration_id,
                    EventKind::StepFailed,
                    json!({
                        "step_id": step.step_id,
                        "shard_id": step.shard_id,
                        "class": failure.class,
                        "message": failure.message,
                    }),
                )
                .await;
            Err(failure)
        }
    }
}

/// Internal data-run result distinguishing completion from a cancel boundary.
enum DataRun {
    /// Stream exhausted.
    Finished,
    /// Cancellation observed between batches.
    Cancelled,
}

/// Applies a schema step idempotently.
async fn run_schema(
    env: &ExecutorEnv,
    step: &PlannedStep,
    shard: &ShardInfo,
    change: &SchemaChange,
) -> Result<(), StepFailure> {
    let mut conn = driver_retry!(env, "open", env.driver.open(shard));
    // Applied and AlreadyApplied are both success: replays after a partial
    // crash land on the backend marker.
    let _ = driver_retry!(env, "apply_schema", conn.apply_schema(&step.collection, change));
    Ok(())
}

/// Streams, transforms, and applies data batches until end of stream.
#[allow(clippy::too_many_arguments, reason = "executors receive the full per-unit context")]
async fn run_data(
    env: &ExecutorEnv,
    step: &PlannedStep,
    shard: &ShardInfo,
    transform: &TransformId,
    resource: &LockResource,
    token: FencingToken,
    cancel: &CancellationToken,
    batches: &Semaphore,
    progress: &mut ShardProgress,
) -> Result<DataRun, StepFailure> {
    let transformer = env
        .transforms
        .get(transform)
        .map_err(|err| StepFailure::new(ErrorClass::Logical, err.to_string()))?
        .clone();

    // Capture the pre-step snapshot once, before the first batch runs.
    if progress.items_processed == 0
        && progress.last_checkpoint.is_none()
        && env.backup.supports_capture()
    {
        env.backup
            .capture(&env.migration_id, &step.step_id, &step.shard_id, &step.collection)
            .await
            .map_err(|err| StepFailure::new(ErrorClass::Logical, err.to_string()))?;
    }

    let mut conn = driver_retry!(env, "open", env.driver.open(shard));
    let mut controller = BatchController::new(env.tuning);
    let mut cursor = progress.last_checkpoint.clone();

    loop {
        // Commit boundary: a cancel never interrupts a batch mid-apply.
        if cancel.is_cancelled() {
            return Ok(DataRun::Cancelled);
        }
        let permit = batches
            .acquire()
            .await
            .map_err(|err| StepFailure::new(ErrorClass::Fatal, err.to_string()))?;
        let started = Instant::now();

        let batch = driver_retry!(
            env,
            "stream_batch",
            conn.stream_batch(&step.collection, cursor.as_ref(), controller.size())
        );
        if batch.records.is_empty() && batch.next_cursor.is_none() {
            drop(permit);
            return Ok(DataRun::Finished);
        }

        let mut transformed = Vec::with_capacity(batch.records.len());
        for record in &batch.records {
            match (transformer.apply)(record) {
                Ok(Some(out)) => transformed.push(out),
                Ok(None) => {}
                Err(err) => {
                    return Err(StepFailure::new(ErrorClass::Logical, err.to_string()));
                }
            }
        }

        if !transformed.is_empty() {
            apply_transformed(env, &mut conn, step, &transformed).await?;
        }

        // The batch is durable at the target; only now advance the cursor.
        progress.items_processed += batch.records.len() as u64;
        if batch.next_cursor.is_some() {
            progress.last_checkpoint = batch.next_cursor.clone();
        }
        *progress = upsert(env, progress.clone(), resource, token).await?;
        env.events
            .emit(
                &env.migration_id,
                EventKind::Progress,
                json!({
                    "step_id": step.step_id,
                    "shard_id": step.shard_id,
                    "batch_items": batch.records.len(),
                    "items_processed": progress.items_processed,
                }),
            )
            .await
            .map_err(|err| StepFailure::from_err(&err))?;

        let latency = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let health = conn.health().await;
        controller.observe(latency, health);
        drop(permit);

        match batch.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(DataRun::Finished),
        }
    }
}

/// Applies a transformed batch, transactionally where supported.
async fn apply_transformed(
    env: &ExecutorEnv,
    conn: &mut Box<dyn DriverConn>,
    step: &PlannedStep,
    records: &[Record],
) -> Result<(), StepFailure> {
    match conn.txn_support() {
        TxnSupport::Multi => {
            let _: () = driver_retry!(env, "apply_batch", apply_in_txn(conn, step, records));
        }
        TxnSupport::SingleBatch => {
            let _ = driver_retry!(env, "apply_batch", conn.apply_batch(&step.collection, records));
        }
    }
    Ok(())
}

/// One begin/apply/commit attempt; rolls back on apply failure.
async fn apply_in_txn(
    conn: &mut Box<dyn DriverConn>,
    step: &PlannedStep,
    records: &[Record],
) -> Result<(), DriverError> {
    conn.begin().await?;
    if let Err(err) = conn.apply_batch(&step.collection, records).await {
        let _ = conn.rollback().await;
        return Err(err);
    }
    conn.commit().await
}

/// Upserts progress under the shard's fencing token.
async fn upsert(
    env: &ExecutorEnv,
    progress: ShardProgress,
    resource: &LockResource,
    token: FencingToken,
) -> Result<ShardProgress, StepFailure> {
    env.status
        .upsert_progress(&progress, resource, token)
        .await
        .map_err(|err| StepFailure::from_err(&err))
}

// ============================================================================
// SECTION: Compensation
// ============================================================================

/// Applies the compensating action for a completed step.
///
/// Schema steps replay their store-native down-migration. Data steps prefer
/// a captured snapshot restore and fall back to replaying the registered
/// inverse transformation; a unit with neither is unrecoverable.
///
/// # Errors
///
/// Returns [`StepFailure`] when the compensation itself fails.
pub async fn compensate_step(
    env: &ExecutorEnv,
    step: &PlannedStep,
    shard: &ShardInfo,
) -> Result<CompensationOutcome, StepFailure> {
    match &step.payload {
        StepPayload::Schema {
            change,
        } => {
            if change.down.is_none() {
                return Ok(CompensationOutcome::Unrecoverable {
                    reason: format!("schema change {} has no down definition", change.change_id),
                });
            }
            let mut conn = driver_retry!(env, "open", env.driver.open(shard));
            let _ = driver_retry!(env, "revert_schema", conn.revert_schema(&step.collection, change));
            Ok(CompensationOutcome::Compensated {
                method: "schema_down",
            })
        }
        StepPayload::Data {
            transform,
        } => {
            let snapshot = env
                .backup
                .find(&env.migration_id, &step.step_id, &step.shard_id)
                .await
                .map_err(|err| StepFailure::new(ErrorClass::Logical, err.to_string()))?;
            if let Some(snapshot_id) = snapshot {
                env.backup
                    .restore(&snapshot_id, &step.shard_id)
                    .await
                    .map_err(|err| StepFailure::new(ErrorClass::Logical, err.to_string()))?;
                return Ok(CompensationOutcome::Compensated {
                    method: "snapshot_restore",
                });
            }
            let Ok(inverse) = env.transforms.inverse(transform) else {
                return Ok(CompensationOutcome::Unrecoverable {
                    reason: format!("transformer {transform} has no inverse and no snapshot"),
                });
            };
            replay_inverse(env, step, shard, &inverse).await?;
            Ok(CompensationOutcome::Compensated {
                method: "inverse_transform",
            })
        }
    }
}

/// Replays the inverse transformation over the shard's collection.
async fn replay_inverse(
    env: &ExecutorEnv,
    step: &PlannedStep,
    shard: &ShardInfo,
    inverse: &TransformFn,
) -> Result<(), StepFailure> {
    let mut conn = driver_retry!(env, "open", env.driver.open(shard));
    let mut cursor = None;
    loop {
        let batch = driver_retry!(
            env,
            "stream_batch",
            conn.stream_batch(&step.collection, cursor.as_ref(), env.tuning.initial_batch)
        );
        if batch.records.is_empty() && batch.next_cursor.is_none() {
            return Ok(());
        }
        let mut restored = Vec::with_capacity(batch.records.len());
        for record in &batch.records {
            match inverse(record) {
                Ok(Some(out)) => restored.push(out),
                Ok(None) => {}
                Err(err) => {
                    return Err(StepFailure::new(ErrorClass::Logical, err.to_string()));
                }
            }
        }
        if !restored.is_empty() {
            apply_transformed(env, &mut conn, step, &restored).await?;
        }
        match batch.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(()),
        }
    }
}
