// shardflow-engine/src/orchestrator.rs
// ============================================================================
// Module: Engine Orchestrator
// Description: The migration state machine and stage scheduler.
// Purpose: Drive admitted migrations through planning, leases, validation,
//          staged execution, and commit or rollback.
// Dependencies: serde_json, shardflow-core, thiserror, tokio, tokio-util,
//               crate::{clock, config, events, executor, locks, planner,
//          validator}
// ============================================================================

//! ## Overview
//! One [`Coordinator`] owns the state machine of every migration it drives.
//! Admission validates the request, detects idempotency-key duplicates, and
//! materializes the plan. Execution acquires all leases up front, runs
//! pre-flight validation, then drives stages in order: within a stage,
//! executors fan out under the store-class parallelism semaphore and a
//! per-shard gate, scheduled longest-critical-path first. All steps of stage
//! N complete before stage N+1 starts.
//!
//! Failures classify the response: the compensate policy rolls completed
//! steps back in reverse completion order, halt terminates in `failed`.
//! Cancellation is cooperative and honors in-flight batches to their commit
//! point. A second coordinator may take over a crashed migration by claiming
//! its record; fencing tokens keep the old owner's writes out.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::RngCore;
use rand::rngs::OsRng;
use serde_json::json;
use shardflow_core::AggregateCounters;
use shardflow_core::Classify;
use shardflow_core::ErrorClass;
use shardflow_core::EventKind;
use shardflow_core::FailureDetail;
use shardflow_core::LockResource;
use shardflow_core::MigrationId;
use shardflow_core::MigrationOutcome;
use shardflow_core::MigrationRecord;
use shardflow_core::MigrationRequest;
use shardflow_core::MigrationState;
use shardflow_core::OwnerToken;
use shardflow_core::Plan;
use shardflow_core::PlannedStep;
use shardflow_core::RequestError;
use shardflow_core::ShardId;
use shardflow_core::ShardProgress;
use shardflow_core::Stage;
use shardflow_core::StepId;
use shardflow_core::StoreClass;
use shardflow_core::TopologyError;
use shardflow_core::TopologyProvider;
use shardflow_core::TopologySnapshot;
use shardflow_core::TransformerRegistry;
use shardflow_core::hashing::HashError;
use shardflow_core::interfaces::BackupCatalog;
use shardflow_core::interfaces::EventPublisher;
use shardflow_core::interfaces::MigrationFilter;
use shardflow_core::interfaces::StatusStore;
use shardflow_core::interfaces::StatusStoreError;
use shardflow_core::interfaces::StoreDriver;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::CoordinatorConfig;
use crate::config::RollbackPolicy;
use crate::events::EventLog;
use crate::executor::CompensationOutcome;
use crate::executor::ExecutorEnv;
use crate::executor::StepFailure;
use crate::executor::StepOutcome;
use crate::executor::compensate_step;
use crate::executor::run_step;
use crate::locks::LeaseSet;
use crate::locks::LockError;
use crate::locks::LockManager;
use crate::planner::PlanError;
use crate::planner::build_plan;
use crate::validator::ValidationBaseline;
use crate::validator::Validator;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Engine-level errors surfaced by coordinator operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Request failed admission validation.
    #[error(transparent)]
    Request(#[from] RequestError),
    /// Planning failed.
    #[error(transparent)]
    Plan(#[from] PlanError),
    /// Topology resolution failed.
    #[error(transparent)]
    Topology(#[from] TopologyError),
    /// Status store failed.
    #[error(transparent)]
    Status(#[from] StatusStoreError),
    /// Lock acquisition failed.
    #[error(transparent)]
    Lock(#[from] LockError),
    /// Plan digest computation failed.
    #[error("plan digest failure: {0}")]
    Digest(#[from] HashError),
    /// The referenced migration does not exist.
    #[error("migration not found: {0}")]
    NotFound(String),
    /// A terminal migration with the same idempotency key exists.
    #[error("request with idempotency key {0} already completed")]
    AlreadyExists(String),
    /// A live migration with the same idempotency key exists.
    #[error("request with idempotency key {0} is already in progress")]
    InProgress(String),
    /// A declared dependency request has not completed.
    #[error("dependency request {0} has not completed")]
    DependencyNotCompleted(String),
    /// The operation targets a terminal migration.
    #[error("migration {migration_id} is terminal ({state:?})")]
    Terminal {
        /// Target migration.
        migration_id: MigrationId,
        /// Terminal state observed.
        state: MigrationState,
    },
    /// No driver is configured for the store class.
    #[error("no driver configured for store class {0}")]
    DriverMissing(&'static str),
}

impl Classify for EngineError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Request(_)
            | Self::NotFound(_)
            | Self::AlreadyExists(_)
            | Self::InProgress(_)
            | Self::Terminal {
                ..
            } => ErrorClass::Logical,
            Self::Plan(_)
            | Self::Topology(_)
            | Self::Digest(_)
            | Self::DependencyNotCompleted(_)
            | Self::DriverMissing(_) => ErrorClass::Structural,
            Self::Status(err) => err.class(),
            Self::Lock(err) => err.class(),
        }
    }
}

// ============================================================================
// SECTION: Coordinator
// ============================================================================

/// The migration coordinator: one instance drives many migrations, one state
/// machine each.
pub struct Coordinator {
    /// Status store (single source of truth).
    status: Arc<dyn StatusStore>,
    /// One driver per store class, from configuration.
    drivers: BTreeMap<StoreClass, Arc<dyn StoreDriver>>,
    /// Topology provider.
    topology: Arc<dyn TopologyProvider>,
    /// Transformer registry, populated at assembly.
    transforms: Arc<TransformerRegistry>,
    /// Backup collaborator.
    backup: Arc<dyn BackupCatalog>,
    /// Durable-first event log.
    events: Arc<EventLog>,
    /// Lock manager.
    locks: LockManager,
    /// Timestamp source.
    clock: Arc<dyn Clock>,
    /// Coordinator configuration.
    config: CoordinatorConfig,
    /// This coordinator's owner token.
    owner: OwnerToken,
    /// Cancellation tokens of live runs.
    live: Mutex<BTreeMap<String, CancellationToken>>,
}

impl Coordinator {
    /// Assembles a coordinator from its collaborators.
    #[must_use]
    pub fn new(
        status: Arc<dyn StatusStore>,
        drivers: BTreeMap<StoreClass, Arc<dyn StoreDriver>>,
        topology: Arc<dyn TopologyProvider>,
        transforms: Arc<TransformerRegistry>,
        backup: Arc<dyn BackupCatalog>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        let owner = mint_owner_token();
        let events = Arc::new(EventLog::new(
            Arc::clone(&status),
            publisher,
            Arc::clone(&clock),
            owner.clone(),
        ));
        let locks =
            LockManager::new(Arc::clone(&status), Arc::clone(&clock), config.locks, config.retry);
        Self {
            status,
            drivers,
            topology,
            transforms,
            backup,
            events,
            locks,
            clock,
            config,
            owner,
            live: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns this coordinator's owner token.
    #[must_use]
    pub const fn owner(&self) -> &OwnerToken {
        &self.owner
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Admits a request: validates, checks idempotency and dependencies,
    /// materializes the plan, and leaves the migration `pending`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] naming the admission failure; planning
    /// failures leave a terminal `failed` record behind.
    pub async fn admit(&self, request: MigrationRequest) -> Result<MigrationRecord, EngineError> {
        request.validate()?;

        if let Some(existing) = self.status.find_by_idempotency_key(&request.idempotency_key).await?
        {
            let key = request.idempotency_key.as_str().to_string();
            return Err(if existing.is_terminal() {
                EngineError::AlreadyExists(key)
            } else {
                EngineError::InProgress(key)
            });
        }

        for dependency in &request.depends_on {
            let completed = self
                .status
                .list_migrations(&MigrationFilter::default())
                .await?
                .iter()
                .any(|record| {
                    &record.request_id == dependency && record.state == MigrationState::Completed
                });
            if !completed {
                return Err(EngineError::DependencyNotCompleted(dependency.as_str().to_string()));
            }
        }

        let migration_id = MigrationId::new(format!("mig-{}", random_hex()));
        let record = MigrationRecord {
            migration_id: migration_id.clone(),
            request_id: request.request_id.clone(),
            name: request.name.clone(),
            store_class: request.store_class,
            idempotency_key: request.idempotency_key.clone(),
            state: MigrationState::Created,
            plan_digest: None,
            owner_token: self.owner.clone(),
            created_at: self.clock.now(),
            started_at: None,
            ended_at: None,
            current_stage: None,
            counters: AggregateCounters::default(),
            outcome: None,
            error: None,
            version: 0,
        };
        self.status.create_migration(&record).await?;
        self.status.store_request(&migration_id, &request).await?;
        self.events
            .emit(
                &migration_id,
                EventKind::Created,
                json!({
                    "request_id": request.request_id,
                    "name": request.name,
                    "store_class": request.store_class,
                }),
            )
            .await?;

        let mut record = self.cas_state(record, MigrationState::Planning).await?;
        let snapshot = self.topology.snapshot()?;
        let plan = match build_plan(&request, &snapshot) {
            Ok(plan) => plan,
            Err(err) => {
                let detail = FailureDetail {
                    step_id: None,
                    shard_id: None,
                    class: err.class(),
                    message: err.to_string(),
                };
                record.error = Some(detail);
                record.ended_at = Some(self.clock.now());
                record.outcome = Some(MigrationOutcome::Failed {
                    unrecoverable_steps: Vec::new(),
                });
                let record = self.cas_state(record, MigrationState::Failed).await?;
                self.emit_failed(&record).await?;
                return Err(err.into());
            }
        };
        let digest = plan.digest()?;
        self.status.store_plan(&migration_id, &plan).await?;
        record.plan_digest = Some(digest);
        record.counters.steps_total = plan.step_count() as u64;
        self.cas_state(record, MigrationState::Pending).await
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Runs a pending migration to a terminal state and returns the final
    /// record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for infrastructure failures; execution
    /// failures terminate in a `failed`/`rolled_back` record, not an error.
    pub async fn run(&self, migration_id: &MigrationId) -> Result<MigrationRecord, EngineError> {
        let record = self.load(migration_id).await?;
        if record.is_terminal() {
            return Err(EngineError::Terminal {
                migration_id: migration_id.clone(),
                state: record.state,
            });
        }
        self.drive(record).await
    }

    /// Takes over a migration from a crashed coordinator and resumes it.
    ///
    /// The claim bumps the record version under CAS; the previous owner's
    /// progress writes are fenced out by the lock tokens minted on
    /// re-acquisition.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the claim races another coordinator.
    pub async fn resume(&self, migration_id: &MigrationId) -> Result<MigrationRecord, EngineError> {
        let record = self.load(migration_id).await?;
        if record.is_terminal() {
            return Err(EngineError::Terminal {
                migration_id: migration_id.clone(),
                state: record.state,
            });
        }
        let claimed =
            self.status.claim_migration(migration_id, &self.owner, record.version).await?;
        self.drive(claimed).await
    }

    /// Requests cooperative cancellation.
    ///
    /// A live run observes the flag at its next commit boundary. A migration
    /// with no live run is walked to `cancelled` directly.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Terminal`] when the migration already ended.
    pub async fn cancel(&self, migration_id: &MigrationId) -> Result<(), EngineError> {
        let record = self.load(migration_id).await?;
        if record.is_terminal() {
            return Err(EngineError::Terminal {
                migration_id: migration_id.clone(),
                state: record.state,
            });
        }
        let live = self
            .live
            .lock()
            .map_err(|_| StatusStoreError::Store("live-run mutex poisoned".to_string()))?
            .get(migration_id.as_str())
            .cloned();
        if let Some(token) = live {
            token.cancel();
            return Ok(());
        }
        // No live run: finalize directly.
        let record = self.cas_state(record, MigrationState::Cancelling).await?;
        self.finalize_cancel(record).await?;
        Ok(())
    }

    /// Releases the locks of a terminal migration with unrecoverable steps.
    ///
    /// This is the operator acknowledgement required before the damaged
    /// resources may be migrated again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the migration is unknown or lock release
    /// fails.
    pub async fn acknowledge_unrecoverable(
        &self,
        migration_id: &MigrationId,
    ) -> Result<(), EngineError> {
        let record = self.load(migration_id).await?;
        if !record.is_terminal() {
            return Err(EngineError::Terminal {
                migration_id: migration_id.clone(),
                state: record.state,
            });
        }
        for lock in self.status.list_locks().await? {
            if &lock.holder == migration_id {
                self.status.release_lock(&lock.resource, migration_id).await?;
            }
        }
        Ok(())
    }

    /// Returns a migration record with its per-shard progress.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for unknown migrations.
    pub async fn get(
        &self,
        migration_id: &MigrationId,
    ) -> Result<(MigrationRecord, Vec<ShardProgress>), EngineError> {
        let record = self.load(migration_id).await?;
        let progress = self.status.list_progress(migration_id).await?;
        Ok((record, progress))
    }

    /// Lists migrations matching a filter.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the status store fails.
    pub async fn list(&self, filter: &MigrationFilter) -> Result<Vec<MigrationRecord>, EngineError> {
        self.status.list_migrations(filter).await.map_err(Into::into)
    }

    /// Drains buffered lifecycle events to the bus.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the status store fails.
    pub async fn drain_events(&self, limit: usize) -> Result<usize, EngineError> {
        self.events.drain(limit).await.map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Drive loop
    // ------------------------------------------------------------------

    /// Drives a migration from its current state to a terminal state.
    async fn drive(&self, mut record: MigrationRecord) -> Result<MigrationRecord, EngineError> {
        let migration_id = record.migration_id.clone();
        let request = self
            .status
            .load_request(&migration_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(migration_id.as_str().to_string()))?;
        let plan = self
            .status
            .load_plan(&migration_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(migration_id.as_str().to_string()))?;
        let driver = self
            .drivers
            .get(&record.store_class)
            .cloned()
            .ok_or(EngineError::DriverMissing(record.store_class.as_str()))?;

        // A resumed plan must see the shard set it was expanded against.
        let snapshot = self.topology.snapshot()?;
        if snapshot.version != plan.topology_version {
            let stale = TopologyError::Stale {
                pinned: plan.topology_version,
                current: snapshot.version,
            };
            return self
                .fail_before_start(record, ErrorClass::Structural, stale.to_string())
                .await;
        }

        let cancel = self.register_live(&migration_id)?;
        let deadline_guard = request.deadline_ms.map(|deadline| {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(deadline)).await;
                token.cancel();
            })
        });

        let outcome = self
            .drive_inner(&mut record, &request, &plan, driver, &snapshot, &cancel)
            .await;

        if let Some(guard) = deadline_guard {
            guard.abort();
        }
        cancel.cancel();
        self.unregister_live(&migration_id);
        outcome
    }

    /// Inner drive body; lease lifetime and terminal transitions live here.
    async fn drive_inner(
        &self,
        record: &mut MigrationRecord,
        request: &MigrationRequest,
        plan: &Plan,
        driver: Arc<dyn StoreDriver>,
        snapshot: &TopologySnapshot,
        cancel: &CancellationToken,
    ) -> Result<MigrationRecord, EngineError> {
        let migration_id = record.migration_id.clone();

        let leases = match self.locks.acquire_all(&migration_id, &lock_resources(plan)).await {
            Ok(leases) => leases,
            Err(err) => {
                let class = err.class();
                return self.fail_before_start(record.clone(), class, err.to_string()).await;
            }
        };
        let renewal =
            self.locks.spawn_renewal(migration_id.clone(), leases.clone(), cancel.child_token());

        let validator =
            Validator::new(Arc::clone(&driver), Arc::clone(&self.transforms), Arc::clone(&self.backup));

        // Fresh runs capture the baseline; takeovers reload the stored one.
        let baseline = if record.state == MigrationState::Pending {
            match validator
                .pre_flight(request, plan, snapshot, self.config.rollback_policy)
                .await
            {
                Ok(baseline) => {
                    let encoded = serde_json::to_value(&baseline)
                        .map_err(|err| StatusStoreError::Corrupt(err.to_string()))?;
                    self.status.store_baseline(&migration_id, &encoded).await?;
                    baseline
                }
                Err(failure) => {
                    let class = failure.class();
                    self.locks.release_all(&migration_id, &leases).await;
                    renewal.abort();
                    return self.fail_before_start(record.clone(), class, failure.to_string()).await;
                }
            }
        } else {
            self.status
                .load_baseline(&migration_id)
                .await?
                .map(serde_json::from_value)
                .transpose()
                .map_err(|err| StatusStoreError::Corrupt(err.to_string()))?
                .unwrap_or_default()
        };

        if record.state == MigrationState::Pending {
            record.started_at = Some(self.clock.now());
            *record = self.cas_state(record.clone(), MigrationState::Running).await?;
            self.events
                .emit(&migration_id, EventKind::Started, json!({"plan_digest": record.plan_digest}))
                .await?;
        }

        let env = ExecutorEnv {
            migration_id: migration_id.clone(),
            store_class: record.store_class,
            driver,
            status: Arc::clone(&self.status),
            transforms: Arc::clone(&self.transforms),
            backup: Arc::clone(&self.backup),
            events: Arc::clone(&self.events),
            retry: self.config.retry,
            tuning: self.config.tuning,
            clock: Arc::clone(&self.clock),
        };
        let slots = request
            .concurrency
            .max_parallel_shards
            .map_or(self.config.per_store_class_parallelism, |hint| {
                hint.clamp(1, self.config.per_store_class_parallelism)
            });
        let class_slots = Arc::new(Semaphore::new(slots));
        let batches = Arc::new(Semaphore::new(self.config.max_inflight_batches));

        let mut completed_order: Vec<StepId> = Vec::new();
        let mut failure: Option<(Option<StepId>, Option<ShardId>, StepFailure)> = None;
        let mut cancelled = false;

        for stage in &plan.stages {
            record.current_stage = Some(stage.index);
            *record = self.status.cas_migration(record).await?;

            let result = self
                .run_stage(&env, stage, snapshot, &leases, cancel, &class_slots, &batches)
                .await?;
            completed_order.extend(result.completed);
            if let Some((step_id, shard_id, step_failure)) = result.failure {
                failure = Some((Some(step_id), Some(shard_id), step_failure));
                break;
            }
            if result.cancelled {
                cancelled = true;
                break;
            }
        }

        if cancelled || cancel.is_cancelled() {
            let record = self.cas_state(record.clone(), MigrationState::Cancelling).await?;
            let record = self.finalize_cancel(record).await?;
            self.locks.release_all(&migration_id, &leases).await;
            renewal.abort();
            return Ok(record);
        }

        if failure.is_none() {
            *record = self.cas_state(record.clone(), MigrationState::Validating).await?;
            let post = match validator.post_shard(request, plan, snapshot, &baseline).await {
                Ok(()) => validator.cross_shard(request, plan, snapshot, &baseline).await,
                Err(err) => Err(err),
            };
            match post {
                Ok(()) => {
                    let record =
                        self.finalize_completed(record.clone(), &migration_id).await?;
                    self.locks.release_all(&migration_id, &leases).await;
                    renewal.abort();
                    return Ok(record);
                }
                Err(err) => {
                    self.events
                        .emit(
                            &migration_id,
                            EventKind::ValidationFailed,
                            json!({"message": err.to_string(), "class": err.class()}),
                        )
                        .await?;
                    failure = Some((None, None, StepFailure::new(err.class(), err.to_string())));
                }
            }
        }

        // Failure path: rollback or halt per policy.
        let (step_id, shard_id, step_failure) =
            failure.unwrap_or_else(|| (None, None, StepFailure::new(ErrorClass::Fatal, String::new())));
        record.error = Some(FailureDetail {
            step_id,
            shard_id,
            class: step_failure.class,
            message: step_failure.message.clone(),
        });
        *record = self.cas_state(record.clone(), MigrationState::Failing).await?;

        let record = match self.config.rollback_policy {
            RollbackPolicy::Halt => {
                let mut record = record.clone();
                record.ended_at = Some(self.clock.now());
                record.outcome = Some(MigrationOutcome::Failed {
                    unrecoverable_steps: Vec::new(),
                });
                let record = self.cas_state(record, MigrationState::Failed).await?;
                self.emit_failed(&record).await?;
                self.locks.release_all(&migration_id, &leases).await;
                record
            }
            RollbackPolicy::Compensate => {
                let record = self
                    .rollback(record.clone(), &env, plan, snapshot, completed_order)
                    .await?;
                if record.locks_revocable() {
                    self.locks.release_all(&migration_id, &leases).await;
                }
                record
            }
        };
        renewal.abort();
        Ok(record)
    }

    // ------------------------------------------------------------------
    // Stage scheduling
    // ------------------------------------------------------------------

    /// Runs one stage: fan-out under the class semaphore and per-shard gate,
    /// longest remaining critical path first.
    async fn run_stage(
        &self,
        env: &ExecutorEnv,
        stage: &Stage,
        snapshot: &TopologySnapshot,
        leases: &LeaseSet,
        cancel: &CancellationToken,
        class_slots: &Arc<Semaphore>,
        batches: &Arc<Semaphore>,
    ) -> Result<StageOutcome, EngineError> {
        let mut ordered: Vec<&PlannedStep> = stage.steps.iter().collect();
        ordered.sort_by(|a, b| {
            b.depth
                .cmp(&a.depth)
                .then_with(|| b.estimated_items.unwrap_or(0).cmp(&a.estimated_items.unwrap_or(0)))
        });

        // Resolve every lease and shard before the first spawn; a missing
        // lease must fail the stage without aborting in-flight work.
        let mut units = Vec::with_capacity(ordered.len());
        for step in ordered {
            let resource = LockResource::Shard {
                store_class: env.store_class,
                shard_id: step.shard_id.clone(),
            };
            let Some(token) = leases.token_for(&resource) else {
                return Ok(StageOutcome::failed(
                    step.step_id.clone(),
                    step.shard_id.clone(),
                    StepFailure::new(
                        ErrorClass::Fatal,
                        format!("no lease held for {}", resource.as_key()),
                    ),
                ));
            };
            let shard = snapshot.shard(env.store_class, &step.shard_id)?.clone();
            units.push((step.clone(), resource, token, shard));
        }

        let halted = Arc::new(AtomicBool::new(false));
        let gates = ShardGates::default();
        let mut join: JoinSet<TaskResult> = JoinSet::new();

        for (step, resource, token, shard) in units {
            let env = env.clone();
            let cancel = cancel.clone();
            let class_slots = Arc::clone(class_slots);
            let batches = Arc::clone(batches);
            let halted = Arc::clone(&halted);
            let gate = gates.gate(&step.shard_id);

            join.spawn(async move {
                let Ok(_slot) = class_slots.acquire_owned().await else {
                    return TaskResult::NotStarted;
                };
                // A failure or cancel stops dispatching queued steps.
                if halted.load(Ordering::SeqCst) || cancel.is_cancelled() {
                    return TaskResult::NotStarted;
                }
                let _exclusive = gate.lock_owned().await;

                let watchdog = step.deadline_ms.map(|deadline| {
                    let token = cancel.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(deadline)).await;
                        token.cancel();
                    })
                });
                let result =
                    run_step(&env, &step, &shard, &resource, token, &cancel, &batches).await;
                if let Some(guard) = watchdog {
                    guard.abort();
                }
                match result {
                    Ok(StepOutcome::Completed {
                        ..
                    }) => TaskResult::Completed(step.step_id.clone()),
                    Ok(StepOutcome::Skipped) => TaskResult::Settled(step.step_id.clone()),
                    Ok(StepOutcome::Cancelled {
                        ..
                    }) => TaskResult::Cancelled,
                    Err(failure) => {
                        TaskResult::Failed(step.step_id.clone(), step.shard_id.clone(), failure)
                    }
                }
            });
        }

        let mut outcome = StageOutcome::default();
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok(TaskResult::Completed(step_id)) => outcome.completed.push(step_id),
                // Previously settled steps still need rollback coverage.
                Ok(TaskResult::Settled(step_id)) => outcome.completed.insert(0, step_id),
                Ok(TaskResult::Cancelled) => outcome.cancelled = true,
                Ok(TaskResult::NotStarted) => {}
                Ok(TaskResult::Failed(step_id, shard_id, failure)) => {
                    halted.store(true, Ordering::SeqCst);
                    if outcome.failure.is_none() {
                        outcome.failure = Some((step_id, shard_id, failure));
                    }
                }
                Err(join_err) => {
                    halted.store(true, Ordering::SeqCst);
                    if outcome.failure.is_none() {
                        outcome.failure = Some((
                            StepId::new("unknown"),
                            ShardId::new("unknown"),
                            StepFailure::new(ErrorClass::Fatal, join_err.to_string()),
                        ));
                    }
                }
            }
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Rollback
    // ------------------------------------------------------------------

    /// Compensates completed steps in reverse completion order.
    async fn rollback(
        &self,
        record: MigrationRecord,
        env: &ExecutorEnv,
        plan: &Plan,
        snapshot: &TopologySnapshot,
        completed_order: Vec<StepId>,
    ) -> Result<MigrationRecord, EngineError> {
        let migration_id = record.migration_id.clone();
        let mut record = self.cas_state(record, MigrationState::RollingBack).await?;

        // Crash-recovered completions may predate this run; fold them in by
        // stage order before reversing.
        let progress = self.status.list_progress(&migration_id).await?;
        let settled: BTreeSet<&str> = progress
            .iter()
            .filter(|p| p.status.is_settled())
            .map(|p| p.step_id.as_str())
            .collect();
        let mut sequence = completed_order;
        for step in plan.steps() {
            if settled.contains(step.step_id.as_str())
                && !sequence.iter().any(|known| known == &step.step_id)
            {
                sequence.push(step.step_id.clone());
            }
        }
        sequence.reverse();

        let mut unrecoverable: Vec<StepId> = Vec::new();
        for step_id in &sequence {
            let Some(step) = plan.step(step_id) else {
                continue;
            };
            let shard = snapshot.shard(record.store_class, &step.shard_id)?;
            match compensate_step(env, step, shard).await {
                Ok(CompensationOutcome::Compensated {
                    method,
                }) => {
                    self.events
                        .emit(
                            &migration_id,
                            EventKind::StepCompleted,
                            json!({
                                "step_id": step.step_id,
                                "shard_id": step.shard_id,
                                "compensation": method,
                            }),
                        )
                        .await?;
                }
                Ok(CompensationOutcome::Unrecoverable {
                    reason,
                }) => {
                    self.events
                        .emit(
                            &migration_id,
                            EventKind::StepFailed,
                            json!({
                                "step_id": step.step_id,
                                "shard_id": step.shard_id,
                                "unrecoverable": reason,
                            }),
                        )
                        .await?;
                    unrecoverable.push(step.step_id.clone());
                }
                Err(failure) => {
                    self.events
                        .emit(
                            &migration_id,
                            EventKind::StepFailed,
                            json!({
                                "step_id": step.step_id,
                                "shard_id": step.shard_id,
                                "unrecoverable": failure.message,
                            }),
                        )
                        .await?;
                    unrecoverable.push(step.step_id.clone());
                }
            }
        }

        record.ended_at = Some(self.clock.now());
        if unrecoverable.is_empty() {
            record.outcome = Some(MigrationOutcome::RolledBack);
            let record = self.cas_state(record, MigrationState::RolledBack).await?;
            self.events
                .emit(
                    &migration_id,
                    EventKind::RolledBack,
                    json!({"compensated_steps": sequence.len()}),
                )
                .await?;
            Ok(record)
        } else {
            record.outcome = Some(MigrationOutcome::Failed {
                unrecoverable_steps: unrecoverable.clone(),
            });
            let record = self.cas_state(record, MigrationState::Failed).await?;
            self.emit_failed(&record).await?;
            Ok(record)
        }
    }

    // ------------------------------------------------------------------
    // Terminal helpers
    // ------------------------------------------------------------------

    /// Aggregates counters and finalizes a validated migration.
    async fn finalize_completed(
        &self,
        mut record: MigrationRecord,
        migration_id: &MigrationId,
    ) -> Result<MigrationRecord, EngineError> {
        let progress = self.status.list_progress(migration_id).await?;
        record.counters.items_processed =
            progress.iter().map(|p| p.items_processed).sum();
        record.counters.steps_completed =
            progress.iter().filter(|p| p.status.is_settled()).count() as u64;
        record.ended_at = Some(self.clock.now());
        record.outcome = Some(MigrationOutcome::Completed);
        let record = self.cas_state(record, MigrationState::Completed).await?;
        self.events
            .emit(
                migration_id,
                EventKind::Completed,
                json!({
                    "items_processed": record.counters.items_processed,
                    "steps_completed": record.counters.steps_completed,
                }),
            )
            .await?;
        Ok(record)
    }

    /// Walks a `cancelling` record to `cancelled`.
    async fn finalize_cancel(
        &self,
        mut record: MigrationRecord,
    ) -> Result<MigrationRecord, EngineError> {
        let migration_id = record.migration_id.clone();
        record.ended_at = Some(self.clock.now());
        record.outcome = Some(MigrationOutcome::Cancelled);
        let record = self.cas_state(record, MigrationState::Cancelled).await?;
        self.events.emit(&migration_id, EventKind::Cancelled, json!({})).await?;
        Ok(record)
    }

    /// Fails a migration that never started executing steps.
    async fn fail_before_start(
        &self,
        mut record: MigrationRecord,
        class: ErrorClass,
        message: String,
    ) -> Result<MigrationRecord, EngineError> {
        record.error = Some(FailureDetail {
            step_id: None,
            shard_id: None,
            class,
            message,
        });
        record.ended_at = Some(self.clock.now());
        record.outcome = Some(MigrationOutcome::Failed {
            unrecoverable_steps: Vec::new(),
        });
        // Pending walks straight to failed; running records pass failing.
        let record = if record.state == MigrationState::Running {
            let record = self.cas_state(record, MigrationState::Failing).await?;
            self.cas_state(record, MigrationState::Failed).await?
        } else {
            self.cas_state(record, MigrationState::Failed).await?
        };
        self.emit_failed(&record).await?;
        Ok(record)
    }

    /// Emits the terminal `failed` event with its failure detail.
    async fn emit_failed(&self, record: &MigrationRecord) -> Result<(), EngineError> {
        let detail = record.error.as_ref();
        self.events
            .emit(
                &record.migration_id,
                EventKind::Failed,
                json!({
                    "step_id": detail.and_then(|d| d.step_id.clone()),
                    "shard_id": detail.and_then(|d| d.shard_id.clone()),
                    "class": detail.map(|d| d.class),
                    "message": detail.map(|d| d.message.clone()),
                    "outcome": record.outcome,
                }),
            )
            .await
            .map_err(Into::into)
    }

    /// CAS helper: applies a state transition and returns the stored record.
    async fn cas_state(
        &self,
        mut record: MigrationRecord,
        next: MigrationState,
    ) -> Result<MigrationRecord, EngineError> {
        record.state = next;
        self.status.cas_migration(&record).await.map_err(Into::into)
    }

    /// Loads a record or fails with `NotFound`.
    async fn load(&self, migration_id: &MigrationId) -> Result<MigrationRecord, EngineError> {
        self.status
            .load_migration(migration_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(migration_id.as_str().to_string()))
    }

    /// Registers a live run's cancellation token.
    fn register_live(&self, migration_id: &MigrationId) -> Result<CancellationToken, EngineError> {
        let token = CancellationToken::new();
        self.live
            .lock()
            .map_err(|_| StatusStoreError::Store("live-run mutex poisoned".to_string()))?
            .insert(migration_id.as_str().to_string(), token.clone());
        Ok(token)
    }

    /// Unregisters a live run.
    fn unregister_live(&self, migration_id: &MigrationId) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(migration_id.as_str());
        }
    }
}

// ============================================================================
// SECTION: Stage Types
// ============================================================================

/// Result of one stage execution.
#[derive(Default)]
struct StageOutcome {
    /// Steps settled this stage, in completion order.
    completed: Vec<StepId>,
    /// First step failure observed.
    failure: Option<(StepId, ShardId, StepFailure)>,
    /// True when cancellation was observed.
    cancelled: bool,
}

impl StageOutcome {
    /// A stage outcome carrying a single failure.
    fn failed(step_id: StepId, shard_id: ShardId, failure: StepFailure) -> Self {
        Self {
            completed: Vec::new(),
            failure: Some((step_id, shard_id, failure)),
            cancelled: false,
        }
    }
}

/// Per-task result inside a stage.
enum TaskResult {
    /// Step completed this run.
    Completed(StepId),
    /// Step was already settled (crash recovery).
    Settled(StepId),
    /// Step observed cancellation at a commit boundary.
    Cancelled,
    /// Step failed.
    Failed(StepId, ShardId, StepFailure),
    /// Dispatch was halted before the step started.
    NotStarted,
}

/// Lazily created per-shard mutexes enforcing one executor per shard.
#[derive(Default, Clone)]
struct ShardGates {
    /// Gate map keyed by shard id.
    gates: Arc<Mutex<BTreeMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ShardGates {
    /// Returns the gate for a shard, creating it on first use.
    fn gate(&self, shard_id: &ShardId) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = match self.gates.lock() {
            Ok(gates) => gates,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            gates
                .entry(shard_id.as_str().to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Computes the lock resources a plan needs: every target collection and
/// every planned shard.
fn lock_resources(plan: &Plan) -> Vec<LockResource> {
    let mut resources: Vec<LockResource> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for step in plan.steps() {
        let collection = LockResource::Collection {
            name: step.collection.clone(),
        };
        if seen.insert(collection.as_key()) {
            resources.push(collection);
        }
        let shard = LockResource::Shard {
            store_class: plan.store_class,
            shard_id: step.shard_id.clone(),
        };
        if seen.insert(shard.as_key()) {
            resources.push(shard);
        }
    }
    resources
}

/// Mints a random owner token.
fn mint_owner_token() -> OwnerToken {
    OwnerToken::new(format!("coord-{}", random_hex()))
}

/// Returns eight random bytes as lowercase hex.
fn random_hex() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies lock resources cover collections and shards exactly once.
    #[test]
    fn lock_resources_deduplicate() {
        use shardflow_core::CollectionName;
        use shardflow_core::SchemaChange;
        use shardflow_core::StepKind;
        use shardflow_core::StepPayload;
        use shardflow_core::TopologyVersion;

        let step = |id: &str, shard: &str| PlannedStep {
            step_id: StepId::new(format!("{id}@{shard}")),
            source_step: StepId::new(id),
            kind: StepKind::Schema,
            collection: CollectionName::new("messages"),
            shard_id: ShardId::new(shard),
            payload: StepPayload::Schema {
                change: SchemaChange {
                    change_id: "c1".to_string(),
                    definition: serde_json::json!({}),
                    down: None,
                },
            },
            depth: 1,
            estimated_items: None,
            deadline_ms: None,
        };
        let plan = Plan {
            request_id: shardflow_core::RequestId::new("req"),
            store_class: StoreClass::Document,
            topology_version: TopologyVersion::new(1),
            stages: vec![Stage {
                index: 0,
                steps: vec![step("a", "s1"), step("b", "s1"), step("a", "s2")],
            }],
        };
        let resources = lock_resources(&plan);
        // One collection lock plus two shard locks.
        assert_eq!(resources.len(), 3);
    }
}
