// shardflow-engine/tests/crash_resume.rs
// ============================================================================
// Module: Crash Resume Scenario Test
// Description: Executor resume after a crash between target apply and
//              cursor advance.
// Purpose: Validate idempotent replay and exactly-once cursor accounting.
// Dependencies: shardflow-core, shardflow-engine, tokio
// ============================================================================
//! ## Overview
//! Models the coordinator dying after `apply_batch` committed on the shard
//! but before the status store cursor advanced: the target already holds the
//! transformed batch while the progress record still points at the previous
//! checkpoint. A resumed executor replays the batch (upserts by id are
//! no-ops), advances the cursor exactly once, and finishes with
//! `items_processed` equal to the source row count.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only panic-based assertions are permitted."
)]

mod common;

use std::sync::Arc;

use common::add_version;
use common::test_config;
use serde_json::json;
use shardflow_core::CollectionName;
use shardflow_core::InMemoryStatusStore;
use shardflow_core::InMemoryStoreDriver;
use shardflow_core::LockResource;
use shardflow_core::MigrationId;
use shardflow_core::NoBackupCatalog;
use shardflow_core::NullPublisher;
use shardflow_core::OwnerToken;
use shardflow_core::PlannedStep;
use shardflow_core::ProgressStatus;
use shardflow_core::Record;
use shardflow_core::ShardId;
use shardflow_core::ShardInfo;
use shardflow_core::ShardProgress;
use shardflow_core::StatusStore;
use shardflow_core::StepId;
use shardflow_core::StepKind;
use shardflow_core::StepPayload;
use shardflow_core::StoreClass;
use shardflow_core::Timestamp;
use shardflow_core::TransformId;
use shardflow_core::TransformerRegistry;
use shardflow_core::TxnSupport;
use shardflow_engine::EventLog;
use shardflow_engine::ExecutorEnv;
use shardflow_engine::LogicalClock;
use shardflow_engine::StepOutcome;
use shardflow_engine::executor::run_step;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

fn planned_data_step() -> PlannedStep {
    PlannedStep {
        step_id: StepId::new("d1@shard-0"),
        source_step: StepId::new("d1"),
        kind: StepKind::Data,
        collection: CollectionName::new("messages"),
        shard_id: ShardId::new("shard-0"),
        payload: StepPayload::Data {
            transform: TransformId::new("add-version"),
        },
        depth: 1,
        estimated_items: None,
        deadline_ms: None,
    }
}

#[tokio::test]
async fn resumed_executor_replays_batch_exactly_once() {
    let status = InMemoryStatusStore::new();
    let driver = InMemoryStoreDriver::new(TxnSupport::SingleBatch);
    let clock = Arc::new(LogicalClock::new());
    let migration_id = MigrationId::new("mig-crash");
    let shard_id = ShardId::new("shard-0");
    let collection = CollectionName::new("messages");

    // Thirty source records; batch size ten (from the test tuning).
    let source: Vec<Record> = (0..30)
        .map(|index| Record::new(format!("rec-{index:04}"), json!({"body": format!("m{index}")})))
        .collect();
    driver.seed(&shard_id, &collection, source.clone());

    // Crash imprint: the first batch was applied at the target, but neither
    // the cursor nor the item count reached the status store.
    let transformed: Vec<Record> = source[..10]
        .iter()
        .map(|record| {
            let mut fields = record.fields.clone();
            fields["version"] = json!(2);
            Record::new(record.id.clone(), fields)
        })
        .collect();
    driver.seed(&shard_id, &collection, transformed);

    let resource = LockResource::Shard {
        store_class: StoreClass::Document,
        shard_id: shard_id.clone(),
    };
    let lease = status
        .try_acquire_lock(&resource, &migration_id, Timestamp::Logical(0), 60_000)
        .await
        .unwrap();
    let mut running = ShardProgress::pending(
        migration_id.clone(),
        StepId::new("d1@shard-0"),
        shard_id.clone(),
    );
    running.status = ProgressStatus::Running;
    running.started_at = Some(Timestamp::Logical(0));
    status.upsert_progress(&running, &resource, lease.fencing_token).await.unwrap();

    let mut transforms = TransformerRegistry::new();
    transforms.register(TransformId::new("add-version"), add_version());
    let config = test_config();
    let env = ExecutorEnv {
        migration_id: migration_id.clone(),
        store_class: StoreClass::Document,
        driver: Arc::new(driver.clone()),
        status: Arc::new(status.clone()),
        transforms: Arc::new(transforms),
        backup: Arc::new(NoBackupCatalog),
        events: Arc::new(EventLog::new(
            Arc::new(status.clone()),
            Arc::new(NullPublisher),
            clock.clone(),
            OwnerToken::new("coord-2"),
        )),
        retry: config.retry,
        tuning: config.tuning,
        clock,
    };

    let step = planned_data_step();
    let shard = ShardInfo {
        shard_id: shard_id.clone(),
        dsn: "mem://shard-0".to_string(),
    };
    let cancel = CancellationToken::new();
    let batches = Semaphore::new(2);

    let outcome =
        run_step(&env, &step, &shard, &resource, lease.fencing_token, &cancel, &batches)
            .await
            .unwrap();
    assert_eq!(
        outcome,
        StepOutcome::Completed {
            items: 30
        }
    );

    // The cursor advanced exactly once per batch: the final item count
    // equals the source row count, with no double counting of the replayed
    // batch.
    let progress = status
        .load_progress(&migration_id, &StepId::new("d1@shard-0"), &shard_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(progress.status, ProgressStatus::Completed);
    assert_eq!(progress.items_processed, 30);

    // Duplicate upserts were no-ops by id.
    let records = driver.dump(&shard_id, &collection);
    assert_eq!(records.len(), 30);
    assert!(records.iter().all(|record| record.fields["version"] == json!(2)));

    // A second executor run finds the settled unit and does nothing.
    let rerun =
        run_step(&env, &step, &shard, &resource, lease.fencing_token, &cancel, &batches)
            .await
            .unwrap();
    assert_eq!(rerun, StepOutcome::Skipped);
}
