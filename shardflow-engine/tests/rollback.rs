// shardflow-engine/tests/rollback.rs
// ============================================================================
// Module: Rollback Scenario Tests
// Description: Validation-failure rollback and unrecoverable terminal state.
// Purpose: Validate compensation paths, lock retention, and operator
//          acknowledgement.
// Dependencies: shardflow-core, shardflow-engine
// ============================================================================
//! ## Overview
//! Two scenarios. A post-validation failure rolls the migration back via the
//! inverse transformation and restores the pre-migration records. A data
//! step with neither an inverse nor a usable snapshot terminates in `failed`
//! with the unrecoverable steps listed and its locks retained until an
//! operator acknowledges.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only panic-based assertions are permitted."
)]

mod common;

use std::sync::Arc;

use common::HarnessBuilder;
use common::SnapshotBackup;
use common::data_step;
use common::request;
use common::schema_step;
use serde_json::json;
use shardflow_core::CollectionName;
use shardflow_core::MigrationOutcome;
use shardflow_core::MigrationState;
use shardflow_core::ProbeSpec;
use shardflow_core::Record;
use shardflow_core::ShardId;
use shardflow_core::StatusStore;
use shardflow_core::TransformFn;

/// Transformer renaming `body` to `text`.
fn rename_body_to_text() -> TransformFn {
    Arc::new(|record: &Record| {
        let mut fields = record.fields.clone();
        if let Some(map) = fields.as_object_mut() {
            if let Some(body) = map.remove("body") {
                map.insert("text".to_string(), body);
            }
        }
        Ok(Some(Record::new(record.id.clone(), fields)))
    })
}

/// Inverse of [`rename_body_to_text`].
fn rename_text_to_body() -> TransformFn {
    Arc::new(|record: &Record| {
        let mut fields = record.fields.clone();
        if let Some(map) = fields.as_object_mut() {
            if let Some(text) = map.remove("text") {
                map.insert("body".to_string(), text);
            }
        }
        Ok(Some(Record::new(record.id.clone(), fields)))
    })
}

/// Verifies a failed cross-shard probe rolls the migration back via the
/// inverse transformation, restoring pre-state.
#[tokio::test]
async fn validation_failure_rolls_back_with_inverse() {
    let harness = HarnessBuilder::new(2)
        .transform_with_inverse("rename-body", rename_body_to_text(), rename_text_to_body())
        .build();
    // Duplicate `uid` values across shards make the uniqueness probe fail.
    for shard in ["shard-0", "shard-1"] {
        harness.driver.seed(
            &ShardId::new(shard),
            &CollectionName::new("messages"),
            (0..10)
                .map(|index| {
                    Record::new(
                        format!("rec-{index:04}"),
                        json!({"body": format!("m{index}"), "uid": format!("uid-{index}")}),
                    )
                })
                .collect(),
        );
    }
    let before = harness.driver.dump(&ShardId::new("shard-0"), &CollectionName::new("messages"));

    let mut req = request(
        "r1",
        vec![schema_step("s1", "messages"), data_step("d1", "messages", "rename-body")],
    );
    req.validation.probes = vec![ProbeSpec::UniqueField {
        collection: CollectionName::new("messages"),
        field: "uid".to_string(),
    }];

    let record = harness.service.create_migration(req).await.unwrap();
    let terminal = harness.service.start(&record.migration_id).await.unwrap();

    assert_eq!(terminal.state, MigrationState::RolledBack);
    assert_eq!(terminal.outcome, Some(MigrationOutcome::RolledBack));
    let error = terminal.error.unwrap();
    assert!(error.message.contains("not unique"), "unexpected error: {}", error.message);

    // The inverse transformation restored the pre-migration records.
    let after = harness.driver.dump(&ShardId::new("shard-0"), &CollectionName::new("messages"));
    assert_eq!(before, after);

    // Rollback released the leases.
    assert!(harness.status.list_locks().await.unwrap().is_empty());
}

/// Verifies a snapshot-backed rollback restores from the captured snapshot
/// when the transformer has no inverse.
#[tokio::test]
async fn validation_failure_restores_from_snapshot() {
    let driver = shardflow_core::InMemoryStoreDriver::default();
    let backup = Arc::new(SnapshotBackup::working(driver.clone()));
    let harness = HarnessBuilder::new(1)
        .transform("rename-body", rename_body_to_text())
        .backup(backup)
        .build_with_driver(driver);
    // Two records share a `uid`, so the uniqueness probe fails post-run.
    harness.driver.seed(
        &ShardId::new("shard-0"),
        &CollectionName::new("messages"),
        (0..8)
            .map(|index| {
                Record::new(
                    format!("rec-{index:04}"),
                    json!({"body": format!("m{index}"), "uid": format!("uid-{}", index / 2)}),
                )
            })
            .collect(),
    );
    let before = harness.driver.dump(&ShardId::new("shard-0"), &CollectionName::new("messages"));

    let mut req = request("r1", vec![data_step("d1", "messages", "rename-body")]);
    req.validation.probes = vec![ProbeSpec::UniqueField {
        collection: CollectionName::new("messages"),
        field: "uid".to_string(),
    }];

    let record = harness.service.create_migration(req).await.unwrap();
    let terminal = harness.service.start(&record.migration_id).await.unwrap();
    assert_eq!(terminal.state, MigrationState::RolledBack);

    // Restore replays the pre-step snapshot byte for byte.
    let after = harness.driver.dump(&ShardId::new("shard-0"), &CollectionName::new("messages"));
    assert_eq!(before, after);
}

/// Verifies a rollback without inverse or snapshot terminates `failed` with
/// the unrecoverable steps listed and locks retained until acknowledged.
#[tokio::test]
async fn unrecoverable_rollback_keeps_locks_until_acknowledged() {
    let seed_driver = shardflow_core::InMemoryStoreDriver::default();
    let backup = Arc::new(SnapshotBackup::broken(seed_driver.clone()));
    let harness = HarnessBuilder::new(1)
        .transform("rename-body", rename_body_to_text())
        .backup(backup)
        .build_with_driver(seed_driver);
    // Force post-validation failure via a duplicated `uid`.
    harness.driver.seed(
        &ShardId::new("shard-0"),
        &CollectionName::new("messages"),
        (0..6)
            .map(|index| {
                Record::new(
                    format!("rec-{index:04}"),
                    json!({"body": format!("m{index}"), "uid": format!("uid-{}", index / 2)}),
                )
            })
            .collect(),
    );

    let mut req = request("r1", vec![data_step("d1", "messages", "rename-body")]);
    req.validation.probes = vec![ProbeSpec::UniqueField {
        collection: CollectionName::new("messages"),
        field: "uid".to_string(),
    }];

    let record = harness.service.create_migration(req).await.unwrap();
    let terminal = harness.service.start(&record.migration_id).await.unwrap();

    assert_eq!(terminal.state, MigrationState::Failed);
    match terminal.outcome {
        Some(MigrationOutcome::Failed {
            ref unrecoverable_steps,
        }) => {
            assert_eq!(unrecoverable_steps.len(), 1);
            assert!(unrecoverable_steps[0].as_str().starts_with("d1"));
        }
        other => panic!("expected unrecoverable failure outcome, got {other:?}"),
    }

    // Locks are retained until the operator acknowledges.
    assert!(!harness.status.list_locks().await.unwrap().is_empty());
    harness.service.coordinator().acknowledge_unrecoverable(&record.migration_id).await.unwrap();
    assert!(harness.status.list_locks().await.unwrap().is_empty());
}
