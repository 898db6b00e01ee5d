// shardflow-engine/tests/happy_path.rs
// ============================================================================
// Module: Happy Path Scenario Test
// Description: Full migration across three shards with schema then data.
// Purpose: Validate end-to-end completion, counters, events, and lock
//          release.
// Dependencies: shardflow-core, shardflow-engine
// ============================================================================
//! ## Overview
//! Migrates collection `messages` across three shards: one schema step and
//! one data step stamping `version: 2` on every record. Asserts the terminal
//! state, per-shard progress, aggregate counters, the event walk, and that
//! all leases are released.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only panic-based assertions are permitted."
)]

mod common;

use std::sync::Arc;

use common::HarnessBuilder;
use common::RecordingPublisher;
use common::add_version;
use common::data_step;
use common::remove_version;
use common::request;
use common::schema_step;
use common::seed_messages;
use serde_json::json;
use shardflow_core::CollectionName;
use shardflow_core::EventKind;
use shardflow_core::MigrationState;
use shardflow_core::ProgressStatus;
use shardflow_core::ShardId;
use shardflow_core::StatusStore;

#[tokio::test]
async fn migration_completes_across_three_shards() {
    let publisher = RecordingPublisher::default();
    let harness = HarnessBuilder::new(3)
        .transform_with_inverse("add-version", add_version(), remove_version())
        .publisher(Arc::new(publisher.clone()))
        .build();
    for shard in ["shard-0", "shard-1", "shard-2"] {
        seed_messages(&harness.driver, shard, "messages", 25);
    }

    let record = harness
        .service
        .create_migration(request(
            "r1",
            vec![schema_step("s1", "messages"), data_step("d1", "messages", "add-version")],
        ))
        .await
        .unwrap();
    assert_eq!(record.state, MigrationState::Pending);
    assert!(record.plan_digest.is_some());
    assert_eq!(record.counters.steps_total, 6);

    let terminal = harness.service.start(&record.migration_id).await.unwrap();
    assert_eq!(terminal.state, MigrationState::Completed);
    assert_eq!(terminal.counters.items_processed, 75);
    assert_eq!(terminal.counters.steps_completed, 6);

    // Every record on every shard carries the new field.
    for shard in ["shard-0", "shard-1", "shard-2"] {
        let records =
            harness.driver.dump(&ShardId::new(shard), &CollectionName::new("messages"));
        assert_eq!(records.len(), 25);
        assert!(records.iter().all(|r| r.fields["version"] == json!(2)));
        assert!(harness.driver.schema_applied(
            &ShardId::new(shard),
            &CollectionName::new("messages"),
            "s1-change"
        ));
    }

    // Every progress unit settled.
    let (_, progress) = harness.service.get_migration(&record.migration_id).await.unwrap();
    assert_eq!(progress.len(), 6);
    assert!(progress.iter().all(|p| p.status == ProgressStatus::Completed));
    let data_items: u64 = progress
        .iter()
        .filter(|p| p.step_id.as_str().starts_with("d1"))
        .map(|p| p.items_processed)
        .sum();
    assert_eq!(data_items, 75);

    // The event history walks the lifecycle in order.
    let events = harness.status.list_events(&record.migration_id).await.unwrap();
    let kinds: Vec<EventKind> = events.iter().map(|event| event.kind).collect();
    assert_eq!(kinds[0], EventKind::Created);
    assert_eq!(kinds[1], EventKind::Started);
    assert_eq!(*kinds.last().unwrap(), EventKind::Completed);
    let step_started = kinds.iter().filter(|kind| **kind == EventKind::StepStarted).count();
    let step_completed = kinds.iter().filter(|kind| **kind == EventKind::StepCompleted).count();
    assert_eq!(step_started, 6);
    assert_eq!(step_completed, 6);
    assert!(kinds.iter().filter(|kind| **kind == EventKind::Progress).count() >= 6);
    // Started precedes every step event; completion is last.
    let first_step = kinds.iter().position(|kind| *kind == EventKind::StepStarted).unwrap();
    assert!(first_step > 1);

    // The bus saw the same walk (at-least-once, ordered per migration).
    let published = publisher.published.lock().unwrap();
    assert_eq!(published.first().unwrap().1, EventKind::Created);
    assert_eq!(published.last().unwrap().1, EventKind::Completed);

    // All leases were released on commit.
    assert!(harness.status.list_locks().await.unwrap().is_empty());
}

/// Re-running a completed plan is a no-op on the target (idempotence law).
#[tokio::test]
async fn rerun_of_completed_plan_is_noop() {
    let harness = HarnessBuilder::new(2)
        .transform_with_inverse("add-version", add_version(), remove_version())
        .build();
    for shard in ["shard-0", "shard-1"] {
        seed_messages(&harness.driver, shard, "messages", 10);
    }

    let first = harness
        .service
        .create_migration(request(
            "r1",
            vec![schema_step("s1", "messages"), data_step("d1", "messages", "add-version")],
        ))
        .await
        .unwrap();
    harness.service.start(&first.migration_id).await.unwrap();
    let after_first = harness.driver.dump(&ShardId::new("shard-0"), &CollectionName::new("messages"));

    // Same plan, fresh request identity.
    let second = harness
        .service
        .create_migration(request(
            "r2",
            vec![schema_step("s1", "messages"), data_step("d1", "messages", "add-version")],
        ))
        .await
        .unwrap();
    let terminal = harness.service.start(&second.migration_id).await.unwrap();
    assert_eq!(terminal.state, MigrationState::Completed);

    let after_second = harness.driver.dump(&ShardId::new("shard-0"), &CollectionName::new("messages"));
    assert_eq!(after_first, after_second);
}
