// shardflow-engine/tests/topology_shift.rs
// ============================================================================
// Module: Topology Shift Scenario Test
// Description: Shard set changes between planning and execution.
// Purpose: Validate stale-plan detection and operator replan.
// Dependencies: shardflow-core, shardflow-engine
// ============================================================================
//! ## Overview
//! A plan pins the topology snapshot version it was expanded against. When a
//! new shard appears before execution starts, the orchestrator detects the
//! version mismatch, aborts dispatch, and records the stale-topology error;
//! the operator replans against the new snapshot.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only panic-based assertions are permitted."
)]

mod common;

use common::HarnessBuilder;
use common::add_version;
use common::data_step;
use common::remove_version;
use common::request;
use common::schema_step;
use common::seed_messages;
use common::snapshot;
use shardflow_core::ErrorClass;
use shardflow_core::MigrationState;

#[tokio::test]
async fn topology_shift_aborts_dispatch_and_allows_replan() {
    let harness = HarnessBuilder::new(2)
        .transform_with_inverse("add-version", add_version(), remove_version())
        .build();
    for shard in ["shard-0", "shard-1", "shard-2"] {
        seed_messages(&harness.driver, shard, "messages", 5);
    }

    let record = harness
        .service
        .create_migration(request(
            "r1",
            vec![schema_step("s1", "messages"), data_step("d1", "messages", "add-version")],
        ))
        .await
        .unwrap();

    // A third shard appears between planning and execution.
    harness.topology.publish(snapshot(2, 3));

    let terminal = harness.service.start(&record.migration_id).await.unwrap();
    assert_eq!(terminal.state, MigrationState::Failed);
    let error = terminal.error.unwrap();
    assert_eq!(error.class, ErrorClass::Structural);
    assert!(error.message.contains("stale"), "unexpected error: {}", error.message);

    // No progress was recorded for the aborted run.
    let (_, progress) = harness.service.get_migration(&record.migration_id).await.unwrap();
    assert!(progress.is_empty());

    // Operator replan: a fresh request against the new snapshot succeeds.
    let replanned = harness
        .service
        .create_migration(request(
            "r2",
            vec![schema_step("s1", "messages"), data_step("d1", "messages", "add-version")],
        ))
        .await
        .unwrap();
    let terminal = harness.service.start(&replanned.migration_id).await.unwrap();
    assert_eq!(terminal.state, MigrationState::Completed);
    assert_eq!(terminal.counters.steps_total, 6);
}
