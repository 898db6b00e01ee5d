// shardflow-engine/tests/lock_contention.rs
// ============================================================================
// Module: Lock Contention Scenario Test
// Description: Two migrations over overlapping collections.
// Purpose: Validate LockUnavailable failure with no side effects.
// Dependencies: shardflow-core, shardflow-engine
// ============================================================================
//! ## Overview
//! A live migration holds the `collection:messages` lease. A second
//! migration over the same collection admits fine but fails lease
//! acquisition within its bounded contention budget, terminating in
//! `failed` with no data touched.

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
use common::seed_messages;
use shardflow_core::CollectionName;
use shardflow_core::ErrorClass;
use shardflow_core::LockResource;
use shardflow_core::MigrationId;
use shardflow_core::MigrationState;
use shardflow_core::ShardId;
use shardflow_core::StatusStore;
use shardflow_core::Timestamp;

#[tokio::test]
async fn contended_collection_lock_fails_without_side_effects() {
    let harness = HarnessBuilder::new(2)
        .transform_with_inverse("add-version", add_version(), remove_version())
        .build();
    for shard in ["shard-0", "shard-1"] {
        seed_messages(&harness.driver, shard, "messages", 10);
    }

    // A live migration from another coordinator holds the collection lease.
    let other = common::request("other", vec![data_step("d9", "messages", "add-version")]);
    let other_record = harness.service.create_migration(other).await.unwrap();
    harness
        .status
        .try_acquire_lock(
            &LockResource::Collection {
                name: CollectionName::new("messages"),
            },
            &other_record.migration_id,
            Timestamp::Logical(0),
            600_000,
        )
        .await
        .unwrap();

    let record = harness
        .service
        .create_migration(request("r1", vec![data_step("d1", "messages", "add-version")]))
        .await
        .unwrap();
    let terminal = harness.service.start(&record.migration_id).await.unwrap();

    assert_eq!(terminal.state, MigrationState::Failed);
    let error = terminal.error.unwrap();
    assert_eq!(error.class, ErrorClass::Contention);
    assert!(error.message.contains("lock unavailable"), "unexpected error: {}", error.message);

    // No side effects: no data changed, no progress recorded.
    let untouched = harness
        .driver
        .dump(&ShardId::new("shard-0"), &CollectionName::new("messages"))
        .iter()
        .all(|record| record.fields.get("version").is_none());
    assert!(untouched);
    let (_, progress) = harness.service.get_migration(&record.migration_id).await.unwrap();
    assert!(progress.is_empty());

    // The contender's failure never disturbed the holder's lease.
    let locks = harness.status.list_locks().await.unwrap();
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].holder, MigrationId::new(other_record.migration_id.as_str()));
}
