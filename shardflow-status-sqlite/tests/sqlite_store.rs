// shardflow-status-sqlite/tests/sqlite_store.rs
// ============================================================================
// Module: SQLite Status Store Tests
// Description: Tests for the durable status store backend.
// Purpose: Validate CAS, fencing, progress monotonicity, events, and locks
//          against the same contract the in-memory backend satisfies.
// Dependencies: serde_json, shardflow-core, shardflow-status-sqlite,
//               tempfile, tokio
// ============================================================================
//! ## Overview
//! Mirrors the in-memory status store suite over the relational backend and
//! adds durability: a store reopened from the same file sees every record
//! written before the close.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only panic-based assertions are permitted."
)]

use serde_json::json;
use shardflow_core::AggregateCounters;
use shardflow_core::CollectionName;
use shardflow_core::EventId;
use shardflow_core::EventKind;
use shardflow_core::EventRecord;
use shardflow_core::FencingToken;
use shardflow_core::IdempotencyKey;
use shardflow_core::LockResource;
use shardflow_core::MigrationId;
use shardflow_core::MigrationRecord;
use shardflow_core::MigrationState;
use shardflow_core::OwnerToken;
use shardflow_core::ProgressStatus;
use shardflow_core::RequestId;
use shardflow_core::ShardId;
use shardflow_core::ShardProgress;
use shardflow_core::StatusStore;
use shardflow_core::StatusStoreError;
use shardflow_core::StepId;
use shardflow_core::StoreClass;
use shardflow_core::Timestamp;
use shardflow_status_sqlite::SqliteStatusConfig;
use shardflow_status_sqlite::SqliteStatusStore;

fn sample_migration(id: &str) -> MigrationRecord {
    MigrationRecord {
        migration_id: MigrationId::new(id),
        request_id: RequestId::new(format!("req-{id}")),
        name: format!("migration {id}"),
        store_class: StoreClass::Relational,
        idempotency_key: IdempotencyKey::new(format!("idem-{id}")),
        state: MigrationState::Created,
        plan_digest: None,
        owner_token: OwnerToken::new("owner-1"),
        created_at: Timestamp::Logical(0),
        started_at: None,
        ended_at: None,
        current_stage: None,
        counters: AggregateCounters::default(),
        outcome: None,
        error: None,
        version: 0,
    }
}

fn shard_resource(shard: &str) -> LockResource {
    LockResource::Shard {
        store_class: StoreClass::Relational,
        shard_id: ShardId::new(shard),
    }
}

/// Verifies create/load/CAS round-trips with version enforcement.
#[tokio::test]
async fn cas_round_trip_enforces_versions() {
    let store = SqliteStatusStore::open_in_memory().unwrap();
    let record = sample_migration("m1");
    store.create_migration(&record).await.unwrap();

    let err = store.create_migration(&record).await.unwrap_err();
    assert!(matches!(err, StatusStoreError::AlreadyExists(_)));

    let mut update = record.clone();
    update.state = MigrationState::Planning;
    let stored = store.cas_migration(&update).await.unwrap();
    assert_eq!(stored.version, 1);

    let stale = store.cas_migration(&update).await.unwrap_err();
    assert!(matches!(stale, StatusStoreError::VersionConflict { .. }));

    let mut illegal = stored.clone();
    illegal.state = MigrationState::Completed;
    let err = store.cas_migration(&illegal).await.unwrap_err();
    assert!(matches!(err, StatusStoreError::IllegalTransition { .. }));
}

/// Verifies idempotency-key lookup and claim takeover.
#[tokio::test]
async fn idempotency_lookup_and_claim() {
    let store = SqliteStatusStore::open_in_memory().unwrap();
    store.create_migration(&sample_migration("m1")).await.unwrap();

    let found = store.find_by_idempotency_key(&IdempotencyKey::new("idem-m1")).await.unwrap();
    assert_eq!(found.unwrap().migration_id, MigrationId::new("m1"));

    let claimed = store
        .claim_migration(&MigrationId::new("m1"), &OwnerToken::new("owner-2"), 0)
        .await
        .unwrap();
    assert_eq!(claimed.owner_token, OwnerToken::new("owner-2"));
    assert_eq!(claimed.version, 1);
}

/// Verifies fenced progress writes and monotonic item counts.
#[tokio::test]
async fn progress_is_fenced_and_monotonic() {
    let store = SqliteStatusStore::open_in_memory().unwrap();
    store.create_migration(&sample_migration("m1")).await.unwrap();
    let resource = shard_resource("pg-0");
    let lease = store
        .try_acquire_lock(&resource, &MigrationId::new("m1"), Timestamp::Logical(0), 10_000)
        .await
        .unwrap();

    let mut progress =
        ShardProgress::pending(MigrationId::new("m1"), StepId::new("d1@pg-0"), ShardId::new("pg-0"));
    progress.status = ProgressStatus::Running;
    progress.items_processed = 100;
    let stored = store.upsert_progress(&progress, &resource, lease.fencing_token).await.unwrap();
    assert_eq!(stored.version, 1);

    progress.items_processed = 50;
    let err = store.upsert_progress(&progress, &resource, lease.fencing_token).await.unwrap_err();
    assert!(matches!(err, StatusStoreError::ProgressRegression { .. }));

    let stale = FencingToken::new(lease.fencing_token.get() - 1);
    progress.items_processed = 200;
    let err = store.upsert_progress(&progress, &resource, stale).await.unwrap_err();
    assert!(matches!(err, StatusStoreError::StaleFencingToken { .. }));
}

/// Verifies lock exclusivity, expiry takeover, and token stepping.
#[tokio::test]
async fn locks_are_exclusive_with_token_steps() {
    let store = SqliteStatusStore::open_in_memory().unwrap();
    store.create_migration(&sample_migration("m1")).await.unwrap();
    store.create_migration(&sample_migration("m2")).await.unwrap();
    let resource = LockResource::Collection {
        name: CollectionName::new("messages"),
    };

    let first = store
        .try_acquire_lock(&resource, &MigrationId::new("m1"), Timestamp::Logical(0), 100)
        .await
        .unwrap();
    let busy = store
        .try_acquire_lock(&resource, &MigrationId::new("m2"), Timestamp::Logical(50), 100)
        .await
        .unwrap_err();
    assert!(matches!(busy, StatusStoreError::LockBusy { .. }));

    let second = store
        .try_acquire_lock(&resource, &MigrationId::new("m2"), Timestamp::Logical(200), 100)
        .await
        .unwrap();
    assert!(second.fencing_token > first.fencing_token);

    store.release_lock(&resource, &MigrationId::new("m2")).await.unwrap();
    let err = store.release_lock(&resource, &MigrationId::new("m2")).await.unwrap_err();
    assert!(matches!(err, StatusStoreError::LockNotHeld(_)));
}

/// Verifies event append order, dedupe, and publish marking.
#[tokio::test]
async fn events_append_dedupe_and_drain() {
    let store = SqliteStatusStore::open_in_memory().unwrap();
    let migration_id = MigrationId::new("m1");
    for (index, kind) in [EventKind::Created, EventKind::Started].iter().enumerate() {
        let event = EventRecord::new(
            EventId::new(format!("e{index}")),
            migration_id.clone(),
            *kind,
            Timestamp::Logical(index as u64),
            json!({}),
        );
        store.append_event(&event).await.unwrap();
        store.append_event(&event).await.unwrap();
    }

    let events = store.list_events(&migration_id).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, EventKind::Created);

    store.mark_event_published(&EventId::new("e0")).await.unwrap();
    let unpublished = store.unpublished_events(10).await.unwrap();
    assert_eq!(unpublished.len(), 1);
    assert_eq!(unpublished[0].event_id, EventId::new("e1"));
}

/// Verifies a reopened store sees everything written before close.
#[tokio::test]
async fn reopened_store_is_durable() {
    let dir = tempfile::tempdir().unwrap();
    let config = SqliteStatusConfig::new(dir.path().join("status.db"));

    {
        let store = SqliteStatusStore::open(&config).unwrap();
        store.create_migration(&sample_migration("m1")).await.unwrap();
        let event = EventRecord::new(
            EventId::new("e0"),
            MigrationId::new("m1"),
            EventKind::Created,
            Timestamp::Logical(0),
            json!({}),
        );
        store.append_event(&event).await.unwrap();
    }

    let reopened = SqliteStatusStore::open(&config).unwrap();
    let record = reopened.load_migration(&MigrationId::new("m1")).await.unwrap();
    assert_eq!(record.unwrap().migration_id, MigrationId::new("m1"));
    assert_eq!(reopened.list_events(&MigrationId::new("m1")).await.unwrap().len(), 1);
    assert_eq!(reopened.unpublished_events(10).await.unwrap().len(), 1);
}
