// shardflow-core/tests/status_store.rs
// ============================================================================
// Module: In-Memory Status Store Tests
// Description: Tests for CAS, fencing, progress monotonicity, and locks.
// Purpose: Validate the document-style status store against its contract.
// Dependencies: shardflow-core, tokio
// ============================================================================
//! ## Overview
//! Exercises the append-or-CAS contract: version conflicts, illegal state
//! transitions, stale fencing tokens, items_processed monotonicity, lock
//! exclusivity with TTL expiry and reaping, and event buffering.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only panic-based assertions are permitted."
)]

use serde_json::json;
use shardflow_core::AggregateCounters;
use shardflow_core::EventId;
use shardflow_core::EventKind;
use shardflow_core::EventRecord;
use shardflow_core::FencingToken;
use shardflow_core::IdempotencyKey;
use shardflow_core::InMemoryStatusStore;
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

fn sample_migration(id: &str) -> MigrationRecord {
    MigrationRecord {
        migration_id: MigrationId::new(id),
        request_id: RequestId::new(format!("req-{id}")),
        name: format!("migration {id}"),
        store_class: StoreClass::Document,
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
        store_class: StoreClass::Document,
        shard_id: ShardId::new(shard),
    }
}

/// Verifies create/load round-trips and duplicate creation fails.
#[tokio::test]
async fn create_and_load_migration() {
    let store = InMemoryStatusStore::new();
    let record = sample_migration("m1");

    store.create_migration(&record).await.unwrap();
    let loaded = store.load_migration(&MigrationId::new("m1")).await.unwrap();
    assert_eq!(loaded, Some(record.clone()));

    let err = store.create_migration(&record).await.unwrap_err();
    assert!(matches!(err, StatusStoreError::AlreadyExists(_)));
}

/// Verifies idempotency-key lookup finds the admitted migration.
#[tokio::test]
async fn find_by_idempotency_key() {
    let store = InMemoryStatusStore::new();
    store.create_migration(&sample_migration("m1")).await.unwrap();

    let found = store.find_by_idempotency_key(&IdempotencyKey::new("idem-m1")).await.unwrap();
    assert_eq!(found.unwrap().migration_id, MigrationId::new("m1"));
    let missing = store.find_by_idempotency_key(&IdempotencyKey::new("other")).await.unwrap();
    assert!(missing.is_none());
}

/// Verifies CAS rejects version mismatches and bumps versions on success.
#[tokio::test]
async fn cas_enforces_versions() {
    let store = InMemoryStatusStore::new();
    let record = sample_migration("m1");
    store.create_migration(&record).await.unwrap();

    let mut update = record.clone();
    update.state = MigrationState::Planning;
    let stored = store.cas_migration(&update).await.unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.state, MigrationState::Planning);

    // Re-presenting the stale version must conflict.
    let err = store.cas_migration(&update).await.unwrap_err();
    assert!(matches!(err, StatusStoreError::VersionConflict { .. }));
}

/// Verifies CAS rejects illegal state transitions.
#[tokio::test]
async fn cas_enforces_state_machine() {
    let store = InMemoryStatusStore::new();
    let record = sample_migration("m1");
    store.create_migration(&record).await.unwrap();

    let mut update = record.clone();
    update.state = MigrationState::Completed;
    let err = store.cas_migration(&update).await.unwrap_err();
    assert!(matches!(err, StatusStoreError::IllegalTransition { .. }));
}

/// Verifies a takeover claim swaps the owner token under version CAS.
#[tokio::test]
async fn claim_swaps_owner_token() {
    let store = InMemoryStatusStore::new();
    store.create_migration(&sample_migration("m1")).await.unwrap();

    let claimed = store
        .claim_migration(&MigrationId::new("m1"), &OwnerToken::new("owner-2"), 0)
        .await
        .unwrap();
    assert_eq!(claimed.owner_token, OwnerToken::new("owner-2"));
    assert_eq!(claimed.version, 1);

    let err = store
        .claim_migration(&MigrationId::new("m1"), &OwnerToken::new("owner-3"), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, StatusStoreError::VersionConflict { .. }));
}

/// Verifies progress writes reject stale fencing tokens.
#[tokio::test]
async fn progress_rejects_stale_fencing_token() {
    let store = InMemoryStatusStore::new();
    store.create_migration(&sample_migration("m1")).await.unwrap();
    let resource = shard_resource("shard-1");

    let lease = store
        .try_acquire_lock(&resource, &MigrationId::new("m1"), Timestamp::Logical(0), 1_000)
        .await
        .unwrap();

    let progress = ShardProgress {
        status: ProgressStatus::Running,
        items_processed: 10,
        ..ShardProgress::pending(
            MigrationId::new("m1"),
            StepId::new("s1"),
            ShardId::new("shard-1"),
        )
    };
    store.upsert_progress(&progress, &resource, lease.fencing_token).await.unwrap();

    // A lower token models a zombie coordinator and must be fenced out.
    let stale = FencingToken::new(lease.fencing_token.get() - 1);
    let err = store.upsert_progress(&progress, &resource, stale).await.unwrap_err();
    assert!(matches!(err, StatusStoreError::StaleFencingToken { .. }));
}

/// Verifies items_processed may never regress.
#[tokio::test]
async fn progress_is_monotonic() {
    let store = InMemoryStatusStore::new();
    store.create_migration(&sample_migration("m1")).await.unwrap();
    let resource = shard_resource("shard-1");
    let lease = store
        .try_acquire_lock(&resource, &MigrationId::new("m1"), Timestamp::Logical(0), 1_000)
        .await
        .unwrap();

    let mut progress = ShardProgress::pending(
        MigrationId::new("m1"),
        StepId::new("s1"),
        ShardId::new("shard-1"),
    );
    progress.status = ProgressStatus::Running;
    progress.items_processed = 100;
    store.upsert_progress(&progress, &resource, lease.fencing_token).await.unwrap();

    progress.items_processed = 50;
    let err = store.upsert_progress(&progress, &resource, lease.fencing_token).await.unwrap_err();
    assert!(matches!(err, StatusStoreError::ProgressRegression { .. }));
}

/// Verifies lock exclusivity, holder re-entry, and TTL takeover.
#[tokio::test]
async fn locks_are_exclusive_until_expiry() {
    let store = InMemoryStatusStore::new();
    store.create_migration(&sample_migration("m1")).await.unwrap();
    store.create_migration(&sample_migration("m2")).await.unwrap();
    let resource = LockResource::Collection {
        name: shardflow_core::CollectionName::new("messages"),
    };

    let first = store
        .try_acquire_lock(&resource, &MigrationId::new("m1"), Timestamp::Logical(0), 100)
        .await
        .unwrap();

    let err = store
        .try_acquire_lock(&resource, &MigrationId::new("m2"), Timestamp::Logical(10), 100)
        .await
        .unwrap_err();
    assert!(matches!(err, StatusStoreError::LockBusy { .. }));

    // Past expiry, a second migration takes over with a strictly higher token.
    let second = store
        .try_acquire_lock(&resource, &MigrationId::new("m2"), Timestamp::Logical(200), 100)
        .await
        .unwrap();
    assert!(second.fencing_token > first.fencing_token);
}

/// Verifies locks of terminal holders are reaped.
#[tokio::test]
async fn reap_removes_terminal_holder_locks() {
    let store = InMemoryStatusStore::new();
    let record = sample_migration("m1");
    store.create_migration(&record).await.unwrap();
    let resource = shard_resource("shard-1");
    store
        .try_acquire_lock(&resource, &MigrationId::new("m1"), Timestamp::Logical(0), 10_000)
        .await
        .unwrap();

    // Walk the record to a terminal state.
    let mut update = record.clone();
    update.state = MigrationState::Cancelling;
    let stored = store.cas_migration(&update).await.unwrap();
    let mut update = stored.clone();
    update.state = MigrationState::Cancelled;
    store.cas_migration(&update).await.unwrap();

    let reaped = store.reap_stale_locks(Timestamp::Logical(1), 0).await.unwrap();
    assert_eq!(reaped.len(), 1);
    assert!(store.list_locks().await.unwrap().is_empty());
}

/// Verifies event append order, dedupe, and publish marking.
#[tokio::test]
async fn events_buffer_and_drain() {
    let store = InMemoryStatusStore::new();
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
        // At-least-once emitters may append twice; the second is a no-op.
        store.append_event(&event).await.unwrap();
    }

    let events = store.list_events(&migration_id).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, EventKind::Created);
    assert_eq!(events[1].kind, EventKind::Started);

    assert_eq!(store.unpublished_events(10).await.unwrap().len(), 2);
    store.mark_event_published(&EventId::new("e0")).await.unwrap();
    let unpublished = store.unpublished_events(10).await.unwrap();
    assert_eq!(unpublished.len(), 1);
    assert_eq!(unpublished[0].event_id, EventId::new("e1"));
}
