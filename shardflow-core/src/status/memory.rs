// shardflow-core/src/status/memory.rs
// ============================================================================
// Module: Shardflow In-Memory Status Store
// Description: Document-style status store with optimistic concurrency.
// Purpose: Provide a deterministic status store for tests and local demos.
// Dependencies: async-trait, crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! This module provides the document-style reference implementation of
//! [`StatusStore`]: every record carries a version field and mutations go
//! through compare-and-swap, mirroring a document store with optimistic
//! concurrency. It backs the engine's test suites and local demos; durable
//! deployments use the relational backend.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::event::EventRecord;
use crate::core::identifiers::EventId;
use crate::core::identifiers::IdempotencyKey;
use crate::core::identifiers::MigrationId;
use crate::core::identifiers::OwnerToken;
use crate::core::identifiers::ShardId;
use crate::core::identifiers::StepId;
use crate::core::lock::FencingToken;
use crate::core::lock::LockRecord;
use crate::core::lock::LockResource;
use crate::core::plan::Plan;
use crate::core::request::MigrationRequest;
use crate::core::state::MigrationRecord;
use crate::core::state::ShardProgress;
use crate::core::time::Timestamp;
use crate::interfaces::MigrationFilter;
use crate::interfaces::StatusStore;
use crate::interfaces::StatusStoreError;

// ============================================================================
// SECTION: Inner State
// ============================================================================

/// Buffered event with its publication flag.
#[derive(Debug, Clone)]
struct BufferedEvent {
    /// The event record.
    record: EventRecord,
    /// True once the bus adapter delivered the event.
    published: bool,
}

/// Mutable store state behind one mutex.
#[derive(Debug, Default)]
struct Inner {
    /// Migration records by id.
    migrations: BTreeMap<String, MigrationRecord>,
    /// Admitted requests by migration id.
    requests: BTreeMap<String, MigrationRequest>,
    /// Stored plans by migration id.
    plans: BTreeMap<String, Plan>,
    /// Progress records by `(migration, step, shard)` key.
    progress: BTreeMap<String, ShardProgress>,
    /// Append-ordered event log.
    events: Vec<BufferedEvent>,
    /// Validation baselines by migration id.
    baselines: BTreeMap<String, Value>,
    /// Live lock leases by resource key.
    locks: BTreeMap<String, LockRecord>,
    /// Highest fencing token minted per resource key.
    fence_high: BTreeMap<String, u64>,
}

/// Builds the progress map key.
fn progress_key(migration_id: &MigrationId, step_id: &StepId, shard_id: &ShardId) -> String {
    format!("{migration_id}/{step_id}/{shard_id}")
}

// ============================================================================
// SECTION: In-Memory Store
// ============================================================================

/// Document-style in-memory status store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStatusStore {
    /// Store state protected by a mutex.
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStatusStore {
    /// Creates a new in-memory status store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the inner state, mapping poisoning to a fatal store error.
    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StatusStoreError> {
        self.inner
            .lock()
            .map_err(|_| StatusStoreError::Store("status store mutex poisoned".to_string()))
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn create_migration(&self, record: &MigrationRecord) -> Result<(), StatusStoreError> {
        let mut inner = self.lock()?;
        let key = record.migration_id.as_str().to_string();
        if inner.migrations.contains_key(&key) {
            return Err(StatusStoreError::AlreadyExists(key));
        }
        inner.migrations.insert(key, record.clone());
        Ok(())
    }

    async fn load_migration(
        &self,
        migration_id: &MigrationId,
    ) -> Result<Option<MigrationRecord>, StatusStoreError> {
        Ok(self.lock()?.migrations.get(migration_id.as_str()).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<MigrationRecord>, StatusStoreError> {
        Ok(self
            .lock()?
            .migrations
            .values()
            .find(|record| &record.idempotency_key == key)
            .cloned())
    }

    async fn list_migrations(
        &self,
        filter: &MigrationFilter,
    ) -> Result<Vec<MigrationRecord>, StatusStoreError> {
        Ok(self
            .lock()?
            .migrations
            .values()
            .filter(|record| filter.state.map_or(true, |state| record.state == state))
            .filter(|record| filter.store_class.map_or(true, |class| record.store_class == class))
            .cloned()
            .collect())
    }

    async fn cas_migration(
        &self,
        record: &MigrationRecord,
    ) -> Result<MigrationRecord, StatusStoreError> {
        let mut inner = self.lock()?;
        let key = record.migration_id.as_str().to_string();
        let stored = inner
            .migrations
            .get(&key)
            .ok_or_else(|| StatusStoreError::NotFound(key.clone()))?;
        if stored.version != record.version {
            return Err(StatusStoreError::VersionConflict {
                expected: record.version,
                actual: stored.version,
            });
        }
        if stored.state != record.state && !stored.state.can_transition_to(record.state) {
            return Err(StatusStoreError::IllegalTransition {
                from: stored.state,
                to: record.state,
            });
        }
        let mut next = record.clone();
        next.version = stored.version + 1;
        inner.migrations.insert(key, next.clone());
        Ok(next)
    }

    async fn claim_migration(
        &self,
        migration_id: &MigrationId,
        new_owner: &OwnerToken,
        expected_version: u64,
    ) -> Result<MigrationRecord, StatusStoreError> {
        let mut inner = self.lock()?;
        let key = migration_id.as_str().to_string();
        let stored = inner
            .migrations
            .get(&key)
            .ok_or_else(|| StatusStoreError::NotFound(key.clone()))?;
        if stored.version != expected_version {
            return Err(StatusStoreError::VersionConflict {
                expected: expected_version,
                actual: stored.version,
            });
        }
        let mut next = stored.clone();
        next.owner_token = new_owner.clone();
        next.version = stored.version + 1;
        inner.migrations.insert(key, next.clone());
        Ok(next)
    }

    async fn store_request(
        &self,
        migration_id: &MigrationId,
        request: &MigrationRequest,
    ) -> Result<(), StatusStoreError> {
        self.lock()?.requests.insert(migration_id.as_str().to_string(), request.clone());
        Ok(())
    }

    async fn load_request(
        &self,
        migration_id: &MigrationId,
    ) -> Result<Option<MigrationRequest>, StatusStoreError> {
        Ok(self.lock()?.requests.get(migration_id.as_str()).cloned())
    }

    async fn store_plan(
        &self,
        migration_id: &MigrationId,
        plan: &Plan,
    ) -> Result<(), StatusStoreError> {
        self.lock()?.plans.insert(migration_id.as_str().to_string(), plan.clone());
        Ok(())
    }

    async fn load_plan(&self, migration_id: &MigrationId) -> Result<Option<Plan>, StatusStoreError> {
        Ok(self.lock()?.plans.get(migration_id.as_str()).cloned())
    }

    async fn load_progress(
        &self,
        migration_id: &MigrationId,
        step_id: &StepId,
        shard_id: &ShardId,
    ) -> Result<Option<ShardProgress>, StatusStoreError> {
        let key = progress_key(migration_id, step_id, shard_id);
        Ok(self.lock()?.progress.get(&key).cloned())
    }

    async fn list_progress(
        &self,
        migration_id: &MigrationId,
    ) -> Result<Vec<ShardProgress>, StatusStoreError> {
        Ok(self
            .lock()?
            .progress
            .values()
            .filter(|progress| &progress.migration_id == migration_id)
            .cloned()
            .collect())
    }

    async fn upsert_progress(
        &self,
        progress: &ShardProgress,
        resource: &LockResource,
        token: FencingToken,
    ) -> Result<ShardProgress, StatusStoreError> {
        let mut inner = self.lock()?;
        let resource_key = resource.as_key();
        let high = inner.fence_high.get(&resource_key).copied().unwrap_or(0);
        if token.get() < high {
            return Err(StatusStoreError::StaleFencingToken {
                resource: resource_key,
                presented: token.get(),
                required: high,
            });
        }
        let key = progress_key(&progress.migration_id, &progress.step_id, &progress.shard_id);
        if let Some(stored) = inner.progress.get(&key) {
            if progress.items_processed < stored.items_processed {
                return Err(StatusStoreError::ProgressRegression {
                    key,
                    from: stored.items_processed,
                    to: progress.items_processed,
                });
            }
        }
        let mut next = progress.clone();
        next.version = inner.progress.get(&key).map_or(1, |stored| stored.version + 1);
        inner.fence_high.insert(resource.as_key(), token.get());
        inner.progress.insert(key, next.clone());
        Ok(next)
    }

    async fn store_baseline(
        &self,
        migration_id: &MigrationId,
        baseline: &Value,
    ) -> Result<(), StatusStoreError> {
        self.lock()?.baselines.insert(migration_id.as_str().to_string(), baseline.clone());
        Ok(())
    }

    async fn load_baseline(
        &self,
        migration_id: &MigrationId,
    ) -> Result<Option<Value>, StatusStoreError> {
        Ok(self.lock()?.baselines.get(migration_id.as_str()).cloned())
    }

    async fn append_event(&self, record: &EventRecord) -> Result<(), StatusStoreError> {
        let mut inner = self.lock()?;
        // Duplicate appends are no-ops so at-least-once emitters stay safe.
        if inner.events.iter().any(|event| event.record.event_id == record.event_id) {
            return Ok(());
        }
        inner.events.push(BufferedEvent {
            record: record.clone(),
            published: false,
        });
        Ok(())
    }

    async fn list_events(
        &self,
        migration_id: &MigrationId,
    ) -> Result<Vec<EventRecord>, StatusStoreError> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|event| &event.record.migration_id == migration_id)
            .map(|event| event.record.clone())
            .collect())
    }

    async fn unpublished_events(&self, limit: usize) -> Result<Vec<EventRecord>, StatusStoreError> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|event| !event.published)
            .take(limit)
            .map(|event| event.record.clone())
            .collect())
    }

    async fn mark_event_published(&self, event_id: &EventId) -> Result<(), StatusStoreError> {
        let mut inner = self.lock()?;
        for event in &mut inner.events {
            if &event.record.event_id == event_id {
                event.published = true;
                return Ok(());
            }
        }
        Err(StatusStoreError::NotFound(event_id.as_str().to_string()))
    }

    async fn try_acquire_lock(
        &self,
        resource: &LockResource,
        holder: &MigrationId,
        now: Timestamp,
        ttl_ms: u64,
    ) -> Result<LockRecord, StatusStoreError> {
        let mut inner = self.lock()?;
        let key = resource.as_key();
        if let Some(existing) = inner.locks.get(&key) {
            let holder_revocable = inner
                .migrations
                .get(existing.holder.as_str())
                .is_some_and(MigrationRecord::locks_revocable);
            let expired = now.has_reached(&existing.expires_at);
            if &existing.holder == holder {
                // Re-acquisition by the holder extends the lease in place.
                let mut renewed = existing.clone();
                renewed.expires_at = now.plus_millis(ttl_ms);
                inner.locks.insert(key, renewed.clone());
                return Ok(renewed);
            }
            if !holder_revocable && !expired {
                return Err(StatusStoreError::LockBusy {
                    resource: key,
                    holder: existing.holder.as_str().to_string(),
                });
            }
        }
        let token = FencingToken::new(inner.fence_high.get(&key).copied().unwrap_or(0) + 1);
        inner.fence_high.insert(key.clone(), token.get());
        let record = LockRecord {
            resource: resource.clone(),
            holder: holder.clone(),
            acquired_at: now,
            expires_at: now.plus_millis(ttl_ms),
            fencing_token: token,
        };
        inner.locks.insert(key, record.clone());
        Ok(record)
    }

    async fn renew_lock(
        &self,
        resource: &LockResource,
        holder: &MigrationId,
        now: Timestamp,
        ttl_ms: u64,
    ) -> Result<LockRecord, StatusStoreError> {
        let mut inner = self.lock()?;
        let key = resource.as_key();
        match inner.locks.get(&key) {
            Some(existing) if &existing.holder == holder => {
                let mut renewed = existing.clone();
                renewed.expires_at = now.plus_millis(ttl_ms);
                inner.locks.insert(key, renewed.clone());
                Ok(renewed)
            }
            _ => Err(StatusStoreError::LockNotHeld(key)),
        }
    }

    async fn release_lock(
        &self,
        resource: &LockResource,
        holder: &MigrationId,
    ) -> Result<(), StatusStoreError> {
        let mut inner = self.lock()?;
        let key = resource.as_key();
        match inner.locks.get(&key) {
            Some(existing) if &existing.holder == holder => {
                inner.locks.remove(&key);
                Ok(())
            }
            _ => Err(StatusStoreError::LockNotHeld(key)),
        }
    }

    async fn reap_stale_locks(
        &self,
        now: Timestamp,
        grace_ms: u64,
    ) -> Result<Vec<LockRecord>, StatusStoreError> {
        let mut inner = self.lock()?;
        let stale: Vec<String> = inner
            .locks
            .iter()
            .filter(|(_, lock)| {
                let holder_revocable = inner
                    .migrations
                    .get(lock.holder.as_str())
                    .is_some_and(MigrationRecord::locks_revocable);
                holder_revocable || lock.is_expired(&now, grace_ms)
            })
            .map(|(key, _)| key.clone())
            .collect();
        let mut reaped = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(lock) = inner.locks.remove(&key) {
                reaped.push(lock);
            }
        }
        Ok(reaped)
    }

    async fn list_locks(&self) -> Result<Vec<LockRecord>, StatusStoreError> {
        Ok(self.lock()?.locks.values().cloned().collect())
    }
}

// ============================================================================
// SECTION: Shared Store Wrapper
// ============================================================================

/// Shared status store backed by an `Arc` trait object.
#[derive(Clone)]
pub struct SharedStatusStore {
    /// Inner store implementation.
    inner: Arc<dyn StatusStore>,
}

impl SharedStatusStore {
    /// Wraps a status store in a shared, clonable wrapper.
    #[must_use]
    pub fn from_store(store: impl StatusStore + 'static) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Wraps an existing shared store.
    #[must_use]
    pub const fn new(store: Arc<dyn StatusStore>) -> Self {
        Self {
            inner: store,
        }
    }

    /// Returns the inner trait object.
    #[must_use]
    pub fn as_arc(&self) -> Arc<dyn StatusStore> {
        Arc::clone(&self.inner)
    }
}
