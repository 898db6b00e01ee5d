// shardflow-engine/src/locks.rs
// ============================================================================
// Module: Engine Lock Manager
// Description: Leased advisory locks with renewal, reaping, and fencing.
// Purpose: Serialize migrations over shards and collections.
// Dependencies: shardflow-core, tokio, tokio-util, crate::{clock, retry}
// ============================================================================

//! ## Overview
//! The lock manager acquires every lease a migration needs before execution
//! starts. Acquisition is non-blocking at the store; contention is retried
//! with the short contention backoff and fails with `LockUnavailable` once
//! the attempt budget is spent, releasing any partial acquisition. Held
//! leases are renewed at one-third TTL by a background task; stale leases
//! (expired past grace, or with a terminal holder) are reaped before every
//! acquisition pass. Fencing tokens minted with each lease accompany every
//! progress write.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use shardflow_core::Classify;
use shardflow_core::ErrorClass;
use shardflow_core::FencingToken;
use shardflow_core::LockRecord;
use shardflow_core::LockResource;
use shardflow_core::MigrationId;
use shardflow_core::StatusStore;
use shardflow_core::StatusStoreError;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::retry::RetryPolicy;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Lock manager configuration.
#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    /// Lease TTL in milliseconds.
    pub ttl_ms: u64,
    /// Reaping grace beyond TTL in milliseconds.
    pub grace_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            grace_ms: 5_000,
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Lock manager errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// Contention on a lease exceeded the attempt budget.
    #[error("lock unavailable: {resource} (held by {holder})")]
    Unavailable {
        /// Contended resource key.
        resource: String,
        /// Holder observed on the final attempt.
        holder: String,
    },
    /// The status store failed.
    #[error(transparent)]
    Store(#[from] StatusStoreError),
}

impl Classify for LockError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Unavailable {
                ..
            } => ErrorClass::Contention,
            Self::Store(err) => err.class(),
        }
    }
}

// ============================================================================
// SECTION: Lease Set
// ============================================================================

/// Leases held by one migration, with their fencing tokens by resource key.
#[derive(Debug, Clone, Default)]
pub struct LeaseSet {
    /// Held leases.
    pub leases: Vec<LockRecord>,
    /// Fencing token per resource key.
    tokens: BTreeMap<String, FencingToken>,
}

impl LeaseSet {
    /// Returns the fencing token for a resource.
    #[must_use]
    pub fn token_for(&self, resource: &LockResource) -> Option<FencingToken> {
        self.tokens.get(&resource.as_key()).copied()
    }
}

// ============================================================================
// SECTION: Lock Manager
// ============================================================================

/// Advisory lease manager over the status store lock primitives.
pub struct LockManager {
    /// Status store holding the lock table.
    status: Arc<dyn StatusStore>,
    /// Timestamp source.
    clock: Arc<dyn Clock>,
    /// Lease configuration.
    config: LockConfig,
    /// Retry policy for contended acquisition.
    retry: RetryPolicy,
}

impl LockManager {
    /// Creates a lock manager.
    #[must_use]
    pub fn new(
        status: Arc<dyn StatusStore>,
        clock: Arc<dyn Clock>,
        config: LockConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            status,
            clock,
            config,
            retry,
        }
    }

    /// Acquires all resources for a migration, or none.
    ///
    /// Resources are acquired in sorted key order so concurrent migrations
    /// never deadlock. On contention the partial acquisition is released and
    /// the pass is retried with the contention backoff.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Unavailable`] once the attempt budget is spent.
    pub async fn acquire_all(
        &self,
        migration_id: &MigrationId,
        resources: &[LockResource],
    ) -> Result<LeaseSet, LockError> {
        let mut ordered: Vec<LockResource> = resources.to_vec();
        ordered.sort_by_key(LockResource::as_key);
        ordered.dedup();

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.status.reap_stale_locks(self.clock.now(), self.config.grace_ms).await?;
            match self.try_acquire_pass(migration_id, &ordered).await {
                Ok(set) => return Ok(set),
                Err(LockError::Store(StatusStoreError::LockBusy {
                    resource,
                    holder,
                })) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(LockError::Unavailable {
                            resource,
                            holder,
                        });
                    }
                    let delay = self.retry.delay_for(ErrorClass::Contention, attempt);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One all-or-nothing acquisition pass.
    async fn try_acquire_pass(
        &self,
        migration_id: &MigrationId,
        ordered: &[LockResource],
    ) -> Result<LeaseSet, LockError> {
        let mut set = LeaseSet::default();
        for resource in ordered {
            match self
                .status
                .try_acquire_lock(resource, migration_id, self.clock.now(), self.config.ttl_ms)
                .await
            {
                Ok(lease) => {
                    set.tokens.insert(resource.as_key(), lease.fencing_token);
                    set.leases.push(lease);
                }
                Err(err) => {
                    self.release_all(migration_id, &set).await;
                    return Err(LockError::Store(err));
                }
            }
        }
        Ok(set)
    }

    /// Releases every lease of the set, ignoring already-lost leases.
    pub async fn release_all(&self, migration_id: &MigrationId, set: &LeaseSet) {
        for lease in &set.leases {
            // A lost lease is already released or reassigned; nothing to do.
            let _ = self.status.release_lock(&lease.resource, migration_id).await;
        }
    }

    /// Spawns the renewal task: renew every lease at one-third TTL until
    /// cancelled or a lease is lost.
    #[must_use]
    pub fn spawn_renewal(
        &self,
        migration_id: MigrationId,
        set: LeaseSet,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let status = Arc::clone(&self.status);
        let clock = Arc::clone(&self.clock);
        let interval = Duration::from_millis((self.config.ttl_ms / 3).max(1));
        let ttl_ms = self.config.ttl_ms;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(interval) => {}
                }
                for lease in &set.leases {
                    let renewed = status
                        .renew_lock(&lease.resource, &migration_id, clock.now(), ttl_ms)
                        .await;
                    if renewed.is_err() {
                        // Lease lost; the fencing check stops any stale writes.
                        return;
                    }
                }
            }
        })
    }
}
