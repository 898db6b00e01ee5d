// shardflow-core/src/core/topology.rs
// ============================================================================
// Module: Shardflow Topology
// Description: Versioned shard enumeration and deterministic routing.
// Purpose: Pin plans to a shard set and route keys to owning shards.
// Dependencies: serde, thiserror, crate::core
// ============================================================================

//! ## Overview
//! A [`TopologySnapshot`] enumerates the shards of each store class at one
//! version. Plans pin the snapshot version so a crash-resumed migration sees
//! the shard set it started on; resuming against a vanished version fails
//! with [`TopologyError::Stale`] and requires a manual replan. Routing is
//! deterministic given a snapshot: a stable hash of the routing key indexes
//! the ordered shard list.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::hashing::DEFAULT_HASH_ALGORITHM;
use crate::core::hashing::hash_bytes;
use crate::core::identifiers::ShardId;
use crate::core::request::StoreClass;

// ============================================================================
// SECTION: Topology Version
// ============================================================================

/// Monotonic topology snapshot version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopologyVersion(u64);

impl TopologyVersion {
    /// Creates a topology version.
    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    /// Returns the raw version value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the next version.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// SECTION: Shard Descriptor
// ============================================================================

/// One shard of a store class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Shard identifier.
    pub shard_id: ShardId,
    /// Backend connection string for the shard.
    pub dsn: String,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Topology errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    /// A step resumed against a snapshot version no longer available.
    #[error("topology snapshot {pinned} is stale (current {current}); manual replan required")]
    Stale {
        /// Version pinned by the plan.
        pinned: TopologyVersion,
        /// Version currently served.
        current: TopologyVersion,
    },
    /// Store class has no shards in the snapshot.
    #[error("store class {0} has no shards")]
    EmptyClass(&'static str),
    /// Shard is not part of the snapshot.
    #[error("unknown shard: {0}")]
    UnknownShard(String),
    /// Topology provider failed to produce a snapshot.
    #[error("topology provider error: {0}")]
    Provider(String),
}

// ============================================================================
// SECTION: Topology Snapshot
// ============================================================================

/// Immutable shard enumeration at one version.
///
/// # Invariants
/// - Shard lists are ordered; routing depends on that order.
/// - Snapshots are read-only after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    /// Snapshot version.
    pub version: TopologyVersion,
    /// Ordered shards per store class.
    pub shards: BTreeMap<StoreClass, Vec<ShardInfo>>,
}

impl TopologySnapshot {
    /// Creates a snapshot from per-class shard lists.
    #[must_use]
    pub const fn new(version: TopologyVersion, shards: BTreeMap<StoreClass, Vec<ShardInfo>>) -> Self {
        Self {
            version,
            shards,
        }
    }

    /// Returns the shards of a store class.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::EmptyClass`] when the class has no shards.
    pub fn shards_of(&self, store_class: StoreClass) -> Result<&[ShardInfo], TopologyError> {
        match self.shards.get(&store_class) {
            Some(shards) if !shards.is_empty() => Ok(shards),
            _ => Err(TopologyError::EmptyClass(store_class.as_str())),
        }
    }

    /// Routes a key to its owning shard within a store class.
    ///
    /// Routing is deterministic for a given snapshot version: the key is
    /// hashed and the first eight digest bytes index the ordered shard list.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::EmptyClass`] when the class has no shards.
    pub fn route(&self, key: &str, store_class: StoreClass) -> Result<&ShardInfo, TopologyError> {
        let shards = self.shards_of(store_class)?;
        let digest = hash_bytes(DEFAULT_HASH_ALGORITHM, key.as_bytes());
        let prefix = u64::from_str_radix(&digest.value[..16], 16)
            .map_err(|err| TopologyError::Provider(err.to_string()))?;
        let index = usize::try_from(prefix % shards.len() as u64)
            .map_err(|err| TopologyError::Provider(err.to_string()))?;
        Ok(&shards[index])
    }

    /// Returns the shard descriptor for an identifier.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::UnknownShard`] when the shard is absent.
    pub fn shard(
        &self,
        store_class: StoreClass,
        shard_id: &ShardId,
    ) -> Result<&ShardInfo, TopologyError> {
        self.shards_of(store_class)?
            .iter()
            .find(|info| &info.shard_id == shard_id)
            .ok_or_else(|| TopologyError::UnknownShard(shard_id.as_str().to_string()))
    }
}

// ============================================================================
// SECTION: Topology Provider
// ============================================================================

/// Source of topology snapshots.
pub trait TopologyProvider: Send + Sync {
    /// Returns the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError`] when no snapshot can be produced.
    fn snapshot(&self) -> Result<TopologySnapshot, TopologyError>;

    /// Refreshes the provider's view and returns the new snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError`] when the refresh fails.
    fn refresh(&self) -> Result<TopologySnapshot, TopologyError>;
}

/// Static topology provider backed by configuration.
///
/// Discovery-backed deployments swap in their own provider; the engine only
/// sees the trait.
#[derive(Debug, Clone)]
pub struct StaticTopology {
    /// Current snapshot behind a mutex so tests can publish new versions.
    current: Arc<Mutex<TopologySnapshot>>,
}

impl StaticTopology {
    /// Creates a static topology provider from a snapshot.
    #[must_use]
    pub fn new(snapshot: TopologySnapshot) -> Self {
        Self {
            current: Arc::new(Mutex::new(snapshot)),
        }
    }

    /// Publishes a new snapshot, superseding the current version.
    pub fn publish(&self, snapshot: TopologySnapshot) {
        if let Ok(mut guard) = self.current.lock() {
            *guard = snapshot;
        }
    }
}

impl TopologyProvider for StaticTopology {
    fn snapshot(&self) -> Result<TopologySnapshot, TopologyError> {
        self.current
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| TopologyError::Provider("topology mutex poisoned".to_string()))
    }

    fn refresh(&self) -> Result<TopologySnapshot, TopologyError> {
        self.snapshot()
    }
}
