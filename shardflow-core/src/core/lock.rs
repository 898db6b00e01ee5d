// shardflow-core/src/core/lock.rs
// ============================================================================
// Module: Shardflow Lock Model
// Description: Advisory lock leases with fencing tokens.
// Purpose: Describe the leased resources that serialize migrations.
// Dependencies: serde, crate::core
// ============================================================================

//! ## Overview
//! Locks are advisory leases over a shard, a collection, or the global
//! resource. Each lease carries a fencing token: a monotonically increasing
//! integer minted per resource. The status store rejects progress writes
//! bearing a token lower than the highest token it has seen for the resource,
//! which fences out zombie coordinators whose lease expired.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::CollectionName;
use crate::core::identifiers::MigrationId;
use crate::core::identifiers::ShardId;
use crate::core::request::StoreClass;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Fencing Token
// ============================================================================

/// Monotonic fencing token minted per lock resource.
///
/// # Invariants
/// - Tokens only increase per resource; equal tokens belong to one lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FencingToken(u64);

impl FencingToken {
    /// Creates a fencing token.
    #[must_use]
    pub const fn new(token: u64) -> Self {
        Self(token)
    }

    /// Returns the raw token value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the next token.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// SECTION: Lock Resource
// ============================================================================

/// Resource protected by an advisory lock.
///
/// # Invariants
/// - `shard:*` locks are exclusive per shard per store class.
/// - `collection:*` locks are exclusive across migrations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LockResource {
    /// The single global resource.
    Global,
    /// One shard of a store class.
    Shard {
        /// Store class owning the shard.
        store_class: StoreClass,
        /// Shard identifier.
        shard_id: ShardId,
    },
    /// One collection.
    Collection {
        /// Collection name.
        name: CollectionName,
    },
}

impl LockResource {
    /// Returns the stable storage key for the resource.
    #[must_use]
    pub fn as_key(&self) -> String {
        match self {
            Self::Global => "global".to_string(),
            Self::Shard {
                store_class,
                shard_id,
            } => format!("shard:{}:{shard_id}", store_class.as_str()),
            Self::Collection {
                name,
            } => format!("collection:{name}"),
        }
    }
}

impl fmt::Display for LockResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

// ============================================================================
// SECTION: Lock Record
// ============================================================================

/// One advisory lock lease.
///
/// # Invariants
/// - `expires_at` is `acquired_at` plus the configured TTL.
/// - A lease whose holder migration is terminal is reapable immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Protected resource.
    pub resource: LockResource,
    /// Holding migration.
    pub holder: MigrationId,
    /// Lease acquisition time.
    pub acquired_at: Timestamp,
    /// Lease expiry time.
    pub expires_at: Timestamp,
    /// Fencing token minted for this lease.
    pub fencing_token: FencingToken,
}

impl LockRecord {
    /// Returns true when the lease has expired past the grace window.
    #[must_use]
    pub fn is_expired(&self, now: &Timestamp, grace_ms: u64) -> bool {
        now.has_reached(&self.expires_at.plus_millis(grace_ms))
    }
}
