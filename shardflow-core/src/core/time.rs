// shardflow-core/src/core/time.rs
// ============================================================================
// Module: Shardflow Time Model
// Description: Canonical timestamp representations for records and leases.
// Purpose: Provide deterministic, replayable time values across Shardflow records.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Shardflow embeds explicit time values in migration records, progress rows,
//! events, and lock leases to keep replay deterministic. The core never reads
//! wall-clock time directly; coordinators supply timestamps through a clock
//! collaborator at the service edge.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::cmp::Ordering;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Time Values
// ============================================================================

/// Canonical timestamp used in Shardflow records and lock leases.
///
/// # Invariants
/// - Values are explicitly provided by callers; the core never reads wall-clock time.
/// - Unix and logical values are never compared against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Timestamp {
    /// Unix epoch milliseconds.
    UnixMillis(i64),
    /// Monotonic logical time value used by deterministic tests.
    Logical(u64),
}

impl Timestamp {
    /// Returns the timestamp as unix milliseconds when available.
    #[must_use]
    pub const fn as_unix_millis(&self) -> Option<i64> {
        match self {
            Self::UnixMillis(value) => Some(*value),
            Self::Logical(_) => None,
        }
    }

    /// Returns the timestamp as logical time when available.
    #[must_use]
    pub const fn as_logical(&self) -> Option<u64> {
        match self {
            Self::UnixMillis(_) => None,
            Self::Logical(value) => Some(*value),
        }
    }

    /// Returns this timestamp advanced by the given number of milliseconds.
    ///
    /// Logical timestamps treat the offset as logical ticks.
    #[must_use]
    pub const fn plus_millis(&self, millis: u64) -> Self {
        match self {
            Self::UnixMillis(value) => Self::UnixMillis(value.saturating_add(millis as i64)),
            Self::Logical(value) => Self::Logical(value.saturating_add(millis)),
        }
    }

    /// Compares two timestamps of the same kind.
    ///
    /// Returns `None` when a unix value is compared against a logical value;
    /// callers must treat incomparable pairs as "not yet expired".
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::UnixMillis(a), Self::UnixMillis(b)) => Some(a.cmp(b)),
            (Self::Logical(a), Self::Logical(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Returns true when `self` is at or past `deadline`.
    ///
    /// Incomparable kinds are never considered past the deadline.
    #[must_use]
    pub fn has_reached(&self, deadline: &Self) -> bool {
        matches!(self.compare(deadline), Some(Ordering::Equal | Ordering::Greater))
    }
}
