// shardflow-engine/src/clock.rs
// ============================================================================
// Module: Engine Clock
// Description: Wall-clock and logical clock collaborators.
// Purpose: Supply timestamps at the service edge without ambient reads.
// Dependencies: shardflow-core, std
// ============================================================================

//! ## Overview
//! The core never reads wall-clock time; the engine injects a [`Clock`]
//! collaborator wherever a timestamp is needed (records, leases, events).
//! Production uses [`SystemClock`]; deterministic tests use [`LogicalClock`]
//! and advance it explicitly.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use shardflow_core::Timestamp;

// ============================================================================
// SECTION: Clock Trait
// ============================================================================

/// Timestamp source passed by explicit reference.
pub trait Clock: Send + Sync {
    /// Returns the current timestamp.
    fn now(&self) -> Timestamp;
}

// ============================================================================
// SECTION: System Clock
// ============================================================================

/// Wall-clock timestamps in unix milliseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        Timestamp::UnixMillis(millis)
    }
}

// ============================================================================
// SECTION: Logical Clock
// ============================================================================

/// Deterministic logical clock for tests.
///
/// Every read returns the current tick; tests advance it explicitly.
#[derive(Debug, Default)]
pub struct LogicalClock {
    /// Current logical tick.
    tick: AtomicU64,
}

impl LogicalClock {
    /// Creates a logical clock starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock by `ticks`.
    pub fn advance(&self, ticks: u64) {
        self.tick.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl Clock for LogicalClock {
    fn now(&self) -> Timestamp {
        Timestamp::Logical(self.tick.load(Ordering::SeqCst))
    }
}
