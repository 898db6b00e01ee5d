// shardflow-engine/src/config.rs
// ============================================================================
// Module: Engine Coordinator Configuration
// Description: Runtime knobs the coordinator is assembled with.
// Purpose: Carry parallelism, batching, lease, and rollback policy settings.
// Dependencies: serde, crate::{locks, pump, retry}
// ============================================================================

//! ## Overview
//! The coordinator configuration is read-only after assembly. The config
//! crate parses and validates operator-supplied files into these values; the
//! engine never reads the environment itself.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::locks::LockConfig;
use crate::pump::BatchTuning;
use crate::retry::RetryPolicy;

// ============================================================================
// SECTION: Rollback Policy
// ============================================================================

/// Failure response policy for a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPolicy {
    /// Apply compensating actions in reverse completion order.
    Compensate,
    /// Halt in `failed` without compensations.
    Halt,
}

// ============================================================================
// SECTION: Coordinator Configuration
// ============================================================================

/// Runtime configuration for one coordinator process.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// Concurrent executors per store class.
    pub per_store_class_parallelism: usize,
    /// Concurrent in-flight batches per store class.
    pub max_inflight_batches: usize,
    /// Batch pump tuning.
    pub tuning: BatchTuning,
    /// Lock lease configuration.
    pub locks: LockConfig,
    /// Retry policy.
    pub retry: RetryPolicy,
    /// Rollback policy.
    pub rollback_policy: RollbackPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            per_store_class_parallelism: 10,
            max_inflight_batches: 10,
            tuning: BatchTuning::default(),
            locks: LockConfig::default(),
            retry: RetryPolicy::default(),
            rollback_policy: RollbackPolicy::Compensate,
        }
    }
}
