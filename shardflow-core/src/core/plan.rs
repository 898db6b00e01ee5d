// shardflow-core/src/core/plan.rs
// ============================================================================
// Module: Shardflow Execution Plan
// Description: Staged, shard-expanded plan derived from a request.
// Purpose: Capture the immutable DAG the orchestrator drives to completion.
// Dependencies: serde, crate::core
// ============================================================================

//! ## Overview
//! A [`Plan`] is the shard-expanded form of a migration request against one
//! pinned topology snapshot. Stages are topological levels of the step DAG:
//! all steps of stage N complete before any step of stage N+1 starts, and
//! steps within one stage are independent. The plan digest is a canonical
//! hash of the structure and detects replanning.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::hashing::DEFAULT_HASH_ALGORITHM;
use crate::core::hashing::HashDigest;
use crate::core::hashing::HashError;
use crate::core::hashing::hash_canonical_json;
use crate::core::identifiers::CollectionName;
use crate::core::identifiers::RequestId;
use crate::core::identifiers::ShardId;
use crate::core::identifiers::StepId;
use crate::core::request::StepKind;
use crate::core::request::StepPayload;
use crate::core::request::StoreClass;
use crate::core::topology::TopologyVersion;

// ============================================================================
// SECTION: Planned Step
// ============================================================================

/// One shard-scoped step of an execution plan.
///
/// # Invariants
/// - `step_id` is unique within the plan (request step id plus shard).
/// - `depth` is the remaining critical-path length from this step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    /// Plan-unique step identifier.
    pub step_id: StepId,
    /// Request step this sub-step was expanded from.
    pub source_step: StepId,
    /// Step kind.
    pub kind: StepKind,
    /// Target collection.
    pub collection: CollectionName,
    /// Target shard.
    pub shard_id: ShardId,
    /// Schema or data payload.
    pub payload: StepPayload,
    /// Remaining critical-path depth, used for scheduling bias.
    pub depth: usize,
    /// Advisory item estimate, used for scheduling bias.
    pub estimated_items: Option<u64>,
    /// Optional step deadline in milliseconds.
    pub deadline_ms: Option<u64>,
}

// ============================================================================
// SECTION: Stage
// ============================================================================

/// One topological level of the plan.
///
/// # Invariants
/// - Steps within a stage have no dependencies on each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Zero-based stage index.
    pub index: usize,
    /// Parallel-eligible steps of this stage.
    pub steps: Vec<PlannedStep>,
}

// ============================================================================
// SECTION: Plan
// ============================================================================

/// Immutable execution plan for one migration.
///
/// # Invariants
/// - Read-only after admission; replanning produces a new digest.
/// - Schema steps appear in an earlier stage than any dependent data step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Request the plan was derived from.
    pub request_id: RequestId,
    /// Target store class.
    pub store_class: StoreClass,
    /// Pinned topology snapshot version.
    pub topology_version: TopologyVersion,
    /// Ordered stages.
    pub stages: Vec<Stage>,
}

impl Plan {
    /// Computes the stable digest of the plan structure.
    ///
    /// # Errors
    ///
    /// Returns [`HashError`] when canonicalization fails.
    pub fn digest(&self) -> Result<HashDigest, HashError> {
        hash_canonical_json(DEFAULT_HASH_ALGORITHM, self)
    }

    /// Returns all planned steps across stages in stage order.
    pub fn steps(&self) -> impl Iterator<Item = &PlannedStep> {
        self.stages.iter().flat_map(|stage| stage.steps.iter())
    }

    /// Returns the total number of planned steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.stages.iter().map(|stage| stage.steps.len()).sum()
    }

    /// Returns the planned step with the given identifier.
    #[must_use]
    pub fn step(&self, step_id: &StepId) -> Option<&PlannedStep> {
        self.steps().find(|step| &step.step_id == step_id)
    }
}
