// shardflow-core/src/core/request.rs
// ============================================================================
// Module: Shardflow Migration Request
// Description: Caller-supplied migration request and step specifications.
// Purpose: Provide the validated, immutable unit of work admitted by the engine.
// Dependencies: serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! A [`MigrationRequest`] describes the target entities, transformations, and
//! schema changes for one migration. Requests are validated fail-closed at
//! admission and are immutable once admitted; the planner derives an
//! executable plan from the request plus the pinned topology snapshot.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::identifiers::CollectionName;
use crate::core::identifiers::IdempotencyKey;
use crate::core::identifiers::RequestId;
use crate::core::identifiers::StepId;
use crate::core::identifiers::TransformId;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum number of steps accepted in one request.
pub const MAX_STEPS_PER_REQUEST: usize = 256;
/// Maximum length of a request name.
pub const MAX_REQUEST_NAME_LENGTH: usize = 256;
/// Default per-shard count delta tolerance for post-validation (percent).
pub const DEFAULT_COUNT_DELTA_PERCENT: f64 = 1.0;
/// Default sample size for the transformation-correctness probe.
pub const DEFAULT_VALIDATION_SAMPLE_SIZE: usize = 16;

// ============================================================================
// SECTION: Store Class
// ============================================================================

/// Backing store class targeted by a migration.
///
/// # Invariants
/// - Variants are stable for serialization and configuration matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreClass {
    /// Sharded document store.
    Document,
    /// Sharded relational store.
    Relational,
}

impl StoreClass {
    /// Returns a stable label for the store class.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Relational => "relational",
        }
    }
}

// ============================================================================
// SECTION: Step Specifications
// ============================================================================

/// Step kind: schema change or data transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Schema change step.
    Schema,
    /// Streaming data transformation step.
    Data,
}

/// Shard scope of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepScope {
    /// The step expands into one sub-step per shard of the store class.
    AllShards,
    /// The step targets the single shard that owns the routing key.
    SingleShard {
        /// Routing key resolved against the pinned topology snapshot.
        routing_key: String,
    },
}

/// Schema change applied by a schema step.
///
/// # Invariants
/// - `change_id` is the backend-native marker used for already-applied detection.
/// - `down` is the store-native down-migration used as the compensation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChange {
    /// Stable change identifier recorded in the backend marker.
    pub change_id: String,
    /// Backend-interpreted change definition.
    pub definition: Value,
    /// Optional down-migration definition.
    pub down: Option<Value>,
}

/// Step payload: the schema change or the data transformation reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepPayload {
    /// Schema change payload.
    Schema {
        /// The change to apply.
        change: SchemaChange,
    },
    /// Data transformation payload.
    Data {
        /// Registered transformer identifier.
        transform: TransformId,
    },
}

impl StepPayload {
    /// Returns the step kind for this payload.
    #[must_use]
    pub const fn step_kind(&self) -> StepKind {
        match self {
            Self::Schema {
                ..
            } => StepKind::Schema,
            Self::Data {
                ..
            } => StepKind::Data,
        }
    }
}

/// One step of a migration request.
///
/// # Invariants
/// - `step_id` is unique within the request.
/// - `depends_on` references steps of the same request only.
/// - `reads`/`writes` name schema objects and feed implicit plan edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step identifier.
    pub step_id: StepId,
    /// Target collection.
    pub collection: CollectionName,
    /// Shard scope.
    pub scope: StepScope,
    /// Schema or data payload.
    pub payload: StepPayload,
    /// Declared step dependencies.
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// Schema objects this step reads.
    #[serde(default)]
    pub reads: Vec<String>,
    /// Schema objects this step writes.
    #[serde(default)]
    pub writes: Vec<String>,
    /// Advisory per-shard item estimate used for scheduling bias.
    #[serde(default)]
    pub estimated_items: Option<u64>,
    /// Optional step deadline in milliseconds.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl StepSpec {
    /// Returns the step kind.
    #[must_use]
    pub const fn kind(&self) -> StepKind {
        self.payload.step_kind()
    }
}

// ============================================================================
// SECTION: Validation Probes
// ============================================================================

/// Cross-shard consistency probe declared by the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// Global record count across shards must match the pre-migration total.
    GlobalCount {
        /// Probed collection.
        collection: CollectionName,
    },
    /// A field must be unique across all shards.
    UniqueField {
        /// Probed collection.
        collection: CollectionName,
        /// Field that must be globally unique.
        field: String,
    },
    /// Every reference value must exist in the target collection on some shard.
    ReferentialCoverage {
        /// Referencing collection.
        collection: CollectionName,
        /// Referencing field.
        field: String,
        /// Referenced collection.
        target: CollectionName,
    },
}

/// Validation settings for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSpec {
    /// Allowed per-shard count delta in percent.
    #[serde(default = "default_count_delta_percent")]
    pub max_count_delta_percent: f64,
    /// Sample size for the transformation-correctness probe.
    #[serde(default = "default_validation_sample_size")]
    pub sample_size: usize,
    /// Declared cross-shard probes; empty falls back to per-shard checks only.
    #[serde(default)]
    pub probes: Vec<ProbeSpec>,
}

impl Default for ValidationSpec {
    fn default() -> Self {
        Self {
            max_count_delta_percent: DEFAULT_COUNT_DELTA_PERCENT,
            sample_size: DEFAULT_VALIDATION_SAMPLE_SIZE,
            probes: Vec::new(),
        }
    }
}

/// Returns the default count delta tolerance.
const fn default_count_delta_percent() -> f64 {
    DEFAULT_COUNT_DELTA_PERCENT
}

/// Returns the default validation sample size.
const fn default_validation_sample_size() -> usize {
    DEFAULT_VALIDATION_SAMPLE_SIZE
}

// ============================================================================
// SECTION: Migration Request
// ============================================================================

/// Desired concurrency hints supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyHints {
    /// Optional cap on concurrently migrating shards for this request.
    #[serde(default)]
    pub max_parallel_shards: Option<usize>,
}

/// Caller-supplied unit of work, immutable once admitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRequest {
    /// Request identifier.
    pub request_id: RequestId,
    /// Human-readable migration name.
    pub name: String,
    /// Target store class.
    pub store_class: StoreClass,
    /// Ordered step list.
    pub steps: Vec<StepSpec>,
    /// Requests that must complete before this one is admitted.
    #[serde(default)]
    pub depends_on: Vec<RequestId>,
    /// Concurrency hints.
    #[serde(default)]
    pub concurrency: ConcurrencyHints,
    /// Idempotency key for duplicate admission detection.
    pub idempotency_key: IdempotencyKey,
    /// Validation settings and declared probes.
    #[serde(default)]
    pub validation: ValidationSpec,
    /// Optional migration deadline in milliseconds.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Request validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    /// Request name is empty or too long.
    #[error("invalid request name (len {0}, max {MAX_REQUEST_NAME_LENGTH})")]
    InvalidName(usize),
    /// Request declares no steps.
    #[error("request declares no steps")]
    NoSteps,
    /// Request declares too many steps.
    #[error("request declares {0} steps (max {MAX_STEPS_PER_REQUEST})")]
    TooManySteps(usize),
    /// Duplicate step identifier.
    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),
    /// Step depends on an unknown step.
    #[error("step {step} depends on unknown step {dependency}")]
    UnknownStepDependency {
        /// Declaring step.
        step: String,
        /// Unknown dependency.
        dependency: String,
    },
    /// Single-shard step has an empty routing key.
    #[error("step {0} has an empty routing key")]
    EmptyRoutingKey(String),
    /// Validation sample size is zero.
    #[error("validation sample size must be at least 1")]
    ZeroSampleSize,
    /// Count delta tolerance is not a finite, non-negative percentage.
    #[error("invalid count delta tolerance: {0}")]
    InvalidCountDelta(f64),
}

impl MigrationRequest {
    /// Validates the request fail-closed at admission.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.name.is_empty() || self.name.len() > MAX_REQUEST_NAME_LENGTH {
            return Err(RequestError::InvalidName(self.name.len()));
        }
        if self.steps.is_empty() {
            return Err(RequestError::NoSteps);
        }
        if self.steps.len() > MAX_STEPS_PER_REQUEST {
            return Err(RequestError::TooManySteps(self.steps.len()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for step in &self.steps {
            if !seen.insert(step.step_id.as_str()) {
                return Err(RequestError::DuplicateStepId(step.step_id.as_str().to_string()));
            }
            if let StepScope::SingleShard {
                routing_key,
            } = &step.scope
            {
                if routing_key.is_empty() {
                    return Err(RequestError::EmptyRoutingKey(step.step_id.as_str().to_string()));
                }
            }
        }
        for step in &self.steps {
            for dependency in &step.depends_on {
                if !seen.contains(dependency.as_str()) {
                    return Err(RequestError::UnknownStepDependency {
                        step: step.step_id.as_str().to_string(),
                        dependency: dependency.as_str().to_string(),
                    });
                }
            }
        }
        if self.validation.sample_size == 0 {
            return Err(RequestError::ZeroSampleSize);
        }
        let tolerance = self.validation.max_count_delta_percent;
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(RequestError::InvalidCountDelta(tolerance));
        }
        Ok(())
    }

    /// Returns the step with the given identifier.
    #[must_use]
    pub fn step(&self, step_id: &StepId) -> Option<&StepSpec> {
        self.steps.iter().find(|step| &step.step_id == step_id)
    }
}
