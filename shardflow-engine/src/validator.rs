// shardflow-engine/src/validator.rs
// ============================================================================
// Module: Engine Validator
// Description: Pre-flight checks, per-shard post-checks, cross-shard probes.
// Purpose: Gate execution on feasibility and gate commit on consistency.
// Dependencies: serde, shardflow-core, thiserror, crate::config
// ============================================================================

//! ## Overview
//! Validation runs in three phases. Pre-flight verifies every planned shard
//! is reachable and, under the compensate policy, that every step has an
//! available compensation; it also captures the baseline (per-shard counts
//! and sampled pre-images) the later phases compare against. Per-shard
//! post-checks bound count deltas and replay the transformer over the
//! sampled pre-images. Cross-shard probes are declared by the request; a
//! request without probes falls back to the per-shard checks only.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use shardflow_core::Classify;
use shardflow_core::CollectionName;
use shardflow_core::ErrorClass;
use shardflow_core::MigrationRequest;
use shardflow_core::Plan;
use shardflow_core::ProbeSpec;
use shardflow_core::Record;
use shardflow_core::ShardId;
use shardflow_core::StepKind;
use shardflow_core::StepPayload;
use shardflow_core::StoreClass;
use shardflow_core::TopologyError;
use shardflow_core::TopologySnapshot;
use shardflow_core::TransformError;
use shardflow_core::TransformerRegistry;
use shardflow_core::interfaces::BackupCatalog;
use shardflow_core::interfaces::DriverConn;
use shardflow_core::interfaces::DriverError;
use shardflow_core::interfaces::StoreDriver;
use thiserror::Error;

use crate::config::RollbackPolicy;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Validation failures.
#[derive(Debug, Error)]
pub enum ValidationFailure {
    /// A planned shard is unreachable.
    #[error("shard {shard_id} unreachable: {message}")]
    Unreachable {
        /// Unreachable shard.
        shard_id: ShardId,
        /// Underlying message.
        message: String,
    },
    /// A step has no available compensation under the compensate policy.
    #[error("missing compensation for step {step_id}: {reason}")]
    MissingCompensation {
        /// Offending request step.
        step_id: String,
        /// Why no compensation is available.
        reason: String,
    },
    /// Per-shard count delta exceeded the declared tolerance.
    #[error(
        "count delta out of bounds on {collection}@{shard_id}: {before} -> {after} (tolerance {tolerance_percent}%)"
    )]
    CountDelta {
        /// Probed collection.
        collection: CollectionName,
        /// Probed shard.
        shard_id: ShardId,
        /// Baseline count.
        before: u64,
        /// Post-migration count.
        after: u64,
        /// Declared tolerance.
        tolerance_percent: f64,
    },
    /// A sampled record does not match its transformed pre-image.
    #[error("sampled record {record_id} on {shard_id} does not match its transform")]
    SampleMismatch {
        /// Mismatched record.
        record_id: String,
        /// Probed shard.
        shard_id: ShardId,
    },
    /// A declared-unique field repeats across shards.
    #[error("field {field} on {collection} is not unique across shards (value {value})")]
    DuplicateFieldValue {
        /// Probed collection.
        collection: CollectionName,
        /// Declared-unique field.
        field: String,
        /// Duplicated value.
        value: String,
    },
    /// A reference value has no target record on any shard.
    #[error("reference {value} in {collection}.{field} has no target in {target}")]
    MissingReference {
        /// Referencing collection.
        collection: CollectionName,
        /// Referencing field.
        field: String,
        /// Referenced collection.
        target: CollectionName,
        /// Dangling value.
        value: String,
    },
    /// Topology resolution failed during validation.
    #[error(transparent)]
    Topology(#[from] TopologyError),
    /// Driver call failed during validation.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// Transformer resolution failed during validation.
    #[error(transparent)]
    Transform(#[from] TransformError),
}

impl Classify for ValidationFailure {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Unreachable {
                ..
            } => ErrorClass::Transient,
            Self::MissingCompensation {
                ..
            }
            | Self::Topology(_) => ErrorClass::Structural,
            Self::CountDelta {
                ..
            }
            | Self::SampleMismatch {
                ..
            }
            | Self::DuplicateFieldValue {
                ..
            }
            | Self::MissingReference {
                ..
            }
            | Self::Transform(_) => ErrorClass::Logical,
            Self::Driver(err) => err.class(),
        }
    }
}

// ============================================================================
// SECTION: Baseline
// ============================================================================

/// Pre-stage baseline captured by pre-flight and compared after execution.
///
/// # Invariants
/// - Captured once, before the first data stage; stored durably alongside
///   the plan so a resumed coordinator compares against true pre-state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationBaseline {
    /// Record counts per `collection@shard`.
    pub counts: BTreeMap<String, u64>,
    /// Sampled pre-images per planned step id.
    pub samples: BTreeMap<String, Vec<Record>>,
}

/// Builds the baseline count key.
fn count_key(collection: &CollectionName, shard_id: &ShardId) -> String {
    format!("{collection}@{shard_id}")
}

// ============================================================================
// SECTION: Validator
// ============================================================================

/// Three-phase validator over one store-class driver.
pub struct Validator {
    /// Backend driver.
    driver: Arc<dyn StoreDriver>,
    /// Transformer registry.
    transforms: Arc<TransformerRegistry>,
    /// Backup collaborator.
    backup: Arc<dyn BackupCatalog>,
}

impl Validator {
    /// Creates a validator.
    #[must_use]
    pub fn new(
        driver: Arc<dyn StoreDriver>,
        transforms: Arc<TransformerRegistry>,
        backup: Arc<dyn BackupCatalog>,
    ) -> Self {
        Self {
            driver,
            transforms,
            backup,
        }
    }

    /// Opens a connection to one shard of the plan's store class.
    async fn open_shard(
        &self,
        topology: &TopologySnapshot,
        store_class: StoreClass,
        shard_id: &ShardId,
    ) -> Result<Box<dyn DriverConn>, ValidationFailure> {
        let info = topology.shard(store_class, shard_id)?;
        self.driver.open(info).await.map_err(|err| ValidationFailure::Unreachable {
            shard_id: shard_id.clone(),
            message: err.to_string(),
        })
    }

    /// Pre-flight: reachability, compensation availability, baseline capture.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationFailure`] naming the first infeasibility.
    pub async fn pre_flight(
        &self,
        request: &MigrationRequest,
        plan: &Plan,
        topology: &TopologySnapshot,
        policy: RollbackPolicy,
    ) -> Result<ValidationBaseline, ValidationFailure> {
        // Every transformer must resolve regardless of policy.
        for step in &request.steps {
            if let StepPayload::Data {
                transform,
            } = &step.payload
            {
                let _ = self.transforms.get(transform)?;
            }
        }

        if policy == RollbackPolicy::Compensate {
            for step in &request.steps {
                match &step.payload {
                    StepPayload::Schema {
                        change,
                    } => {
                        if change.down.is_none() {
                            return Err(ValidationFailure::MissingCompensation {
                                step_id: step.step_id.as_str().to_string(),
                                reason: format!(
                                    "schema change {} has no down definition",
                                    change.change_id
                                ),
                            });
                        }
                    }
                    StepPayload::Data {
                        transform,
                    } => {
                        if !self.transforms.has_inverse(transform)
                            && !self.backup.supports_capture()
                        {
                            return Err(ValidationFailure::MissingCompensation {
                                step_id: step.step_id.as_str().to_string(),
                                reason: format!(
                                    "transformer {transform} has no inverse and no backup catalog is configured"
                                ),
                            });
                        }
                    }
                }
            }
        }

        // Reachability over the planned shard set, then baseline capture.
        let mut baseline = ValidationBaseline::default();
        let mut probed: BTreeSet<String> = BTreeSet::new();
        for step in plan.steps() {
            let mut conn =
                self.open_shard(topology, plan.store_class, &step.shard_id).await?;
            if step.kind != StepKind::Data {
                continue;
            }
            let key = count_key(&step.collection, &step.shard_id);
            if probed.insert(key.clone()) {
                let count = conn.count(&step.collection).await?;
                baseline.counts.insert(key, count);
            }
            let samples = conn.sample(&step.collection, request.validation.sample_size).await?;
            baseline.samples.insert(step.step_id.as_str().to_string(), samples);
        }
        Ok(baseline)
    }

    /// Per-shard post-checks: count deltas and sampled transform correctness.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationFailure`] on the first violated bound.
    pub async fn post_shard(
        &self,
        request: &MigrationRequest,
        plan: &Plan,
        topology: &TopologySnapshot,
        baseline: &ValidationBaseline,
    ) -> Result<(), ValidationFailure> {
        let tolerance = request.validation.max_count_delta_percent;
        let mut checked: BTreeSet<String> = BTreeSet::new();
        for step in plan.steps() {
            if step.kind != StepKind::Data {
                continue;
            }
            let mut conn =
                self.open_shard(topology, plan.store_class, &step.shard_id).await?;

            let key = count_key(&step.collection, &step.shard_id);
            if checked.insert(key.clone()) {
                let before = baseline.counts.get(&key).copied().unwrap_or(0);
                let after = conn.count(&step.collection).await?;
                if !within_tolerance(before, after, tolerance) {
                    return Err(ValidationFailure::CountDelta {
                        collection: step.collection.clone(),
                        shard_id: step.shard_id.clone(),
                        before,
                        after,
                        tolerance_percent: tolerance,
                    });
                }
            }

            let StepPayload::Data {
                transform,
            } = &step.payload
            else {
                continue;
            };
            let transformer = self.transforms.get(transform)?;
            let Some(samples) = baseline.samples.get(step.step_id.as_str()) else {
                continue;
            };
            let ids: Vec<String> = samples.iter().map(|record| record.id.clone()).collect();
            let fetched = conn.fetch(&step.collection, &ids).await?;
            let by_id: BTreeMap<&str, &Record> =
                fetched.iter().map(|record| (record.id.as_str(), record)).collect();
            for sample in samples {
                let expected = (transformer.apply)(sample)?;
                let actual = by_id.get(sample.id.as_str());
                let matches = match (&expected, actual) {
                    (Some(expected), Some(actual)) => expected.fields == actual.fields,
                    (None, None) => true,
                    _ => false,
                };
                if !matches {
                    return Err(ValidationFailure::SampleMismatch {
                        record_id: sample.id.clone(),
                        shard_id: step.shard_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Cross-shard consistency probes declared by the request.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationFailure`] on the first violated probe.
    pub async fn cross_shard(
        &self,
        request: &MigrationRequest,
        plan: &Plan,
        topology: &TopologySnapshot,
        baseline: &ValidationBaseline,
    ) -> Result<(), ValidationFailure> {
        for probe in &request.validation.probes {
            match probe {
                ProbeSpec::GlobalCount {
                    collection,
                } => {
                    self.probe_global_count(request, plan, topology, baseline, collection).await?;
                }
                ProbeSpec::UniqueField {
                    collection,
                    field,
                } => {
                    self.probe_unique_field(plan, topology, collection, field).await?;
                }
                ProbeSpec::ReferentialCoverage {
                    collection,
                    field,
                    target,
                } => {
                    self.probe_referential(plan, topology, collection, field, target).await?;
                }
            }
        }
        Ok(())
    }

    /// Global count across shards must match the baseline total.
    async fn probe_global_count(
        &self,
        request: &MigrationRequest,
        plan: &Plan,
        topology: &TopologySnapshot,
        baseline: &ValidationBaseline,
        collection: &CollectionName,
    ) -> Result<(), ValidationFailure> {
        let prefix = format!("{collection}@");
        let before: u64 = baseline
            .counts
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, count)| *count)
            .sum();
        let mut after = 0;
        for info in topology.shards_of(plan.store_class)? {
            let mut conn = self.open_shard(topology, plan.store_class, &info.shard_id).await?;
            after += conn.count(collection).await?;
        }
        if within_tolerance(before, after, request.validation.max_count_delta_percent) {
            Ok(())
        } else {
            Err(ValidationFailure::CountDelta {
                collection: collection.clone(),
                shard_id: ShardId::new("*"),
                before,
                after,
                tolerance_percent: request.validation.max_count_delta_percent,
            })
        }
    }

    /// A declared-unique field must not repeat across shards.
    async fn probe_unique_field(
        &self,
        plan: &Plan,
        topology: &TopologySnapshot,
        collection: &CollectionName,
        field: &str,
    ) -> Result<(), ValidationFailure> {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for info in topology.shards_of(plan.store_class)? {
            let mut conn = self.open_shard(topology, plan.store_class, &info.shard_id).await?;
            for value in conn.field_values(collection, field).await? {
                let rendered = render_value(&value);
                if !seen.insert(rendered.clone()) {
                    return Err(ValidationFailure::DuplicateFieldValue {
                        collection: collection.clone(),
                        field: field.to_string(),
                        value: rendered,
                    });
                }
            }
        }
        Ok(())
    }

    /// Every reference value must resolve to a target record on some shard.
    async fn probe_referential(
        &self,
        plan: &Plan,
        topology: &TopologySnapshot,
        collection: &CollectionName,
        field: &str,
        target: &CollectionName,
    ) -> Result<(), ValidationFailure> {
        let mut references: BTreeSet<String> = BTreeSet::new();
        for info in topology.shards_of(plan.store_class)? {
            let mut conn = self.open_shard(topology, plan.store_class, &info.shard_id).await?;
            for value in conn.field_values(collection, field).await? {
                references.insert(render_value(&value));
            }
        }
        let ids: Vec<String> = references.iter().cloned().collect();
        let mut found: BTreeSet<String> = BTreeSet::new();
        for info in topology.shards_of(plan.store_class)? {
            let mut conn = self.open_shard(topology, plan.store_class, &info.shard_id).await?;
            for record in conn.fetch(target, &ids).await? {
                found.insert(record.id);
            }
        }
        if let Some(missing) = references.difference(&found).next() {
            return Err(ValidationFailure::MissingReference {
                collection: collection.clone(),
                field: field.to_string(),
                target: target.clone(),
                value: missing.clone(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Returns true when the count delta is within the declared tolerance.
fn within_tolerance(before: u64, after: u64, tolerance_percent: f64) -> bool {
    if before == after {
        return true;
    }
    if before == 0 {
        return false;
    }
    let delta = before.abs_diff(after) as f64;
    (delta * 100.0) / (before as f64) <= tolerance_percent
}

/// Renders a probe value as a stable string key.
fn render_value(value: &serde_json::Value) -> String {
    value.as_str().map_or_else(|| value.to_string(), str::to_string)
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies tolerance math at the boundaries.
    #[test]
    fn tolerance_boundaries() {
        assert!(within_tolerance(1_000, 1_000, 0.0));
        assert!(within_tolerance(1_000, 990, 1.0));
        assert!(!within_tolerance(1_000, 989, 1.0));
        assert!(!within_tolerance(0, 5, 1.0));
        assert!(within_tolerance(0, 0, 1.0));
    }
}
