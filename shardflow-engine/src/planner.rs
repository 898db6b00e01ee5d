// shardflow-engine/src/planner.rs
// ============================================================================
// Module: Engine Planner
// Description: Builds a staged execution plan from a request and a topology.
// Purpose: Resolve dependencies, detect cycles, expand shards, and order
//          stages so schema precedes dependent data.
// Dependencies: shardflow-core, thiserror
// ============================================================================

//! ## Overview
//! The planner builds a DAG over request steps. A step depends on another
//! when it declares the dependency, when it reads a schema object the other
//! writes, or implicitly when a data step shares a collection with a schema
//! step: data never runs before its collection's schema changes complete on
//! every shard they target. Topological levels become stages; within a level
//! steps are parallel-eligible. Cyclic requests fail before admission.
//!
//! Every plan pins the topology snapshot version it was expanded against so
//! a crash-resumed migration sees the shard set it started on.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use shardflow_core::Classify;
use shardflow_core::ErrorClass;
use shardflow_core::MigrationRequest;
use shardflow_core::Plan;
use shardflow_core::PlannedStep;
use shardflow_core::Stage;
use shardflow_core::StepId;
use shardflow_core::StepKind;
use shardflow_core::StepScope;
use shardflow_core::TopologyError;
use shardflow_core::TopologySnapshot;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Planning errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    /// The step dependency graph contains a cycle.
    #[error("plan cycle among steps: {0:?}")]
    Cycle(Vec<String>),
    /// Topology resolution failed.
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

impl Classify for PlanError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Structural
    }
}

// ============================================================================
// SECTION: Planner
// ============================================================================

/// Builds the execution plan for a validated request.
///
/// # Errors
///
/// Returns [`PlanError::Cycle`] on cyclic dependencies and
/// [`PlanError::Topology`] when shard resolution fails.
pub fn build_plan(
    request: &MigrationRequest,
    topology: &TopologySnapshot,
) -> Result<Plan, PlanError> {
    let dependencies = dependency_edges(request)?;
    let levels = topological_levels(request, &dependencies)?;
    let depths = critical_depths(request, &dependencies);

    let mut stages: Vec<Stage> = Vec::with_capacity(levels.len());
    for (index, level) in levels.iter().enumerate() {
        let mut steps = Vec::new();
        for step_index in level {
            let step = &request.steps[*step_index];
            let depth = depths.get(step.step_id.as_str()).copied().unwrap_or(1);
            let shards: Vec<_> = match &step.scope {
                StepScope::AllShards => topology
                    .shards_of(request.store_class)?
                    .iter()
                    .map(|info| info.shard_id.clone())
                    .collect(),
                StepScope::SingleShard {
                    routing_key,
                } => vec![topology.route(routing_key, request.store_class)?.shard_id.clone()],
            };
            for shard_id in shards {
                steps.push(PlannedStep {
                    step_id: StepId::new(format!("{}@{shard_id}", step.step_id)),
                    source_step: step.step_id.clone(),
                    kind: step.kind(),
                    collection: step.collection.clone(),
                    shard_id,
                    payload: step.payload.clone(),
                    depth,
                    estimated_items: step.estimated_items,
                    deadline_ms: step.deadline_ms,
                });
            }
        }
        stages.push(Stage {
            index,
            steps,
        });
    }

    Ok(Plan {
        request_id: request.request_id.clone(),
        store_class: request.store_class,
        topology_version: topology.version,
        stages,
    })
}

// ============================================================================
// SECTION: Dependency Graph
// ============================================================================

/// Computes the dependency edges of each step.
///
/// Edges come from three sources: declared dependencies, write-read schema
/// object coupling, and the implicit schema-before-data pairing per
/// collection.
fn dependency_edges(
    request: &MigrationRequest,
) -> Result<BTreeMap<String, BTreeSet<String>>, PlanError> {
    let mut writers: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for step in &request.steps {
        for object in &step.writes {
            writers.entry(object.as_str()).or_default().push(step.step_id.as_str());
        }
    }

    let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for step in &request.steps {
        let deps = edges.entry(step.step_id.as_str().to_string()).or_default();
        for dependency in &step.depends_on {
            if dependency == &step.step_id {
                return Err(PlanError::Cycle(vec![step.step_id.as_str().to_string()]));
            }
            deps.insert(dependency.as_str().to_string());
        }
        for object in &step.reads {
            for writer in writers.get(object.as_str()).into_iter().flatten() {
                if *writer != step.step_id.as_str() {
                    deps.insert((*writer).to_string());
                }
            }
        }
        if step.kind() == StepKind::Data {
            for other in &request.steps {
                if other.kind() == StepKind::Schema && other.collection == step.collection {
                    deps.insert(other.step_id.as_str().to_string());
                }
            }
        }
    }
    Ok(edges)
}

/// Kahn topological sort into levels; unprocessed remainder is a cycle.
fn topological_levels(
    request: &MigrationRequest,
    edges: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<Vec<usize>>, PlanError> {
    let mut level_of: BTreeMap<String, usize> = BTreeMap::new();
    let mut remaining: BTreeSet<String> =
        request.steps.iter().map(|step| step.step_id.as_str().to_string()).collect();

    while !remaining.is_empty() {
        let ready: Vec<String> = remaining
            .iter()
            .filter(|step| {
                edges
                    .get(*step)
                    .map_or(true, |deps| deps.iter().all(|dep| level_of.contains_key(dep)))
            })
            .cloned()
            .collect();
        if ready.is_empty() {
            return Err(PlanError::Cycle(remaining.into_iter().collect()));
        }
        for step in ready {
            let level = edges
                .get(&step)
                .map_or(0, |deps| {
                    deps.iter().filter_map(|dep| level_of.get(dep)).max().map_or(0, |max| max + 1)
                });
            level_of.insert(step.clone(), level);
            remaining.remove(&step);
        }
    }

    let max_level = level_of.values().copied().max().unwrap_or(0);
    let mut levels: Vec<Vec<usize>> = vec![Vec::new(); max_level + 1];
    // Request order within a level keeps expansion deterministic.
    for (step_index, step) in request.steps.iter().enumerate() {
        if let Some(level) = level_of.get(step.step_id.as_str()) {
            levels[*level].push(step_index);
        }
    }
    Ok(levels)
}

/// Computes the remaining critical-path depth of each step.
///
/// Depth is one for sinks and grows toward roots, so the scheduler can
/// prefer the longest remaining chain.
fn critical_depths(
    request: &MigrationRequest,
    edges: &BTreeMap<String, BTreeSet<String>>,
) -> BTreeMap<String, usize> {
    // Reverse adjacency: step -> dependents.
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (step, deps) in edges {
        for dep in deps {
            dependents.entry(dep.as_str()).or_default().push(step.as_str());
        }
    }

    let mut depths: BTreeMap<String, usize> = BTreeMap::new();
    // Fixed-point over the DAG; bounded by step count.
    for _ in 0..request.steps.len() {
        let mut changed = false;
        for step in &request.steps {
            let id = step.step_id.as_str();
            let below = dependents
                .get(id)
                .map_or(0, |dependent| {
                    dependent.iter().filter_map(|d| depths.get(*d)).max().copied().unwrap_or(0)
                });
            let depth = below + 1;
            if depths.get(id) != Some(&depth) {
                depths.insert(id.to_string(), depth);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    depths
}
