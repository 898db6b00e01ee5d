// shardflow-core/tests/plan_digest.rs
// ============================================================================
// Module: Plan Digest Tests
// Description: Tests for stable plan digests.
// Purpose: Validate that digests are stable and detect replanning.
// Dependencies: shardflow-core
// ============================================================================
//! ## Overview
//! The plan digest is a canonical hash of the plan structure. Identical
//! plans must hash identically; any structural change (new shard, reordered
//! stage) must change the digest so resumed coordinators detect replans.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only panic-based assertions are permitted."
)]

use shardflow_core::CollectionName;
use shardflow_core::Plan;
use shardflow_core::PlannedStep;
use shardflow_core::RequestId;
use shardflow_core::SchemaChange;
use shardflow_core::ShardId;
use shardflow_core::Stage;
use shardflow_core::StepId;
use shardflow_core::StepKind;
use shardflow_core::StepPayload;
use shardflow_core::StoreClass;
use shardflow_core::TopologyVersion;

fn planned_step(step: &str, shard: &str) -> PlannedStep {
    PlannedStep {
        step_id: StepId::new(format!("{step}@{shard}")),
        source_step: StepId::new(step),
        kind: StepKind::Schema,
        collection: CollectionName::new("messages"),
        shard_id: ShardId::new(shard),
        payload: StepPayload::Schema {
            change: SchemaChange {
                change_id: format!("{step}-change"),
                definition: serde_json::json!({"add_field": "version"}),
                down: None,
            },
        },
        depth: 1,
        estimated_items: None,
        deadline_ms: None,
    }
}

fn plan(shards: &[&str]) -> Plan {
    Plan {
        request_id: RequestId::new("req-1"),
        store_class: StoreClass::Document,
        topology_version: TopologyVersion::new(1),
        stages: vec![Stage {
            index: 0,
            steps: shards.iter().map(|shard| planned_step("s1", shard)).collect(),
        }],
    }
}

/// Verifies identical plans produce identical digests.
#[test]
fn identical_plans_hash_identically() {
    let a = plan(&["shard-0", "shard-1"]);
    let b = plan(&["shard-0", "shard-1"]);
    assert_eq!(a.digest().unwrap(), b.digest().unwrap());
}

/// Verifies a structural change (extra shard) changes the digest.
#[test]
fn structural_change_changes_digest() {
    let a = plan(&["shard-0", "shard-1"]);
    let b = plan(&["shard-0", "shard-1", "shard-2"]);
    assert_ne!(a.digest().unwrap(), b.digest().unwrap());
}

/// Verifies step accessors cover all stages.
#[test]
fn plan_accessors_cover_all_steps() {
    let plan = plan(&["shard-0", "shard-1"]);
    assert_eq!(plan.step_count(), 2);
    assert!(plan.step(&StepId::new("s1@shard-0")).is_some());
    assert!(plan.step(&StepId::new("s1@shard-9")).is_none());
}
