// shardflow-core/tests/state_machine.rs
// ============================================================================
// Module: Migration State Machine Tests
// Description: Tests for legal and illegal migration state transitions.
// Purpose: Validate that state walks match the documented lifecycle.
// Dependencies: shardflow-core
// ============================================================================
//! ## Overview
//! Ensures the encoded state machine admits exactly the documented walks:
//! the happy path, the rollback branch, the cancel branch, and nothing else.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only panic-based assertions are permitted."
)]

use shardflow_core::MigrationState;

/// Verifies the happy-path walk is legal end to end.
#[test]
fn happy_path_walk_is_legal() {
    let walk = [
        MigrationState::Created,
        MigrationState::Planning,
        MigrationState::Pending,
        MigrationState::Running,
        MigrationState::Validating,
        MigrationState::Completed,
    ];
    for pair in walk.windows(2) {
        assert!(
            pair[0].can_transition_to(pair[1]),
            "expected {:?} -> {:?} to be legal",
            pair[0],
            pair[1]
        );
    }
}

/// Verifies the rollback branch is legal from running and validating.
#[test]
fn rollback_branch_is_legal() {
    assert!(MigrationState::Running.can_transition_to(MigrationState::Failing));
    assert!(MigrationState::Validating.can_transition_to(MigrationState::Failing));
    assert!(MigrationState::Failing.can_transition_to(MigrationState::RollingBack));
    assert!(MigrationState::RollingBack.can_transition_to(MigrationState::RolledBack));
    assert!(MigrationState::Failing.can_transition_to(MigrationState::Failed));
    assert!(MigrationState::RollingBack.can_transition_to(MigrationState::Failed));
}

/// Verifies cancel is reachable from every non-terminal state only.
#[test]
fn cancel_is_reachable_from_non_terminal_states() {
    let non_terminal = [
        MigrationState::Created,
        MigrationState::Planning,
        MigrationState::Pending,
        MigrationState::Running,
        MigrationState::Validating,
        MigrationState::Failing,
        MigrationState::RollingBack,
    ];
    for state in non_terminal {
        assert!(state.can_transition_to(MigrationState::Cancelling), "cancel from {state:?}");
    }
    let terminal = [
        MigrationState::Completed,
        MigrationState::RolledBack,
        MigrationState::Cancelled,
        MigrationState::Failed,
    ];
    for state in terminal {
        assert!(state.is_terminal());
        assert!(!state.can_transition_to(MigrationState::Cancelling), "no cancel from {state:?}");
    }
    assert!(MigrationState::Cancelling.can_transition_to(MigrationState::Cancelled));
}

/// Verifies skipping stages and reversing are illegal.
#[test]
fn illegal_transitions_are_rejected() {
    assert!(!MigrationState::Created.can_transition_to(MigrationState::Running));
    assert!(!MigrationState::Running.can_transition_to(MigrationState::Completed));
    assert!(!MigrationState::Completed.can_transition_to(MigrationState::Running));
    assert!(!MigrationState::RolledBack.can_transition_to(MigrationState::RollingBack));
    assert!(!MigrationState::Pending.can_transition_to(MigrationState::Validating));
}
