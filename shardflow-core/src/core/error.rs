// shardflow-core/src/core/error.rs
// ============================================================================
// Module: Shardflow Error Taxonomy
// Description: Error classification driving retry and propagation policy.
// Purpose: Classify every engine error as transient, contention, logical,
//          structural, or fatal.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Every error surfaced to the orchestrator carries an [`ErrorClass`]. The
//! class, not the concrete type, decides the response: transient and
//! contention errors are retried with bounded backoff, logical and structural
//! errors fail immediately, and fatal errors park the coordinator. Errors are
//! typed and propagated by return; the state machine drives control flow,
//! never error unwinding.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Error Class
// ============================================================================

/// Retry-policy classification of an error.
///
/// # Invariants
/// - Variants are stable for serialization and event details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Connection loss, timeout, or backend "retry later". Retried with
    /// exponential backoff up to the step attempt limit.
    Transient,
    /// Lock busy or optimistic CAS failure. Retried with shorter backoff.
    Contention,
    /// Schema conflict, transformer rejection, or validation mismatch.
    /// Never retried.
    Logical,
    /// Plan cycle, missing compensation, or topology mismatch. Fails the
    /// migration at the transition that detects it.
    Structural,
    /// Status store unavailable. Suspends scheduling; executors park at the
    /// next commit boundary.
    Fatal,
}

impl ErrorClass {
    /// Returns true when the class may be retried locally.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Contention)
    }

    /// Returns a stable label for the class.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Contention => "contention",
            Self::Logical => "logical",
            Self::Structural => "structural",
            Self::Fatal => "fatal",
        }
    }
}

// ============================================================================
// SECTION: Classification
// ============================================================================

/// Errors that expose their taxonomy class.
pub trait Classify {
    /// Returns the taxonomy class of this error.
    fn class(&self) -> ErrorClass;
}
