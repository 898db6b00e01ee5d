// shardflow-engine/src/retry.rs
// ============================================================================
// Module: Engine Retry Policy
// Description: Bounded exponential backoff with jitter, classified by error.
// Purpose: Recover transient and contention errors locally; never retry
//          logical, structural, or fatal errors.
// Dependencies: rand, shardflow-core
// ============================================================================

//! ## Overview
//! Retries are explicit and bounded. Transient errors back off exponentially
//! from a base with a cap; contention errors use a shorter base. Jitter of up
//! to a quarter of the delay is added so synchronized executors do not retry
//! in lockstep. The caller decides retry eligibility from the error class;
//! the policy only produces delays.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;

use rand::RngCore;
use rand::rngs::OsRng;
use shardflow_core::ErrorClass;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default maximum attempts per step-level operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default transient backoff base in milliseconds.
pub const DEFAULT_BASE_MS: u64 = 100;
/// Default backoff cap in milliseconds.
pub const DEFAULT_CAP_MS: u64 = 5_000;
/// Default contention backoff base in milliseconds.
pub const DEFAULT_CONTENTION_BASE_MS: u64 = 25;
/// Default exponential growth factor between attempts.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;

// ============================================================================
// SECTION: Retry Policy
// ============================================================================

/// Bounded retry policy applied inside executors and the lock manager.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Transient backoff base in milliseconds.
    pub base_ms: u64,
    /// Backoff cap in milliseconds.
    pub cap_ms: u64,
    /// Contention backoff base in milliseconds.
    pub contention_base_ms: u64,
    /// Exponential growth factor between attempts.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_ms: DEFAULT_BASE_MS,
            cap_ms: DEFAULT_CAP_MS,
            contention_base_ms: DEFAULT_CONTENTION_BASE_MS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Returns true when another attempt is allowed for the error class.
    ///
    /// `attempt` is one-based and counts attempts already made.
    #[must_use]
    pub const fn should_retry(&self, class: ErrorClass, attempt: u32) -> bool {
        class.is_retryable() && attempt < self.max_attempts
    }

    /// Returns the backoff delay before the next attempt.
    ///
    /// `attempt` is one-based and counts attempts already made.
    #[must_use]
    pub fn delay_for(&self, class: ErrorClass, attempt: u32) -> Duration {
        let base = match class {
            ErrorClass::Contention => self.contention_base_ms,
            _ => self.base_ms,
        };
        let exponent = attempt.saturating_sub(1).min(16);
        let scaled = (base as f64) * self.backoff_factor.powi(exponent as i32);
        let capped = scaled.min(self.cap_ms as f64) as u64;
        Duration::from_millis(capped.saturating_add(jitter(capped)))
    }
}

/// Returns a jitter of up to a quarter of the delay.
fn jitter(delay_ms: u64) -> u64 {
    let bound = delay_ms / 4;
    if bound == 0 {
        return 0;
    }
    OsRng.next_u64() % (bound + 1)
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies retry eligibility follows the taxonomy.
    #[test]
    fn retry_eligibility_follows_taxonomy() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(ErrorClass::Transient, 1));
        assert!(policy.should_retry(ErrorClass::Contention, 2));
        assert!(!policy.should_retry(ErrorClass::Transient, 3));
        assert!(!policy.should_retry(ErrorClass::Logical, 1));
        assert!(!policy.should_retry(ErrorClass::Structural, 1));
        assert!(!policy.should_retry(ErrorClass::Fatal, 1));
    }

    /// Verifies delays grow with attempts and respect the cap.
    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_ms: 100,
            cap_ms: 400,
            contention_base_ms: 25,
            backoff_factor: 2.0,
        };
        let first = policy.delay_for(ErrorClass::Transient, 1).as_millis() as u64;
        let third = policy.delay_for(ErrorClass::Transient, 3).as_millis() as u64;
        assert!(first >= 100 && first <= 125);
        // 100 * 2^2 = 400, capped at 400 plus jitter up to 100.
        assert!(third >= 400 && third <= 500);
    }

    /// Verifies contention uses the shorter base.
    #[test]
    fn contention_uses_shorter_base() {
        let policy = RetryPolicy::default();
        let contention = policy.delay_for(ErrorClass::Contention, 1).as_millis() as u64;
        assert!(contention <= DEFAULT_BASE_MS);
    }
}
