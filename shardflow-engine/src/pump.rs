// shardflow-engine/src/pump.rs
// ============================================================================
// Module: Engine Batch Pump
// Description: Adaptive batch sizing with latency watermarks and health input.
// Purpose: Bound operational impact by tuning batch size per shard.
// Dependencies: shardflow-core
// ============================================================================

//! ## Overview
//! Each executor drives one [`BatchController`] per shard. Every adjust
//! window the controller compares mean batch latency against two watermarks:
//! above the high watermark (or on a degraded backend) the size halves; below
//! the low watermark on a healthy backend it grows multiplicatively. Sizes
//! are clamped to the configured bounds. A degraded health observation
//! shrinks immediately rather than waiting for the window.
//!
//! Backpressure is enforced elsewhere: executors stream at most one batch
//! per shard, and the orchestrator caps concurrent batches per store class
//! with a semaphore.

// ============================================================================
// SECTION: Imports
// ============================================================================

use shardflow_core::HealthStatus;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Batches per control-loop adjustment window.
pub const DEFAULT_ADJUST_WINDOW: usize = 8;
/// High latency watermark in milliseconds.
pub const DEFAULT_HIGH_WATERMARK_MS: u64 = 750;
/// Low latency watermark in milliseconds.
pub const DEFAULT_LOW_WATERMARK_MS: u64 = 200;
/// Multiplicative growth factor applied below the low watermark.
pub const DEFAULT_GROW_FACTOR: f64 = 1.5;

// ============================================================================
// SECTION: Tuning
// ============================================================================

/// Batch pump tuning parameters.
#[derive(Debug, Clone, Copy)]
pub struct BatchTuning {
    /// Minimum batch size.
    pub min_batch: usize,
    /// Maximum batch size.
    pub max_batch: usize,
    /// Initial batch size.
    pub initial_batch: usize,
    /// Batches per adjustment window.
    pub adjust_window: usize,
    /// High latency watermark in milliseconds.
    pub high_watermark_ms: u64,
    /// Low latency watermark in milliseconds.
    pub low_watermark_ms: u64,
    /// Growth factor applied below the low watermark.
    pub grow_factor: f64,
}

impl Default for BatchTuning {
    fn default() -> Self {
        Self {
            min_batch: 50,
            max_batch: 5_000,
            initial_batch: 1_000,
            adjust_window: DEFAULT_ADJUST_WINDOW,
            high_watermark_ms: DEFAULT_HIGH_WATERMARK_MS,
            low_watermark_ms: DEFAULT_LOW_WATERMARK_MS,
            grow_factor: DEFAULT_GROW_FACTOR,
        }
    }
}

// ============================================================================
// SECTION: Batch Controller
// ============================================================================

/// Per-shard adaptive batch size controller.
#[derive(Debug)]
pub struct BatchController {
    /// Tuning parameters.
    tuning: BatchTuning,
    /// Current batch size.
    current: usize,
    /// Latency samples of the open window.
    window: Vec<u64>,
}

impl BatchController {
    /// Creates a controller at the initial size, clamped to the bounds.
    #[must_use]
    pub fn new(tuning: BatchTuning) -> Self {
        let current = tuning.initial_batch.clamp(tuning.min_batch, tuning.max_batch);
        Self {
            tuning,
            current,
            window: Vec::with_capacity(tuning.adjust_window),
        }
    }

    /// Returns the batch size for the next stream call.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.current
    }

    /// Records one batch observation and adjusts the size when due.
    pub fn observe(&mut self, latency_ms: u64, health: HealthStatus) {
        if health != HealthStatus::Ok {
            self.shrink();
            self.window.clear();
            return;
        }
        self.window.push(latency_ms);
        if self.window.len() < self.tuning.adjust_window.max(1) {
            return;
        }
        let mean = self.window.iter().sum::<u64>() / self.window.len() as u64;
        if mean > self.tuning.high_watermark_ms {
            self.shrink();
        } else if mean < self.tuning.low_watermark_ms {
            self.grow();
        }
        self.window.clear();
    }

    /// Halves the batch size down to the floor.
    fn shrink(&mut self) {
        self.current = (self.current / 2).max(self.tuning.min_batch);
    }

    /// Grows the batch size multiplicatively up to the ceiling.
    fn grow(&mut self) {
        let grown = ((self.current as f64) * self.tuning.grow_factor) as usize;
        self.current = grown.clamp(self.tuning.min_batch, self.tuning.max_batch);
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> BatchTuning {
        BatchTuning {
            min_batch: 50,
            max_batch: 4_000,
            initial_batch: 1_000,
            adjust_window: 4,
            high_watermark_ms: 750,
            low_watermark_ms: 200,
            grow_factor: 1.5,
        }
    }

    /// Verifies a degraded backend drives the size to the floor.
    #[test]
    fn degraded_health_reaches_min_batch() {
        let mut controller = BatchController::new(tuning());
        for _ in 0..16 {
            controller.observe(100, HealthStatus::Degraded);
        }
        assert_eq!(controller.size(), 50);
    }

    /// Verifies a steady healthy backend reaches the ceiling.
    #[test]
    fn healthy_low_latency_reaches_ceiling() {
        let mut controller = BatchController::new(tuning());
        for _ in 0..64 {
            controller.observe(50, HealthStatus::Ok);
        }
        assert_eq!(controller.size(), 4_000);
    }

    /// Verifies high latency halves the size once per window.
    #[test]
    fn high_latency_halves_per_window() {
        let mut controller = BatchController::new(tuning());
        for _ in 0..4 {
            controller.observe(2_000, HealthStatus::Ok);
        }
        assert_eq!(controller.size(), 500);
        // Window cleared; size holds until the next full window.
        controller.observe(2_000, HealthStatus::Ok);
        assert_eq!(controller.size(), 500);
    }

    /// Verifies mixed latency inside the watermark band holds steady.
    #[test]
    fn band_latency_holds_size() {
        let mut controller = BatchController::new(tuning());
        for _ in 0..8 {
            controller.observe(400, HealthStatus::Ok);
        }
        assert_eq!(controller.size(), 1_000);
    }
}
