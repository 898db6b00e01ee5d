// shardflow-engine/src/lib.rs
// ============================================================================
// Module: Shardflow Engine
// Description: The migration coordination engine.
// Purpose: Plan, orchestrate, execute, validate, and roll back sharded
//          schema and data migrations.
// Dependencies: rand, serde, serde_json, shardflow-core, thiserror, tokio,
//               tokio-util
// ============================================================================

//! ## Overview
//! `shardflow-engine` is the coordination engine over the `shardflow-core`
//! model: a planner that turns requests into staged, shard-expanded plans; an
//! orchestrator that drives the migration state machine with bounded
//! fan-out; executors with checkpointed resume and commit-boundary
//! cancellation; an adaptive batch pump; a three-phase validator; and a
//! leased lock manager with fencing.
//!
//! Execution is cooperative and I/O-bound on tokio: executors suspend on
//! driver calls, status store CAS, and event appends, with true parallelism
//! capped per store class.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod clock;
pub mod config;
pub mod events;
pub mod executor;
pub mod locks;
pub mod orchestrator;
pub mod planner;
pub mod pump;
pub mod retry;
pub mod service;
pub mod validator;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use clock::Clock;
pub use clock::LogicalClock;
pub use clock::SystemClock;
pub use config::CoordinatorConfig;
pub use config::RollbackPolicy;
pub use events::EventLog;
pub use executor::CompensationOutcome;
pub use executor::ExecutorEnv;
pub use executor::StepFailure;
pub use executor::StepOutcome;
pub use locks::LeaseSet;
pub use locks::LockConfig;
pub use locks::LockError;
pub use locks::LockManager;
pub use orchestrator::Coordinator;
pub use orchestrator::EngineError;
pub use planner::PlanError;
pub use planner::build_plan;
pub use pump::BatchController;
pub use pump::BatchTuning;
pub use retry::RetryPolicy;
pub use service::CommandLoop;
pub use service::CommandOutcome;
pub use service::MigrationService;
pub use validator::ValidationBaseline;
pub use validator::ValidationFailure;
pub use validator::Validator;
