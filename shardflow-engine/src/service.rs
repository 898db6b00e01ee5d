// shardflow-engine/src/service.rs
// ============================================================================
// Module: Engine Service Surface
// Description: Control operations and bus command ingestion.
// Purpose: Expose the coordinator's contract to transports and consume
//          migration commands with at-least-once dedupe.
// Dependencies: shardflow-core, tokio, crate::orchestrator
// ============================================================================

//! ## Overview
//! The service wraps one [`Coordinator`] behind the control contract
//! (`create_migration`, `get_migration`, `start`, `cancel`, `list`) that any
//! admin transport calls into, and runs the command loop that consumes
//! `migration.request` / `migration.cancel` from a bus source. Commands are
//! delivered at-least-once; the loop dedupes on command id.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;

use shardflow_core::MigrationId;
use shardflow_core::MigrationRecord;
use shardflow_core::MigrationRequest;
use shardflow_core::ShardProgress;
use shardflow_core::interfaces::CommandEnvelope;
use shardflow_core::interfaces::CommandSource;
use shardflow_core::interfaces::MigrationCommand;
use shardflow_core::interfaces::MigrationFilter;

use crate::orchestrator::Coordinator;
use crate::orchestrator::EngineError;

// ============================================================================
// SECTION: Migration Service
// ============================================================================

/// Control surface over one coordinator.
#[derive(Clone)]
pub struct MigrationService {
    /// The coordinator driving migrations.
    coordinator: Arc<Coordinator>,
}

impl MigrationService {
    /// Creates a service over a coordinator.
    #[must_use]
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
        }
    }

    /// Returns the underlying coordinator.
    #[must_use]
    pub fn coordinator(&self) -> Arc<Coordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Admits a migration request and returns the created record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on validation, idempotency, or planning
    /// failure.
    pub async fn create_migration(
        &self,
        request: MigrationRequest,
    ) -> Result<MigrationRecord, EngineError> {
        self.coordinator.admit(request).await
    }

    /// Runs an admitted migration to a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for infrastructure failures.
    pub async fn start(&self, migration_id: &MigrationId) -> Result<MigrationRecord, EngineError> {
        self.coordinator.run(migration_id).await
    }

    /// Spawns a migration run in the background.
    #[must_use]
    pub fn start_detached(
        &self,
        migration_id: MigrationId,
    ) -> tokio::task::JoinHandle<Result<MigrationRecord, EngineError>> {
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(async move { coordinator.run(&migration_id).await })
    }

    /// Requests cooperative cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Terminal`] when the migration already ended.
    pub async fn cancel(&self, migration_id: &MigrationId) -> Result<(), EngineError> {
        self.coordinator.cancel(migration_id).await
    }

    /// Returns a migration and its per-shard progress.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for unknown migrations.
    pub async fn get_migration(
        &self,
        migration_id: &MigrationId,
    ) -> Result<(MigrationRecord, Vec<ShardProgress>), EngineError> {
        self.coordinator.get(migration_id).await
    }

    /// Lists migrations matching a filter.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the status store fails.
    pub async fn list(&self, filter: &MigrationFilter) -> Result<Vec<MigrationRecord>, EngineError> {
        self.coordinator.list(filter).await
    }
}

// ============================================================================
// SECTION: Command Loop
// ============================================================================

/// Outcome of processing one inbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// A migration was admitted and started.
    Admitted(MigrationId),
    /// A cancellation was requested.
    CancelRequested(MigrationId),
    /// The command id was already processed.
    Duplicate,
    /// The command failed.
    Rejected(String),
}

/// At-least-once command consumer with id dedupe.
pub struct CommandLoop {
    /// Service the commands act on.
    service: MigrationService,
    /// Seen command ids.
    seen: BTreeSet<String>,
}

impl CommandLoop {
    /// Creates a command loop over a service.
    #[must_use]
    pub fn new(service: MigrationService) -> Self {
        Self {
            service,
            seen: BTreeSet::new(),
        }
    }

    /// Processes one command envelope.
    pub async fn process(&mut self, envelope: CommandEnvelope) -> CommandOutcome {
        if !self.seen.insert(envelope.command_id.clone()) {
            return CommandOutcome::Duplicate;
        }
        match envelope.command {
            MigrationCommand::Request {
                request,
            } => match self.service.create_migration(request).await {
                Ok(record) => {
                    let migration_id = record.migration_id.clone();
                    drop(self.service.start_detached(migration_id.clone()));
                    CommandOutcome::Admitted(migration_id)
                }
                Err(err) => CommandOutcome::Rejected(err.to_string()),
            },
            MigrationCommand::Cancel {
                migration_id,
            } => match self.service.cancel(&migration_id).await {
                Ok(()) => CommandOutcome::CancelRequested(migration_id),
                Err(err) => CommandOutcome::Rejected(err.to_string()),
            },
        }
    }

    /// Drains every available command from a source.
    pub async fn pump(&mut self, source: &mut dyn CommandSource) -> Vec<CommandOutcome> {
        let mut outcomes = Vec::new();
        while let Some(envelope) = source.next_command() {
            outcomes.push(self.process(envelope).await);
        }
        outcomes
    }
}
