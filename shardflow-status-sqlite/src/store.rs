// shardflow-status-sqlite/src/store.rs
// ============================================================================
// Module: SQLite Status Store
// Description: Durable StatusStore backed by SQLite WAL.
// Purpose: Persist migration state, progress, events, and locks with
//          row-version CAS and fencing enforcement.
// Dependencies: rusqlite, serde, serde_json, shardflow-core, thiserror, tokio
// ============================================================================

//! ## Overview
//! The relational status store backend: every record is stored as canonical
//! JSON beside the columns the store enforces (CAS versions, fencing
//! tokens, monotonic item counts, publish flags). Mutations run inside
//! SQLite transactions, so readers see stale but never torn records, and
//! the store remains the single source of truth on crash recovery.
//!
//! The store itself is synchronous; the async [`StatusStore`] contract is
//! satisfied by hopping onto the blocking pool per call.
//! Security posture: database contents are untrusted on load and fail
//! closed on parse errors.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use shardflow_core::EventId;
use shardflow_core::EventRecord;
use shardflow_core::FencingToken;
use shardflow_core::IdempotencyKey;
use shardflow_core::LockRecord;
use shardflow_core::LockResource;
use shardflow_core::MigrationId;
use shardflow_core::MigrationRecord;
use shardflow_core::MigrationRequest;
use shardflow_core::OwnerToken;
use shardflow_core::Plan;
use shardflow_core::ShardId;
use shardflow_core::ShardProgress;
use shardflow_core::StepId;
use shardflow_core::Timestamp;
use shardflow_core::interfaces::MigrationFilter;
use shardflow_core::interfaces::StatusStore;
use shardflow_core::interfaces::StatusStoreError;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// `SQLite` schema version for the store.
const SCHEMA_VERSION: i64 = 1;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteJournalMode {
    /// WAL journal mode (recommended).
    #[default]
    Wal,
    /// Delete journal mode (legacy).
    Delete,
}

impl SqliteJournalMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Wal => "wal",
            Self::Delete => "delete",
        }
    }
}

/// `SQLite` sync mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqliteSyncMode {
    /// Full synchronous mode (safest).
    #[default]
    Full,
    /// Normal synchronous mode (balanced).
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

/// Configuration for the `SQLite` status store.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteStatusConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// `SQLite` journal mode.
    #[serde(default)]
    pub journal_mode: SqliteJournalMode,
    /// `SQLite` sync mode.
    #[serde(default)]
    pub sync_mode: SqliteSyncMode,
}

impl SqliteStatusConfig {
    /// Creates a config with defaults for a database path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: SqliteJournalMode::default(),
            sync_mode: SqliteSyncMode::default(),
        }
    }
}

/// Returns the default busy timeout for `SQLite` connections.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// `SQLite` status store errors.
#[derive(Debug, Error)]
pub enum SqliteStatusError {
    /// `SQLite` engine error.
    #[error("sqlite status db error: {0}")]
    Db(String),
    /// Stored data failed parsing.
    #[error("sqlite status corruption: {0}")]
    Corrupt(String),
    /// Store schema version mismatch.
    #[error("sqlite status version mismatch: stored {stored}, supported {SCHEMA_VERSION}")]
    VersionMismatch {
        /// Version found in the database.
        stored: i64,
    },
}

impl From<rusqlite::Error> for SqliteStatusError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<SqliteStatusError> for StatusStoreError {
    fn from(err: SqliteStatusError) -> Self {
        match err {
            SqliteStatusError::Db(message) => Self::Store(message),
            SqliteStatusError::Corrupt(message) => Self::Corrupt(message),
            SqliteStatusError::VersionMismatch {
                stored,
            } => Self::Corrupt(format!("schema version mismatch: stored {stored}")),
        }
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// Durable status store on `SQLite`.
#[derive(Clone)]
pub struct SqliteStatusStore {
    /// Serialized connection handle.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStatusStore {
    /// Opens (and initializes) the store at the configured path.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStatusError`] when the database cannot be opened or
    /// its schema version is unsupported.
    pub fn open(config: &SqliteStatusConfig) -> Result<Self, SqliteStatusError> {
        let conn = Connection::open(&config.path)?;
        Self::initialize(conn, config)
    }

    /// Opens an in-memory store; used by tests.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteStatusError`] when initialization fails.
    pub fn open_in_memory() -> Result<Self, SqliteStatusError> {
        let config = SqliteStatusConfig::new(Path::new(":memory:"));
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn, &config)
    }

    /// Applies pragmas and the schema, verifying the stored version.
    fn initialize(
        conn: Connection,
        config: &SqliteStatusConfig,
    ) -> Result<Self, SqliteStatusError> {
        conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))?;
        conn.pragma_update(None, "journal_mode", config.journal_mode.pragma_value())?;
        conn.pragma_update(None, "synchronous", config.sync_mode.pragma_value())?;
        conn.pragma_update(None, "foreign_keys", "on")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                 version INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS migrations (
                 migration_id TEXT PRIMARY KEY,
                 idempotency_key TEXT NOT NULL,
                 state TEXT NOT NULL,
                 version INTEGER NOT NULL,
                 record_json TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_migrations_idempotency
                 ON migrations (idempotency_key);
             CREATE TABLE IF NOT EXISTS migration_requests (
                 migration_id TEXT PRIMARY KEY,
                 request_json TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS migration_plans (
                 migration_id TEXT PRIMARY KEY,
                 plan_json TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS migration_baselines (
                 migration_id TEXT PRIMARY KEY,
                 baseline_json TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS shard_migrations (
                 migration_id TEXT NOT NULL,
                 step_id TEXT NOT NULL,
                 shard_id TEXT NOT NULL,
                 items_processed INTEGER NOT NULL,
                 version INTEGER NOT NULL,
                 progress_json TEXT NOT NULL,
                 PRIMARY KEY (migration_id, step_id, shard_id)
             );
             CREATE TABLE IF NOT EXISTS migration_history (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 event_id TEXT NOT NULL UNIQUE,
                 migration_id TEXT NOT NULL,
                 published INTEGER NOT NULL DEFAULT 0,
                 event_json TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_history_migration
                 ON migration_history (migration_id, seq);
             CREATE TABLE IF NOT EXISTS migration_locks (
                 resource TEXT PRIMARY KEY,
                 holder TEXT NOT NULL,
                 token INTEGER NOT NULL,
                 lock_json TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS fencing (
                 resource TEXT PRIMARY KEY,
                 max_token INTEGER NOT NULL
             );",
        )?;

        let stored: Option<i64> =
            conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
                .optional()?;
        match stored {
            None => {
                conn.execute("INSERT INTO schema_version (version) VALUES (?1)", params![
                    SCHEMA_VERSION
                ])?;
            }
            Some(version) if version == SCHEMA_VERSION => {}
            Some(version) => {
                return Err(SqliteStatusError::VersionMismatch {
                    stored: version,
                });
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs a store operation on the blocking pool.
    async fn with_conn<T, F>(&self, op: F) -> Result<T, StatusStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StatusStoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StatusStoreError::Store("sqlite connection mutex poisoned".to_string()))?;
            op(&mut guard)
        })
        .await
        .map_err(|err| StatusStoreError::Store(err.to_string()))?
    }
}

// ============================================================================
// SECTION: JSON Helpers
// ============================================================================

/// Serializes a record to its JSON column form.
fn to_json<T: Serialize>(value: &T) -> Result<String, StatusStoreError> {
    serde_json::to_string(value).map_err(|err| StatusStoreError::Corrupt(err.to_string()))
}

/// Parses a JSON column, failing closed on corruption.
fn from_json<T: DeserializeOwned>(text: &str) -> Result<T, StatusStoreError> {
    serde_json::from_str(text).map_err(|err| StatusStoreError::Corrupt(err.to_string()))
}

/// Maps a rusqlite error into the store error space.
fn db_err(err: rusqlite::Error) -> StatusStoreError {
    StatusStoreError::Store(err.to_string())
}

/// Loads a migration record row by id.
fn load_record(conn: &Connection, migration_id: &str) -> Result<Option<MigrationRecord>, StatusStoreError> {
    conn.query_row(
        "SELECT record_json FROM migrations WHERE migration_id = ?1",
        params![migration_id],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(db_err)?
    .map(|json| from_json(&json))
    .transpose()
}

/// Returns true when the holder's locks may be revoked.
fn holder_revocable(conn: &Connection, holder: &str) -> Result<bool, StatusStoreError> {
    Ok(load_record(conn, holder)?.is_some_and(|record| record.locks_revocable()))
}

/// Reads the highest fencing token minted for a resource.
fn fence_high(conn: &Connection, resource: &str) -> Result<u64, StatusStoreError> {
    let stored: Option<i64> = conn
        .query_row("SELECT max_token FROM fencing WHERE resource = ?1", params![resource], |row| {
            row.get(0)
        })
        .optional()
        .map_err(db_err)?;
    Ok(stored.map_or(0, |token| token as u64))
}

// ============================================================================
// SECTION: StatusStore Implementation
// ============================================================================

#[async_trait]
impl StatusStore for SqliteStatusStore {
    async fn create_migration(&self, record: &MigrationRecord) -> Result<(), StatusStoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let json = to_json(&record)?;
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO migrations
                         (migration_id, idempotency_key, state, version, record_json)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        record.migration_id.as_str(),
                        record.idempotency_key.as_str(),
                        record.state.as_str(),
                        record.version as i64,
                        json
                    ],
                )
                .map_err(db_err)?;
            if inserted == 0 {
                return Err(StatusStoreError::AlreadyExists(
                    record.migration_id.as_str().to_string(),
                ));
            }
            Ok(())
        })
        .await
    }

    async fn load_migration(
        &self,
        migration_id: &MigrationId,
    ) -> Result<Option<MigrationRecord>, StatusStoreError> {
        let migration_id = migration_id.as_str().to_string();
        self.with_conn(move |conn| load_record(conn, &migration_id)).await
    }

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<MigrationRecord>, StatusStoreError> {
        let key = key.as_str().to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT record_json FROM migrations WHERE idempotency_key = ?1 LIMIT 1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_err)?
            .map(|json| from_json(&json))
            .transpose()
        })
        .await
    }

    async fn list_migrations(
        &self,
        filter: &MigrationFilter,
    ) -> Result<Vec<MigrationRecord>, StatusStoreError> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT record_json FROM migrations ORDER BY migration_id")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<Result<Vec<String>, _>>()
                .map_err(db_err)?;
            let mut records = Vec::with_capacity(rows.len());
            for json in rows {
                let record: MigrationRecord = from_json(&json)?;
                if filter.state.map_or(true, |state| record.state == state)
                    && filter.store_class.map_or(true, |class| record.store_class == class)
                {
                    records.push(record);
                }
            }
            Ok(records)
        })
        .await
    }

    async fn cas_migration(
        &self,
        record: &MigrationRecord,
    ) -> Result<MigrationRecord, StatusStoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let stored = load_record(conn, record.migration_id.as_str())?
                .ok_or_else(|| StatusStoreError::NotFound(record.migration_id.as_str().to_string()))?;
            if stored.version != record.version {
                return Err(StatusStoreError::VersionConflict {
                    expected: record.version,
                    actual: stored.version,
                });
            }
            if stored.state != record.state && !stored.state.can_transition_to(record.state) {
                return Err(StatusStoreError::IllegalTransition {
                    from: stored.state,
                    to: record.state,
                });
            }
            let mut next = record.clone();
            next.version = stored.version + 1;
            let json = to_json(&next)?;
            let changed = conn
                .execute(
                    "UPDATE migrations
                     SET record_json = ?1, state = ?2, version = ?3
                     WHERE migration_id = ?4 AND version = ?5",
                    params![
                        json,
                        next.state.as_str(),
                        next.version as i64,
                        next.migration_id.as_str(),
                        stored.version as i64
                    ],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(StatusStoreError::VersionConflict {
                    expected: record.version,
                    actual: stored.version,
                });
            }
            Ok(next)
        })
        .await
    }

    async fn claim_migration(
        &self,
        migration_id: &MigrationId,
        new_owner: &OwnerToken,
        expected_version: u64,
    ) -> Result<MigrationRecord, StatusStoreError> {
        let migration_id = migration_id.as_str().to_string();
        let new_owner = new_owner.clone();
        self.with_conn(move |conn| {
            let stored = load_record(conn, &migration_id)?
                .ok_or_else(|| StatusStoreError::NotFound(migration_id.clone()))?;
            if stored.version != expected_version {
                return Err(StatusStoreError::VersionConflict {
                    expected: expected_version,
                    actual: stored.version,
                });
            }
            let mut next = stored.clone();
            next.owner_token = new_owner;
            next.version = stored.version + 1;
            let json = to_json(&next)?;
            conn.execute(
                "UPDATE migrations SET record_json = ?1, version = ?2
                 WHERE migration_id = ?3 AND version = ?4",
                params![json, next.version as i64, migration_id, stored.version as i64],
            )
            .map_err(db_err)?;
            Ok(next)
        })
        .await
    }

    async fn store_request(
        &self,
        migration_id: &MigrationId,
        request: &MigrationRequest,
    ) -> Result<(), StatusStoreError> {
        let migration_id = migration_id.as_str().to_string();
        let request = request.clone();
        self.with_conn(move |conn| {
            let json = to_json(&request)?;
            conn.execute(
                "INSERT OR REPLACE INTO migration_requests (migration_id, request_json)
                 VALUES (?1, ?2)",
                params![migration_id, json],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn load_request(
        &self,
        migration_id: &MigrationId,
    ) -> Result<Option<MigrationRequest>, StatusStoreError> {
        let migration_id = migration_id.as_str().to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT request_json FROM migration_requests WHERE migration_id = ?1",
                params![migration_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_err)?
            .map(|json| from_json(&json))
            .transpose()
        })
        .await
    }

    async fn store_plan(
        &self,
        migration_id: &MigrationId,
        plan: &Plan,
    ) -> Result<(), StatusStoreError> {
        let migration_id = migration_id.as_str().to_string();
        let plan = plan.clone();
        self.with_conn(move |conn| {
            let json = to_json(&plan)?;
            conn.execute(
                "INSERT OR REPLACE INTO migration_plans (migration_id, plan_json)
                 VALUES (?1, ?2)",
                params![migration_id, json],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn load_plan(&self, migration_id: &MigrationId) -> Result<Option<Plan>, StatusStoreError> {
        let migration_id = migration_id.as_str().to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT plan_json FROM migration_plans WHERE migration_id = ?1",
                params![migration_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_err)?
            .map(|json| from_json(&json))
            .transpose()
        })
        .await
    }

    async fn store_baseline(
        &self,
        migration_id: &MigrationId,
        baseline: &Value,
    ) -> Result<(), StatusStoreError> {
        let migration_id = migration_id.as_str().to_string();
        let baseline = baseline.clone();
        self.with_conn(move |conn| {
            let json = to_json(&baseline)?;
            conn.execute(
                "INSERT OR REPLACE INTO migration_baselines (migration_id, baseline_json)
                 VALUES (?1, ?2)",
                params![migration_id, json],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn load_baseline(
        &self,
        migration_id: &MigrationId,
    ) -> Result<Option<Value>, StatusStoreError> {
        let migration_id = migration_id.as_str().to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT baseline_json FROM migration_baselines WHERE migration_id = ?1",
                params![migration_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_err)?
            .map(|json| from_json(&json))
            .transpose()
        })
        .await
    }

    async fn load_progress(
        &self,
        migration_id: &MigrationId,
        step_id: &StepId,
        shard_id: &ShardId,
    ) -> Result<Option<ShardProgress>, StatusStoreError> {
        let migration_id = migration_id.as_str().to_string();
        let step_id = step_id.as_str().to_string();
        let shard_id = shard_id.as_str().to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT progress_json FROM shard_migrations
                 WHERE migration_id = ?1 AND step_id = ?2 AND shard_id = ?3",
                params![migration_id, step_id, shard_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_err)?
            .map(|json| from_json(&json))
            .transpose()
        })
        .await
    }

    async fn list_progress(
        &self,
        migration_id: &MigrationId,
    ) -> Result<Vec<ShardProgress>, StatusStoreError> {
        let migration_id = migration_id.as_str().to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT progress_json FROM shard_migrations
                     WHERE migration_id = ?1
                     ORDER BY step_id, shard_id",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![migration_id], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<Result<Vec<String>, _>>()
                .map_err(db_err)?;
            rows.iter().map(|json| from_json(json)).collect()
        })
        .await
    }

    async fn upsert_progress(
        &self,
        progress: &ShardProgress,
        resource: &LockResource,
        token: FencingToken,
    ) -> Result<ShardProgress, StatusStoreError> {
        let progress = progress.clone();
        let resource = resource.as_key();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let high = fence_high(&tx, &resource)?;
            if token.get() < high {
                return Err(StatusStoreError::StaleFencingToken {
                    resource,
                    presented: token.get(),
                    required: high,
                });
            }
            let key = format!(
                "{}/{}/{}",
                progress.migration_id, progress.step_id, progress.shard_id
            );
            let stored: Option<(i64, i64)> = tx
                .query_row(
                    "SELECT items_processed, version FROM shard_migrations
                     WHERE migration_id = ?1 AND step_id = ?2 AND shard_id = ?3",
                    params![
                        progress.migration_id.as_str(),
                        progress.step_id.as_str(),
                        progress.shard_id.as_str()
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(db_err)?;
            if let Some((items, _)) = stored {
                if progress.items_processed < items as u64 {
                    return Err(StatusStoreError::ProgressRegression {
                        key,
                        from: items as u64,
                        to: progress.items_processed,
                    });
                }
            }
            let mut next = progress.clone();
            next.version = stored.map_or(1, |(_, version)| version as u64 + 1);
            let json = to_json(&next)?;
            tx.execute(
                "INSERT OR REPLACE INTO shard_migrations
                     (migration_id, step_id, shard_id, items_processed, version, progress_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    next.migration_id.as_str(),
                    next.step_id.as_str(),
                    next.shard_id.as_str(),
                    next.items_processed as i64,
                    next.version as i64,
                    json
                ],
            )
            .map_err(db_err)?;
            tx.execute(
                "INSERT OR REPLACE INTO fencing (resource, max_token) VALUES (?1, ?2)",
                params![resource, token.get() as i64],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(next)
        })
        .await
    }

    async fn append_event(&self, record: &EventRecord) -> Result<(), StatusStoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let json = to_json(&record)?;
            // Duplicate appends are no-ops so at-least-once emitters stay safe.
            conn.execute(
                "INSERT OR IGNORE INTO migration_history
                     (event_id, migration_id, published, event_json)
                 VALUES (?1, ?2, 0, ?3)",
                params![record.event_id.as_str(), record.migration_id.as_str(), json],
            )
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn list_events(
        &self,
        migration_id: &MigrationId,
    ) -> Result<Vec<EventRecord>, StatusStoreError> {
        let migration_id = migration_id.as_str().to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT event_json FROM migration_history
                     WHERE migration_id = ?1 ORDER BY seq",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![migration_id], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<Result<Vec<String>, _>>()
                .map_err(db_err)?;
            rows.iter().map(|json| from_json(json)).collect()
        })
        .await
    }

    async fn unpublished_events(&self, limit: usize) -> Result<Vec<EventRecord>, StatusStoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT event_json FROM migration_history
                     WHERE published = 0 ORDER BY seq LIMIT ?1",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![limit as i64], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<Result<Vec<String>, _>>()
                .map_err(db_err)?;
            rows.iter().map(|json| from_json(json)).collect()
        })
        .await
    }

    async fn mark_event_published(&self, event_id: &EventId) -> Result<(), StatusStoreError> {
        let event_id = event_id.as_str().to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE migration_history SET published = 1 WHERE event_id = ?1",
                    params![event_id],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(StatusStoreError::NotFound(event_id));
            }
            Ok(())
        })
        .await
    }

    async fn try_acquire_lock(
        &self,
        resource: &LockResource,
        holder: &MigrationId,
        now: Timestamp,
        ttl_ms: u64,
    ) -> Result<LockRecord, StatusStoreError> {
        let resource = resource.clone();
        let holder = holder.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let key = resource.as_key();
            let existing: Option<String> = tx
                .query_row(
                    "SELECT lock_json FROM migration_locks WHERE resource = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            if let Some(json) = existing {
                let lock: LockRecord = from_json(&json)?;
                if lock.holder == holder {
                    // Re-acquisition by the holder extends the lease in place.
                    let mut renewed = lock;
                    renewed.expires_at = now.plus_millis(ttl_ms);
                    let json = to_json(&renewed)?;
                    tx.execute(
                        "UPDATE migration_locks SET lock_json = ?1 WHERE resource = ?2",
                        params![json, key],
                    )
                    .map_err(db_err)?;
                    tx.commit().map_err(db_err)?;
                    return Ok(renewed);
                }
                let revocable = holder_revocable(&tx, lock.holder.as_str())?;
                let expired = now.has_reached(&lock.expires_at);
                if !revocable && !expired {
                    return Err(StatusStoreError::LockBusy {
                        resource: key,
                        holder: lock.holder.as_str().to_string(),
                    });
                }
            }
            let token = FencingToken::new(fence_high(&tx, &key)? + 1);
            let record = LockRecord {
                resource: resource.clone(),
                holder: holder.clone(),
                acquired_at: now,
                expires_at: now.plus_millis(ttl_ms),
                fencing_token: token,
            };
            let json = to_json(&record)?;
            tx.execute(
                "INSERT OR REPLACE INTO migration_locks (resource, holder, token, lock_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key, holder.as_str(), token.get() as i64, json],
            )
            .map_err(db_err)?;
            tx.execute(
                "INSERT OR REPLACE INTO fencing (resource, max_token) VALUES (?1, ?2)",
                params![key, token.get() as i64],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(record)
        })
        .await
    }

    async fn renew_lock(
        &self,
        resource: &LockResource,
        holder: &MigrationId,
        now: Timestamp,
        ttl_ms: u64,
    ) -> Result<LockRecord, StatusStoreError> {
        let resource = resource.as_key();
        let holder = holder.clone();
        self.with_conn(move |conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT lock_json FROM migration_locks WHERE resource = ?1",
                    params![resource],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            let Some(json) = existing else {
                return Err(StatusStoreError::LockNotHeld(resource));
            };
            let lock: LockRecord = from_json(&json)?;
            if lock.holder != holder {
                return Err(StatusStoreError::LockNotHeld(resource));
            }
            let mut renewed = lock;
            renewed.expires_at = now.plus_millis(ttl_ms);
            let json = to_json(&renewed)?;
            conn.execute(
                "UPDATE migration_locks SET lock_json = ?1 WHERE resource = ?2",
                params![json, resource],
            )
            .map_err(db_err)?;
            Ok(renewed)
        })
        .await
    }

    async fn release_lock(
        &self,
        resource: &LockResource,
        holder: &MigrationId,
    ) -> Result<(), StatusStoreError> {
        let resource = resource.as_key();
        let holder = holder.as_str().to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "DELETE FROM migration_locks WHERE resource = ?1 AND holder = ?2",
                    params![resource, holder],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(StatusStoreError::LockNotHeld(resource));
            }
            Ok(())
        })
        .await
    }

    async fn reap_stale_locks(
        &self,
        now: Timestamp,
        grace_ms: u64,
    ) -> Result<Vec<LockRecord>, StatusStoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let rows = {
                let mut stmt =
                    tx.prepare("SELECT lock_json FROM migration_locks").map_err(db_err)?;
                let collected = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(db_err)?
                    .collect::<Result<Vec<String>, _>>()
                    .map_err(db_err)?;
                collected
            };
            let mut reaped = Vec::new();
            for json in rows {
                let lock: LockRecord = from_json(&json)?;
                let revocable = holder_revocable(&tx, lock.holder.as_str())?;
                if revocable || lock.is_expired(&now, grace_ms) {
                    tx.execute(
                        "DELETE FROM migration_locks WHERE resource = ?1",
                        params![lock.resource.as_key()],
                    )
                    .map_err(db_err)?;
                    reaped.push(lock);
                }
            }
            tx.commit().map_err(db_err)?;
            Ok(reaped)
        })
        .await
    }

    async fn list_locks(&self) -> Result<Vec<LockRecord>, StatusStoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT lock_json FROM migration_locks ORDER BY resource")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<Result<Vec<String>, _>>()
                .map_err(db_err)?;
            rows.iter().map(|json| from_json(json)).collect()
        })
        .await
    }
}
