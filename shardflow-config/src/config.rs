// shardflow-config/src/config.rs
// ============================================================================
// Module: Shardflow Configuration
// Description: Configuration loading and validation for the coordinator.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: serde, shardflow-core, shardflow-engine, thiserror, toml
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size limits and
//! validated fail-closed: out-of-range parallelism, inverted batch bounds,
//! empty shard sets, or malformed DSNs reject the whole file. The validated
//! config converts into the engine's coordinator configuration and the
//! static topology snapshot.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use shardflow_core::ShardId;
use shardflow_core::ShardInfo;
use shardflow_core::StoreClass;
use shardflow_core::TopologySnapshot;
use shardflow_core::TopologyVersion;
use shardflow_engine::BatchTuning;
use shardflow_engine::CoordinatorConfig;
use shardflow_engine::LockConfig;
use shardflow_engine::RetryPolicy;
use shardflow_engine::RollbackPolicy;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "shardflow.toml";
/// Environment variable used to override the config path.
pub(crate) const CONFIG_ENV_VAR: &str = "SHARDFLOW_CONFIG";
/// Maximum configuration file size in bytes.
pub(crate) const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum per-store-class parallelism.
pub(crate) const MAX_PARALLELISM: usize = 256;
/// Maximum configured batch size.
pub(crate) const MAX_BATCH_SIZE: usize = 1_000_000;
/// Minimum lock TTL in milliseconds.
pub(crate) const MIN_LOCK_TTL_MS: u64 = 1_000;
/// Maximum lock TTL in milliseconds.
pub(crate) const MAX_LOCK_TTL_MS: u64 = 600_000;
/// Maximum retry attempts.
pub(crate) const MAX_RETRY_ATTEMPTS: u32 = 16;
/// Maximum shards per store class.
pub(crate) const MAX_SHARDS_PER_CLASS: usize = 1_024;
/// Maximum DSN length.
pub(crate) const MAX_DSN_LENGTH: usize = 4_096;
/// Default per-store-class parallelism.
const DEFAULT_PARALLELISM: usize = 10;
/// Default batch size.
const DEFAULT_BATCH: usize = 1_000;
/// Default minimum batch size.
const DEFAULT_BATCH_MIN: usize = 50;
/// Default maximum batch size.
const DEFAULT_BATCH_MAX: usize = 5_000;
/// Default lock TTL in milliseconds.
const DEFAULT_LOCK_TTL_MS: u64 = 30_000;
/// Default lock reaping grace in milliseconds.
const DEFAULT_LOCK_GRACE_MS: u64 = 5_000;
/// Default retry attempts.
const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default retry backoff base in milliseconds.
const DEFAULT_RETRY_BASE_MS: u64 = 100;
/// Default retry backoff cap in milliseconds.
const DEFAULT_RETRY_CAP_MS: u64 = 5_000;
/// Default retry backoff growth factor.
const DEFAULT_RETRY_FACTOR: f64 = 1.5;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the file failed.
    #[error("config read failure for {path:?}: {message}")]
    Io {
        /// Attempted path.
        path: PathBuf,
        /// Underlying message.
        message: String,
    },
    /// The file exceeds the size limit.
    #[error("config file {path:?} exceeds {MAX_CONFIG_FILE_SIZE} bytes")]
    TooLarge {
        /// Offending path.
        path: PathBuf,
    },
    /// TOML parsing failed.
    #[error("config parse failure: {0}")]
    Parse(String),
    /// A field failed validation.
    #[error("invalid config: {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Violated constraint.
        reason: String,
    },
}

// ============================================================================
// SECTION: Sections
// ============================================================================

/// Topology source selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologySource {
    /// Shards enumerated from this file.
    #[default]
    Static,
    /// Shards resolved by an external discovery service.
    Discovery,
}

/// Event bus backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventBusKind {
    /// Channel-style broker backend.
    #[default]
    BrokerA,
    /// Log-style broker backend.
    BrokerB,
}

/// Status store backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "backend")]
pub enum StatusStoreSection {
    /// In-memory status store (tests and demos).
    Memory,
    /// Durable sqlite status store.
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
}

impl Default for StatusStoreSection {
    fn default() -> Self {
        Self::Memory
    }
}

/// Engine tuning section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Concurrent executors per store class.
    #[serde(default = "default_parallelism")]
    pub per_store_class_parallelism: usize,
    /// Initial batch size.
    #[serde(default = "default_batch")]
    pub default_batch: usize,
    /// Minimum batch size.
    #[serde(default = "default_batch_min")]
    pub batch_min: usize,
    /// Maximum batch size.
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,
    /// Lock lease TTL in milliseconds.
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    /// Lock reaping grace in milliseconds.
    #[serde(default = "default_lock_grace_ms")]
    pub lock_grace_ms: u64,
    /// Rollback policy.
    #[serde(default = "default_rollback_policy")]
    pub rollback_policy: RollbackPolicy,
    /// Maximum retry attempts per step-level operation.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Retry backoff base in milliseconds.
    #[serde(default = "default_retry_base_ms")]
    pub retry_backoff_base_ms: u64,
    /// Retry backoff cap in milliseconds.
    #[serde(default = "default_retry_cap_ms")]
    pub retry_backoff_cap_ms: u64,
    /// Retry backoff growth factor.
    #[serde(default = "default_retry_factor")]
    pub retry_backoff_factor: f64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            per_store_class_parallelism: DEFAULT_PARALLELISM,
            default_batch: DEFAULT_BATCH,
            batch_min: DEFAULT_BATCH_MIN,
            batch_max: DEFAULT_BATCH_MAX,
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
            lock_grace_ms: DEFAULT_LOCK_GRACE_MS,
            rollback_policy: RollbackPolicy::Compensate,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_base_ms: DEFAULT_RETRY_BASE_MS,
            retry_backoff_cap_ms: DEFAULT_RETRY_CAP_MS,
            retry_backoff_factor: DEFAULT_RETRY_FACTOR,
        }
    }
}

/// Topology section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologySection {
    /// Where shards come from.
    #[serde(default)]
    pub source: TopologySource,
}

/// One configured shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    /// Shard identifier.
    pub shard_id: String,
    /// Backend connection string.
    pub dsn: String,
}

/// Per-class shard connection lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoresSection {
    /// Document-class shards.
    #[serde(default)]
    pub document: Vec<ShardEntry>,
    /// Relational-class shards.
    #[serde(default)]
    pub relational: Vec<ShardEntry>,
}

/// Event bus section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusSection {
    /// Selected backend.
    #[serde(default)]
    pub kind: EventBusKind,
}

// ============================================================================
// SECTION: Configuration Root
// ============================================================================

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardflowConfig {
    /// Engine tuning.
    #[serde(default)]
    pub engine: EngineSection,
    /// Topology source.
    #[serde(default)]
    pub topology: TopologySection,
    /// Shard connections per store class.
    #[serde(default)]
    pub stores: StoresSection,
    /// Event bus backend.
    #[serde(default)]
    pub event_bus: EventBusSection,
    /// Status store backend.
    #[serde(default)]
    pub status_store: StatusStoreSection,
}

impl ShardflowConfig {
    /// Loads configuration from an explicit path, the `SHARDFLOW_CONFIG`
    /// environment variable, or the default filename, in that order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on read, parse, or validation failure.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map_or_else(
            || env::var(CONFIG_ENV_VAR).map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_NAME), PathBuf::from),
            Path::to_path_buf,
        );
        let bytes = fs::read(&path).map_err(|err| ConfigError::Io {
            path: path.clone(),
            message: err.to_string(),
        })?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::TooLarge {
                path,
            });
        }
        let text = String::from_utf8(bytes).map_err(|err| ConfigError::Parse(err.to_string()))?;
        Self::parse(&text)
    }

    /// Parses and validates a configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on parse or validation failure.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the whole document fail-closed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first violated field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;
        if engine.per_store_class_parallelism == 0
            || engine.per_store_class_parallelism > MAX_PARALLELISM
        {
            return Err(ConfigError::Invalid {
                field: "engine.per_store_class_parallelism",
                reason: format!(
                    "must be within 1..={MAX_PARALLELISM}, got {}",
                    engine.per_store_class_parallelism
                ),
            });
        }
        if engine.batch_min == 0 {
            return Err(ConfigError::Invalid {
                field: "engine.batch_min",
                reason: "must be at least 1".to_string(),
            });
        }
        if engine.batch_min > engine.batch_max || engine.batch_max > MAX_BATCH_SIZE {
            return Err(ConfigError::Invalid {
                field: "engine.batch_max",
                reason: format!(
                    "bounds must satisfy batch_min <= batch_max <= {MAX_BATCH_SIZE}, got ({}, {})",
                    engine.batch_min, engine.batch_max
                ),
            });
        }
        if engine.default_batch < engine.batch_min || engine.default_batch > engine.batch_max {
            return Err(ConfigError::Invalid {
                field: "engine.default_batch",
                reason: format!(
                    "must lie within batch bounds ({}, {}), got {}",
                    engine.batch_min, engine.batch_max, engine.default_batch
                ),
            });
        }
        if engine.lock_ttl_ms < MIN_LOCK_TTL_MS || engine.lock_ttl_ms > MAX_LOCK_TTL_MS {
            return Err(ConfigError::Invalid {
                field: "engine.lock_ttl_ms",
                reason: format!(
                    "must be within {MIN_LOCK_TTL_MS}..={MAX_LOCK_TTL_MS}, got {}",
                    engine.lock_ttl_ms
                ),
            });
        }
        if engine.max_retries == 0 || engine.max_retries > MAX_RETRY_ATTEMPTS {
            return Err(ConfigError::Invalid {
                field: "engine.max_retries",
                reason: format!("must be within 1..={MAX_RETRY_ATTEMPTS}, got {}", engine.max_retries),
            });
        }
        if !engine.retry_backoff_factor.is_finite() || engine.retry_backoff_factor < 1.0 {
            return Err(ConfigError::Invalid {
                field: "engine.retry_backoff_factor",
                reason: format!("must be a finite factor >= 1.0, got {}", engine.retry_backoff_factor),
            });
        }

        if self.topology.source == TopologySource::Static
            && self.stores.document.is_empty()
            && self.stores.relational.is_empty()
        {
            return Err(ConfigError::Invalid {
                field: "stores",
                reason: "static topology requires at least one shard".to_string(),
            });
        }
        validate_shards("stores.document", &self.stores.document)?;
        validate_shards("stores.relational", &self.stores.relational)?;
        Ok(())
    }

    /// Converts the engine section into the coordinator configuration.
    #[must_use]
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let engine = &self.engine;
        CoordinatorConfig {
            per_store_class_parallelism: engine.per_store_class_parallelism,
            max_inflight_batches: engine.per_store_class_parallelism,
            tuning: BatchTuning {
                min_batch: engine.batch_min,
                max_batch: engine.batch_max,
                initial_batch: engine.default_batch,
                ..BatchTuning::default()
            },
            locks: LockConfig {
                ttl_ms: engine.lock_ttl_ms,
                grace_ms: engine.lock_grace_ms,
            },
            retry: RetryPolicy {
                max_attempts: engine.max_retries,
                base_ms: engine.retry_backoff_base_ms,
                cap_ms: engine.retry_backoff_cap_ms,
                backoff_factor: engine.retry_backoff_factor,
                ..RetryPolicy::default()
            },
            rollback_policy: engine.rollback_policy,
        }
    }

    /// Builds the version-one static topology snapshot.
    ///
    /// Discovery-backed deployments install their own provider instead.
    #[must_use]
    pub fn topology_snapshot(&self) -> TopologySnapshot {
        let mut shards = BTreeMap::new();
        if !self.stores.document.is_empty() {
            shards.insert(StoreClass::Document, shard_infos(&self.stores.document));
        }
        if !self.stores.relational.is_empty() {
            shards.insert(StoreClass::Relational, shard_infos(&self.stores.relational));
        }
        TopologySnapshot::new(TopologyVersion::new(1), shards)
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Validates one shard list: bounds, unique ids, well-formed DSNs.
fn validate_shards(field: &'static str, shards: &[ShardEntry]) -> Result<(), ConfigError> {
    if shards.len() > MAX_SHARDS_PER_CLASS {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("at most {MAX_SHARDS_PER_CLASS} shards, got {}", shards.len()),
        });
    }
    let mut seen = BTreeSet::new();
    for shard in shards {
        if shard.shard_id.is_empty() {
            return Err(ConfigError::Invalid {
                field,
                reason: "shard_id must not be empty".to_string(),
            });
        }
        if !seen.insert(shard.shard_id.as_str()) {
            return Err(ConfigError::Invalid {
                field,
                reason: format!("duplicate shard_id {}", shard.shard_id),
            });
        }
        if shard.dsn.is_empty() || shard.dsn.len() > MAX_DSN_LENGTH {
            return Err(ConfigError::Invalid {
                field,
                reason: format!("dsn for {} must be 1..={MAX_DSN_LENGTH} bytes", shard.shard_id),
            });
        }
    }
    Ok(())
}

/// Converts shard entries into topology descriptors.
fn shard_infos(entries: &[ShardEntry]) -> Vec<ShardInfo> {
    entries
        .iter()
        .map(|entry| ShardInfo {
            shard_id: ShardId::new(entry.shard_id.clone()),
            dsn: entry.dsn.clone(),
        })
        .collect()
}

/// Returns the default parallelism.
const fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

/// Returns the default batch size.
const fn default_batch() -> usize {
    DEFAULT_BATCH
}

/// Returns the default minimum batch size.
const fn default_batch_min() -> usize {
    DEFAULT_BATCH_MIN
}

/// Returns the default maximum batch size.
const fn default_batch_max() -> usize {
    DEFAULT_BATCH_MAX
}

/// Returns the default lock TTL.
const fn default_lock_ttl_ms() -> u64 {
    DEFAULT_LOCK_TTL_MS
}

/// Returns the default lock grace.
const fn default_lock_grace_ms() -> u64 {
    DEFAULT_LOCK_GRACE_MS
}

/// Returns the default rollback policy.
const fn default_rollback_policy() -> RollbackPolicy {
    RollbackPolicy::Compensate
}

/// Returns the default retry attempts.
const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Returns the default retry backoff base.
const fn default_retry_base_ms() -> u64 {
    DEFAULT_RETRY_BASE_MS
}

/// Returns the default retry backoff cap.
const fn default_retry_cap_ms() -> u64 {
    DEFAULT_RETRY_CAP_MS
}

/// Returns the default retry backoff factor.
const fn default_retry_factor() -> f64 {
    DEFAULT_RETRY_FACTOR
}
