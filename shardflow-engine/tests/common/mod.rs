// shardflow-engine/tests/common/mod.rs
// ============================================================================
// Module: Engine Test Harness
// Description: Shared fixtures for engine scenario tests.
// Purpose: Assemble a coordinator over the in-memory backends with
//          deterministic clocks and small batches.
// Dependencies: shardflow-core, shardflow-engine
// ============================================================================
//! ## Overview
//! Builds a complete coordinator over the in-memory status store, in-memory
//! driver, and static topology, with test-sized batch tuning and a logical
//! clock. Tests register transformers and backup doubles per scenario.

#![allow(
    dead_code,
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Shared test fixtures; not every test uses every helper."
)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use shardflow_core::BackupCatalog;
use shardflow_core::CollectionName;
use shardflow_core::ConcurrencyHints;
use shardflow_core::EventKind;
use shardflow_core::IdempotencyKey;
use shardflow_core::InMemoryStatusStore;
use shardflow_core::InMemoryStoreDriver;
use shardflow_core::MigrationId;
use shardflow_core::MigrationRequest;
use shardflow_core::NoBackupCatalog;
use shardflow_core::NullPublisher;
use shardflow_core::Record;
use shardflow_core::RequestId;
use shardflow_core::SchemaChange;
use shardflow_core::ShardId;
use shardflow_core::ShardInfo;
use shardflow_core::SnapshotId;
use shardflow_core::StaticTopology;
use shardflow_core::StepId;
use shardflow_core::StepPayload;
use shardflow_core::StepScope;
use shardflow_core::StepSpec;
use shardflow_core::StoreClass;
use shardflow_core::TopologySnapshot;
use shardflow_core::TopologyVersion;
use shardflow_core::TransformFn;
use shardflow_core::TransformId;
use shardflow_core::TransformerRegistry;
use shardflow_core::TxnSupport;
use shardflow_core::ValidationSpec;
use shardflow_core::interfaces::BackupError;
use shardflow_core::interfaces::EventPublisher;
use shardflow_engine::BatchTuning;
use shardflow_engine::Coordinator;
use shardflow_engine::CoordinatorConfig;
use shardflow_engine::LockConfig;
use shardflow_engine::LogicalClock;
use shardflow_engine::MigrationService;
use shardflow_engine::RetryPolicy;
use shardflow_engine::RollbackPolicy;

// ============================================================================
// SECTION: Harness
// ============================================================================

/// Assembled coordinator with handles into its backends.
pub struct Harness {
    /// Status store backing the coordinator.
    pub status: InMemoryStatusStore,
    /// Store driver backing the document class.
    pub driver: InMemoryStoreDriver,
    /// Topology provider.
    pub topology: StaticTopology,
    /// Deterministic clock.
    pub clock: Arc<LogicalClock>,
    /// Service surface over the coordinator.
    pub service: MigrationService,
}

/// Harness builder with per-test knobs.
pub struct HarnessBuilder {
    shards: usize,
    config: CoordinatorConfig,
    registry: TransformerRegistry,
    backup: Arc<dyn BackupCatalog>,
    publisher: Arc<dyn EventPublisher>,
    txn_support: TxnSupport,
}

impl HarnessBuilder {
    /// Starts a builder for a document-class topology with `shards` shards.
    pub fn new(shards: usize) -> Self {
        Self {
            shards,
            config: test_config(),
            registry: TransformerRegistry::new(),
            backup: Arc::new(NoBackupCatalog),
            publisher: Arc::new(NullPublisher),
            txn_support: TxnSupport::SingleBatch,
        }
    }

    /// Overrides the coordinator configuration.
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a forward-only transformer.
    pub fn transform(mut self, id: &str, apply: TransformFn) -> Self {
        self.registry.register(TransformId::new(id), apply);
        self
    }

    /// Registers a transformer with its inverse.
    pub fn transform_with_inverse(mut self, id: &str, apply: TransformFn, inverse: TransformFn) -> Self {
        self.registry.register_with_inverse(TransformId::new(id), apply, inverse);
        self
    }

    /// Installs a backup catalog double.
    pub fn backup(mut self, backup: Arc<dyn BackupCatalog>) -> Self {
        self.backup = backup;
        self
    }

    /// Installs an event publisher double.
    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Assembles the harness.
    pub fn build(self) -> Harness {
        let driver = InMemoryStoreDriver::new(self.txn_support);
        self.build_with_driver(driver)
    }

    /// Assembles the harness over an existing driver instance, so doubles
    /// like the snapshot backup can share it.
    pub fn build_with_driver(self, driver: InMemoryStoreDriver) -> Harness {
        let status = InMemoryStatusStore::new();
        let topology = StaticTopology::new(snapshot(1, self.shards));
        let clock = Arc::new(LogicalClock::new());

        let mut drivers: BTreeMap<StoreClass, Arc<dyn shardflow_core::StoreDriver>> =
            BTreeMap::new();
        drivers.insert(StoreClass::Document, Arc::new(driver.clone()));

        let coordinator = Coordinator::new(
            Arc::new(status.clone()),
            drivers,
            Arc::new(topology.clone()),
            Arc::new(self.registry),
            self.backup,
            self.publisher,
            clock.clone(),
            self.config,
        );
        Harness {
            status,
            driver,
            topology,
            clock,
            service: MigrationService::new(Arc::new(coordinator)),
        }
    }
}

/// Test-sized coordinator configuration: small batches, short leases.
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        per_store_class_parallelism: 4,
        max_inflight_batches: 4,
        tuning: BatchTuning {
            min_batch: 2,
            max_batch: 50,
            initial_batch: 10,
            adjust_window: 4,
            high_watermark_ms: 750,
            low_watermark_ms: 200,
            grow_factor: 1.5,
        },
        locks: LockConfig {
            ttl_ms: 60_000,
            grace_ms: 0,
        },
        retry: RetryPolicy {
            max_attempts: 3,
            base_ms: 1,
            cap_ms: 5,
            contention_base_ms: 1,
            backoff_factor: 1.5,
        },
        rollback_policy: RollbackPolicy::Compensate,
    }
}

/// Builds a document-class snapshot with `shards` shards.
pub fn snapshot(version: u64, shards: usize) -> TopologySnapshot {
    let infos = (0..shards)
        .map(|index| ShardInfo {
            shard_id: ShardId::new(format!("shard-{index}")),
            dsn: format!("mem://shard-{index}"),
        })
        .collect();
    let mut map = BTreeMap::new();
    map.insert(StoreClass::Document, infos);
    TopologySnapshot::new(TopologyVersion::new(version), map)
}

// ============================================================================
// SECTION: Transformers
// ============================================================================

/// Idempotent transformer stamping `version: 2` on every record.
pub fn add_version() -> TransformFn {
    Arc::new(|record: &Record| {
        let mut fields = record.fields.clone();
        if let Some(map) = fields.as_object_mut() {
            map.insert("version".to_string(), json!(2));
        }
        Ok(Some(Record::new(record.id.clone(), fields)))
    })
}

/// Inverse of [`add_version`]: removes the `version` field.
pub fn remove_version() -> TransformFn {
    Arc::new(|record: &Record| {
        let mut fields = record.fields.clone();
        if let Some(map) = fields.as_object_mut() {
            map.remove("version");
        }
        Ok(Some(Record::new(record.id.clone(), fields)))
    })
}

/// Transformer dropping records whose `legacy` field is true.
pub fn drop_legacy() -> TransformFn {
    Arc::new(|record: &Record| {
        if record.fields.get("legacy").and_then(serde_json::Value::as_bool) == Some(true) {
            Ok(None)
        } else {
            Ok(Some(record.clone()))
        }
    })
}

// ============================================================================
// SECTION: Requests
// ============================================================================

/// A schema step over all shards, with a down definition.
pub fn schema_step(id: &str, collection: &str) -> StepSpec {
    StepSpec {
        step_id: StepId::new(id),
        collection: CollectionName::new(collection),
        scope: StepScope::AllShards,
        payload: StepPayload::Schema {
            change: SchemaChange {
                change_id: format!("{id}-change"),
                definition: json!({"add_field": "version"}),
                down: Some(json!({"drop_field": "version"})),
            },
        },
        depends_on: Vec::new(),
        reads: Vec::new(),
        writes: Vec::new(),
        estimated_items: None,
        deadline_ms: None,
    }
}

/// A data step over all shards running the named transformer.
pub fn data_step(id: &str, collection: &str, transform: &str) -> StepSpec {
    StepSpec {
        step_id: StepId::new(id),
        collection: CollectionName::new(collection),
        scope: StepScope::AllShards,
        payload: StepPayload::Data {
            transform: TransformId::new(transform),
        },
        depends_on: Vec::new(),
        reads: Vec::new(),
        writes: Vec::new(),
        estimated_items: None,
        deadline_ms: None,
    }
}

/// A request over the document class with the given steps.
pub fn request(id: &str, steps: Vec<StepSpec>) -> MigrationRequest {
    MigrationRequest {
        request_id: RequestId::new(id),
        name: format!("migration {id}"),
        store_class: StoreClass::Document,
        steps,
        depends_on: Vec::new(),
        concurrency: ConcurrencyHints::default(),
        idempotency_key: IdempotencyKey::new(format!("idem-{id}")),
        validation: ValidationSpec::default(),
        deadline_ms: None,
    }
}

/// Seeds `count` message records on a shard.
pub fn seed_messages(driver: &InMemoryStoreDriver, shard: &str, collection: &str, count: usize) {
    let records = (0..count)
        .map(|index| {
            Record::new(format!("rec-{index:04}"), json!({"body": format!("message {index}")}))
        })
        .collect();
    driver.seed(&ShardId::new(shard), &CollectionName::new(collection), records);
}

// ============================================================================
// SECTION: Doubles
// ============================================================================

/// Publisher that records every published event kind in order.
#[derive(Debug, Default, Clone)]
pub struct RecordingPublisher {
    /// Published `(migration id, kind)` pairs in publish order.
    pub published: Arc<Mutex<Vec<(String, EventKind)>>>,
}

impl EventPublisher for RecordingPublisher {
    fn publish(
        &self,
        record: &shardflow_core::EventRecord,
    ) -> Result<(), shardflow_core::PublishError> {
        if let Ok(mut published) = self.published.lock() {
            published.push((record.migration_id.as_str().to_string(), record.kind));
        }
        Ok(())
    }
}

/// Backup catalog double snapshotting collections out of the in-memory
/// driver.
pub struct SnapshotBackup {
    /// Driver the snapshots are taken from and restored into.
    driver: InMemoryStoreDriver,
    /// Captured snapshots keyed by snapshot id.
    snapshots: Mutex<BTreeMap<String, (ShardId, CollectionName, Vec<Record>)>>,
    /// When false, capture silently yields no snapshot.
    capture_works: bool,
}

impl SnapshotBackup {
    /// A catalog that captures and restores real snapshots.
    pub fn working(driver: InMemoryStoreDriver) -> Self {
        Self {
            driver,
            snapshots: Mutex::new(BTreeMap::new()),
            capture_works: true,
        }
    }

    /// A catalog that claims support but never yields snapshots.
    pub fn broken(driver: InMemoryStoreDriver) -> Self {
        Self {
            driver,
            snapshots: Mutex::new(BTreeMap::new()),
            capture_works: false,
        }
    }
}

#[async_trait]
impl BackupCatalog for SnapshotBackup {
    fn supports_capture(&self) -> bool {
        true
    }

    async fn capture(
        &self,
        migration_id: &MigrationId,
        step_id: &StepId,
        shard_id: &ShardId,
        collection: &CollectionName,
    ) -> Result<Option<SnapshotId>, BackupError> {
        if !self.capture_works {
            return Ok(None);
        }
        let key = format!("{migration_id}/{step_id}/{shard_id}");
        let records = self.driver.dump(shard_id, collection);
        self.snapshots
            .lock()
            .map_err(|_| BackupError::Catalog("snapshot mutex poisoned".to_string()))?
            .insert(key.clone(), (shard_id.clone(), collection.clone(), records));
        Ok(Some(SnapshotId::new(key)))
    }

    async fn find(
        &self,
        migration_id: &MigrationId,
        step_id: &StepId,
        shard_id: &ShardId,
    ) -> Result<Option<SnapshotId>, BackupError> {
        let key = format!("{migration_id}/{step_id}/{shard_id}");
        let found = self
            .snapshots
            .lock()
            .map_err(|_| BackupError::Catalog("snapshot mutex poisoned".to_string()))?
            .contains_key(&key);
        Ok(found.then(|| SnapshotId::new(key)))
    }

    async fn restore(
        &self,
        snapshot_id: &SnapshotId,
        _shard_id: &ShardId,
    ) -> Result<(), BackupError> {
        let snapshot = self
            .snapshots
            .lock()
            .map_err(|_| BackupError::Catalog("snapshot mutex poisoned".to_string()))?
            .get(snapshot_id.as_str())
            .cloned();
        let Some((shard_id, collection, records)) = snapshot else {
            return Err(BackupError::Catalog(format!("unknown snapshot {snapshot_id}")));
        };
        self.driver.replace_collection(&shard_id, &collection, records);
        Ok(())
    }
}
