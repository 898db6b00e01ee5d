// shardflow-core/src/driver/memory.rs
// ============================================================================
// Module: Shardflow In-Memory Store Driver
// Description: Reference driver exercising the full store driver contract.
// Purpose: Provide a deterministic backend for engine tests and local demos.
// Dependencies: async-trait, serde_json, crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! The in-memory driver models one sharded backend: per-shard collections of
//! records keyed by id, backend-native schema markers for already-applied
//! detection, and injectable health and failure behavior. Upserts are keyed
//! by record id, so duplicate batch replay after a crash is a no-op, exactly
//! as the contract requires of production backends.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::identifiers::CollectionName;
use crate::core::identifiers::ShardId;
use crate::core::identifiers::StreamCursor;
use crate::core::record::Record;
use crate::core::request::SchemaChange;
use crate::core::topology::ShardInfo;
use crate::interfaces::DriverConn;
use crate::interfaces::DriverError;
use crate::interfaces::HealthStatus;
use crate::interfaces::RecordBatch;
use crate::interfaces::SchemaOutcome;
use crate::interfaces::StoreDriver;
use crate::interfaces::TxnSupport;

// ============================================================================
// SECTION: Shard State
// ============================================================================

/// Data held by one in-memory shard.
#[derive(Debug, Default)]
struct ShardData {
    /// Collections of records keyed by record id.
    collections: BTreeMap<String, BTreeMap<String, Value>>,
    /// Applied schema markers: `(collection, change_id)`.
    schema_markers: BTreeSet<(String, String)>,
    /// Injected health status.
    health: Option<HealthStatus>,
    /// Remaining injected transient failures for `apply_batch`.
    apply_faults: u32,
}

/// Shared driver state across connections.
#[derive(Debug, Default)]
struct DriverState {
    /// Shard data by shard id.
    shards: BTreeMap<String, ShardData>,
}

// ============================================================================
// SECTION: In-Memory Driver
// ============================================================================

/// In-memory store driver for one store class.
#[derive(Debug, Clone)]
pub struct InMemoryStoreDriver {
    /// Shared state across connections.
    state: Arc<Mutex<DriverState>>,
    /// Transaction capability reported by connections.
    txn_support: TxnSupport,
}

impl Default for InMemoryStoreDriver {
    fn default() -> Self {
        Self::new(TxnSupport::SingleBatch)
    }
}

impl InMemoryStoreDriver {
    /// Creates a driver reporting the given transaction capability.
    #[must_use]
    pub fn new(txn_support: TxnSupport) -> Self {
        Self {
            state: Arc::new(Mutex::new(DriverState::default())),
            txn_support,
        }
    }

    /// Seeds a collection on a shard with records.
    pub fn seed(&self, shard_id: &ShardId, collection: &CollectionName, records: Vec<Record>) {
        if let Ok(mut state) = self.state.lock() {
            let shard = state.shards.entry(shard_id.as_str().to_string()).or_default();
            let coll = shard.collections.entry(collection.as_str().to_string()).or_default();
            for record in records {
                coll.insert(record.id, record.fields);
            }
        }
    }

    /// Replaces a collection's contents wholesale; used by snapshot-restore
    /// test doubles.
    pub fn replace_collection(
        &self,
        shard_id: &ShardId,
        collection: &CollectionName,
        records: Vec<Record>,
    ) {
        if let Ok(mut state) = self.state.lock() {
            let shard = state.shards.entry(shard_id.as_str().to_string()).or_default();
            let coll = shard.collections.entry(collection.as_str().to_string()).or_default();
            coll.clear();
            for record in records {
                coll.insert(record.id, record.fields);
            }
        }
    }

    /// Injects a health status for a shard.
    pub fn set_health(&self, shard_id: &ShardId, health: HealthStatus) {
        if let Ok(mut state) = self.state.lock() {
            state.shards.entry(shard_id.as_str().to_string()).or_default().health = Some(health);
        }
    }

    /// Injects `count` transient failures into the shard's `apply_batch`.
    pub fn inject_apply_faults(&self, shard_id: &ShardId, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.shards.entry(shard_id.as_str().to_string()).or_default().apply_faults = count;
        }
    }

    /// Returns all records of a collection on a shard, in id order.
    #[must_use]
    pub fn dump(&self, shard_id: &ShardId, collection: &CollectionName) -> Vec<Record> {
        self.state.lock().map_or_else(
            |_| Vec::new(),
            |state| {
                state
                    .shards
                    .get(shard_id.as_str())
                    .and_then(|shard| shard.collections.get(collection.as_str()))
                    .map(|coll| {
                        coll.iter()
                            .map(|(id, fields)| Record::new(id.clone(), fields.clone()))
                            .collect()
                    })
                    .unwrap_or_default()
            },
        )
    }

    /// Returns true when the schema marker is present on the shard.
    #[must_use]
    pub fn schema_applied(
        &self,
        shard_id: &ShardId,
        collection: &CollectionName,
        change_id: &str,
    ) -> bool {
        self.state.lock().is_ok_and(|state| {
            state.shards.get(shard_id.as_str()).is_some_and(|shard| {
                shard
                    .schema_markers
                    .contains(&(collection.as_str().to_string(), change_id.to_string()))
            })
        })
    }
}

#[async_trait]
impl StoreDriver for InMemoryStoreDriver {
    async fn open(&self, shard: &ShardInfo) -> Result<Box<dyn DriverConn>, DriverError> {
        let health = self
            .state
            .lock()
            .map_err(|_| DriverError::Connection("driver state mutex poisoned".to_string()))?
            .shards
            .get(shard.shard_id.as_str())
            .and_then(|data| data.health)
            .unwrap_or(HealthStatus::Ok);
        if health == HealthStatus::Down {
            return Err(DriverError::Connection(format!(
                "shard {} is down",
                shard.shard_id
            )));
        }
        Ok(Box::new(InMemoryConn {
            state: Arc::clone(&self.state),
            shard_id: shard.shard_id.clone(),
            txn_support: self.txn_support,
            pending: None,
        }))
    }
}

// ============================================================================
// SECTION: In-Memory Connection
// ============================================================================

/// One connection to an in-memory shard.
struct InMemoryConn {
    /// Shared driver state.
    state: Arc<Mutex<DriverState>>,
    /// Connected shard.
    shard_id: ShardId,
    /// Reported transaction capability.
    txn_support: TxnSupport,
    /// Writes buffered inside an open transaction.
    pending: Option<Vec<(String, Vec<Record>)>>,
}

impl InMemoryConn {
    /// Locks the shared state.
    fn lock(&self) -> Result<MutexGuard<'_, DriverState>, DriverError> {
        self.state
            .lock()
            .map_err(|_| DriverError::Connection("driver state mutex poisoned".to_string()))
    }

    /// Applies records to a collection, upserting by id.
    fn apply_now(
        state: &mut DriverState,
        shard_id: &ShardId,
        collection: &str,
        records: &[Record],
    ) -> u64 {
        let shard = state.shards.entry(shard_id.as_str().to_string()).or_default();
        let coll = shard.collections.entry(collection.to_string()).or_default();
        for record in records {
            coll.insert(record.id.clone(), record.fields.clone());
        }
        records.len() as u64
    }
}

#[async_trait]
impl DriverConn for InMemoryConn {
    fn txn_support(&self) -> TxnSupport {
        self.txn_support
    }

    async fn health(&mut self) -> HealthStatus {
        self.lock().map_or(HealthStatus::Down, |state| {
            state
                .shards
                .get(self.shard_id.as_str())
                .and_then(|shard| shard.health)
                .unwrap_or(HealthStatus::Ok)
        })
    }

    async fn apply_schema(
        &mut self,
        collection: &CollectionName,
        change: &SchemaChange,
    ) -> Result<SchemaOutcome, DriverError> {
        let mut state = self.lock()?;
        let shard = state.shards.entry(self.shard_id.as_str().to_string()).or_default();
        let marker = (collection.as_str().to_string(), change.change_id.clone());
        if shard.schema_markers.contains(&marker) {
            return Ok(SchemaOutcome::AlreadyApplied);
        }
        shard.collections.entry(collection.as_str().to_string()).or_default();
        shard.schema_markers.insert(marker);
        Ok(SchemaOutcome::Applied)
    }

    async fn revert_schema(
        &mut self,
        collection: &CollectionName,
        change: &SchemaChange,
    ) -> Result<SchemaOutcome, DriverError> {
        if change.down.is_none() {
            return Err(DriverError::Unsupported(format!(
                "schema change {} has no down definition",
                change.change_id
            )));
        }
        let mut state = self.lock()?;
        let shard = state.shards.entry(self.shard_id.as_str().to_string()).or_default();
        let marker = (collection.as_str().to_string(), change.change_id.clone());
        if shard.schema_markers.remove(&marker) {
            Ok(SchemaOutcome::Applied)
        } else {
            Ok(SchemaOutcome::AlreadyApplied)
        }
    }

    async fn stream_batch(
        &mut self,
        collection: &CollectionName,
        cursor: Option<&StreamCursor>,
        size: usize,
    ) -> Result<RecordBatch, DriverError> {
        let state = self.lock()?;
        let records: Vec<Record> = state
            .shards
            .get(self.shard_id.as_str())
            .and_then(|shard| shard.collections.get(collection.as_str()))
            .map(|coll| {
                let lower = cursor.map_or(Bound::Unbounded, |cursor| {
                    Bound::Excluded(cursor.as_str().to_string())
                });
                coll.range((lower, Bound::Unbounded))
                    .take(size.max(1))
                    .map(|(id, fields)| Record::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let next_cursor = if records.len() < size.max(1) {
            None
        } else {
            records.last().map(|record| StreamCursor::new(record.id.clone()))
        };
        Ok(RecordBatch {
            records,
            next_cursor,
        })
    }

    async fn apply_batch(
        &mut self,
        collection: &CollectionName,
        records: &[Record],
    ) -> Result<u64, DriverError> {
        if let Some(pending) = self.pending.as_mut() {
            pending.push((collection.as_str().to_string(), records.to_vec()));
            return Ok(records.len() as u64);
        }
        let mut state = self.lock()?;
        let shard = state.shards.entry(self.shard_id.as_str().to_string()).or_default();
        if shard.apply_faults > 0 {
            shard.apply_faults -= 1;
            return Err(DriverError::RetryLater("injected apply fault".to_string()));
        }
        Ok(Self::apply_now(&mut state, &self.shard_id, collection.as_str(), records))
    }

    async fn begin(&mut self) -> Result<(), DriverError> {
        match self.txn_support {
            TxnSupport::Multi => {
                self.pending = Some(Vec::new());
                Ok(())
            }
            TxnSupport::SingleBatch => Err(DriverError::Unsupported(
                "backend has no multi-statement transactions".to_string(),
            )),
        }
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| DriverError::Rejected("commit without open transaction".to_string()))?;
        let mut state = self.lock()?;
        let shard = state.shards.entry(self.shard_id.as_str().to_string()).or_default();
        if shard.apply_faults > 0 {
            shard.apply_faults -= 1;
            return Err(DriverError::RetryLater("injected commit fault".to_string()));
        }
        for (collection, records) in pending {
            Self::apply_now(&mut state, &self.shard_id, &collection, &records);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        if self.pending.take().is_none() {
            return Err(DriverError::Rejected("rollback without open transaction".to_string()));
        }
        Ok(())
    }

    async fn count(&mut self, collection: &CollectionName) -> Result<u64, DriverError> {
        let state = self.lock()?;
        Ok(state
            .shards
            .get(self.shard_id.as_str())
            .and_then(|shard| shard.collections.get(collection.as_str()))
            .map_or(0, |coll| coll.len() as u64))
    }

    async fn fetch(
        &mut self,
        collection: &CollectionName,
        ids: &[String],
    ) -> Result<Vec<Record>, DriverError> {
        let state = self.lock()?;
        let coll = state
            .shards
            .get(self.shard_id.as_str())
            .and_then(|shard| shard.collections.get(collection.as_str()));
        Ok(ids
            .iter()
            .filter_map(|id| {
                coll.and_then(|coll| coll.get(id)).map(|fields| Record::new(id.clone(), fields.clone()))
            })
            .collect())
    }

    async fn sample(
        &mut self,
        collection: &CollectionName,
        limit: usize,
    ) -> Result<Vec<Record>, DriverError> {
        let state = self.lock()?;
        Ok(state
            .shards
            .get(self.shard_id.as_str())
            .and_then(|shard| shard.collections.get(collection.as_str()))
            .map(|coll| {
                coll.iter()
                    .take(limit)
                    .map(|(id, fields)| Record::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn field_values(
        &mut self,
        collection: &CollectionName,
        field: &str,
    ) -> Result<Vec<Value>, DriverError> {
        let state = self.lock()?;
        Ok(state
            .shards
            .get(self.shard_id.as_str())
            .and_then(|shard| shard.collections.get(collection.as_str()))
            .map(|coll| {
                coll.values().filter_map(|fields| fields.get(field).cloned()).collect()
            })
            .unwrap_or_default())
    }
}
