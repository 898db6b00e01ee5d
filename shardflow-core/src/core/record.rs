// shardflow-core/src/core/record.rs
// ============================================================================
// Module: Shardflow Record Model
// Description: Backend-neutral record representation for data steps.
// Purpose: Carry identified documents between drivers and transformers.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! Data steps stream identified records from a shard, transform them, and
//! apply them back. Records are backend-neutral: a document store maps them
//! to documents, a relational store to rows keyed by primary key. Upserts are
//! always keyed by `id` so duplicate batch replay stays idempotent.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

// ============================================================================
// SECTION: Record
// ============================================================================

/// Identified record streamed from and applied to a shard.
///
/// # Invariants
/// - `id` is unique within its collection on one shard.
/// - `fields` is an opaque JSON document interpreted only by transformers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Record identifier (primary key or document id).
    pub id: String,
    /// Record body.
    pub fields: Value,
}

impl Record {
    /// Creates a new record.
    #[must_use]
    pub fn new(id: impl Into<String>, fields: Value) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}
