// shardflow-core/src/core/transform.rs
// ============================================================================
// Module: Shardflow Transformer Registry
// Description: Named pure record transformations with optional inverses.
// Purpose: Resolve data-step transformations registered at admission time.
// Dependencies: serde_json, thiserror, crate::core
// ============================================================================

//! ## Overview
//! Data steps reference transformers by identifier. A transformer is a pure
//! function from a record to a transformed record (or to nothing, dropping
//! the record), optionally paired with an inverse used for compensating
//! rollback. Registration happens when the coordinator is assembled, never by
//! runtime lookup from module paths.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::core::identifiers::TransformId;
use crate::core::record::Record;

// ============================================================================
// SECTION: Transformer
// ============================================================================

/// Pure record transformation.
///
/// Returning `Ok(None)` drops the record. Errors are logical and never
/// retried.
pub type TransformFn = Arc<dyn Fn(&Record) -> Result<Option<Record>, TransformError> + Send + Sync>;

/// Registered transformer with an optional inverse.
#[derive(Clone)]
pub struct Transformer {
    /// Forward transformation.
    pub apply: TransformFn,
    /// Optional inverse used for compensating rollback.
    pub inverse: Option<TransformFn>,
}

impl fmt::Debug for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformer").field("has_inverse", &self.inverse.is_some()).finish()
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Transformer errors.
#[derive(Debug, Error)]
pub enum TransformError {
    /// Transformer rejected the record.
    #[error("transformer rejected record {record_id}: {reason}")]
    Rejected {
        /// Rejected record identifier.
        record_id: String,
        /// Rejection reason.
        reason: String,
    },
    /// No transformer is registered under the identifier.
    #[error("unknown transformer: {0}")]
    Unknown(String),
    /// The transformer has no registered inverse.
    #[error("transformer {0} has no inverse")]
    NoInverse(String),
}

// ============================================================================
// SECTION: Registry
// ============================================================================

/// Registry of named transformers.
///
/// # Invariants
/// - Read-only after coordinator assembly; admission never mutates it.
#[derive(Debug, Default, Clone)]
pub struct TransformerRegistry {
    /// Transformers by identifier.
    transformers: BTreeMap<String, Transformer>,
}

impl TransformerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transformer without an inverse.
    pub fn register(&mut self, id: TransformId, apply: TransformFn) {
        self.transformers.insert(
            id.as_str().to_string(),
            Transformer {
                apply,
                inverse: None,
            },
        );
    }

    /// Registers a transformer with its inverse.
    pub fn register_with_inverse(&mut self, id: TransformId, apply: TransformFn, inverse: TransformFn) {
        self.transformers.insert(
            id.as_str().to_string(),
            Transformer {
                apply,
                inverse: Some(inverse),
            },
        );
    }

    /// Resolves a transformer by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::Unknown`] when no transformer is registered.
    pub fn get(&self, id: &TransformId) -> Result<&Transformer, TransformError> {
        self.transformers
            .get(id.as_str())
            .ok_or_else(|| TransformError::Unknown(id.as_str().to_string()))
    }

    /// Resolves the inverse of a transformer.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::Unknown`] when no transformer is registered
    /// and [`TransformError::NoInverse`] when the transformer has no inverse.
    pub fn inverse(&self, id: &TransformId) -> Result<TransformFn, TransformError> {
        let transformer = self.get(id)?;
        transformer
            .inverse
            .clone()
            .ok_or_else(|| TransformError::NoInverse(id.as_str().to_string()))
    }

    /// Returns true when the transformer exists and has an inverse.
    #[must_use]
    pub fn has_inverse(&self, id: &TransformId) -> bool {
        self.transformers.get(id.as_str()).is_some_and(|t| t.inverse.is_some())
    }

    /// Returns true when the transformer exists.
    #[must_use]
    pub fn contains(&self, id: &TransformId) -> bool {
        self.transformers.contains_key(id.as_str())
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn add_version_field() -> TransformFn {
        Arc::new(|record: &Record| {
            let mut fields = record.fields.clone();
            if let Some(map) = fields.as_object_mut() {
                map.insert("version".to_string(), json!(2));
            }
            Ok(Some(Record::new(record.id.clone(), fields)))
        })
    }

    /// Verifies registration and lookup round-trips.
    #[test]
    fn registry_resolves_registered_transformer() {
        let mut registry = TransformerRegistry::new();
        registry.register(TransformId::new("add-version"), add_version_field());

        let transformer = registry.get(&TransformId::new("add-version")).unwrap();
        let record = Record::new("r1", json!({"body": "hi"}));
        let out = (transformer.apply)(&record).unwrap().unwrap();
        assert_eq!(out.fields["version"], json!(2));
    }

    /// Verifies unknown transformers fail closed.
    #[test]
    fn registry_rejects_unknown_transformer() {
        let registry = TransformerRegistry::new();
        let err = registry.get(&TransformId::new("missing")).unwrap_err();
        assert!(matches!(err, TransformError::Unknown(_)));
    }

    /// Verifies inverse lookup distinguishes missing inverse from missing transformer.
    #[test]
    fn registry_reports_missing_inverse() {
        let mut registry = TransformerRegistry::new();
        registry.register(TransformId::new("one-way"), add_version_field());

        assert!(!registry.has_inverse(&TransformId::new("one-way")));
        let result = registry.inverse(&TransformId::new("one-way"));
        assert!(matches!(result, Err(TransformError::NoInverse(_))));
    }
}
