//! Index metadata and the work descriptors passed between indexing phases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypesError;
use crate::etag::Etag;

/// How an index aggregates the mapped results of one reduce key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReduceDefinition {
    /// Number of mapped results for the key.
    Count,
    /// Sum of a numeric field across the mapped results for the key.
    Sum { field: String },
    /// A reduce function registered on the indexing context under `name`.
    Custom { name: String },
}

/// Stored definition of an index.
///
/// Only the parts the indexing executors need are modelled here; the map
/// source is kept opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    /// Map function source, opaque to this crate
    #[serde(default)]
    pub map: String,
    /// Present for map-reduce indexes
    #[serde(default)]
    pub reduce: Option<ReduceDefinition>,
}

impl IndexDefinition {
    /// A map-only index.
    pub fn map_only(name: impl Into<String>, map: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            map: map.into(),
            reduce: None,
        }
    }

    /// A map-reduce index.
    pub fn map_reduce(
        name: impl Into<String>,
        map: impl Into<String>,
        reduce: ReduceDefinition,
    ) -> Self {
        Self {
            name: name.into(),
            map: map.into(),
            reduce: Some(reduce),
        }
    }

    pub fn is_map_reduce(&self) -> bool {
        self.reduce.is_some()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TypesError> {
        serde_json::to_vec(self).map_err(TypesError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        serde_json::from_slice(bytes).map_err(TypesError::from)
    }
}

/// Persisted per-index statistics.
///
/// `last_reduced_etag` only ever moves forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub name: String,

    /// Highest etag incorporated into the reduced output
    #[serde(default)]
    pub last_reduced_etag: Option<Etag>,

    /// Timestamp of the mapped result at `last_reduced_etag`
    #[serde(default)]
    pub last_reduced_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub reduce_attempts: u64,

    #[serde(default)]
    pub reduce_successes: u64,

    #[serde(default)]
    pub reduce_errors: u64,
}

impl IndexStats {
    /// Fresh stats for a newly created index.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_reduced_etag: None,
            last_reduced_timestamp: None,
            reduce_attempts: 0,
            reduce_successes: 0,
            reduce_errors: 0,
        }
    }

    /// Advance the reduce watermark if `etag` does not regress it.
    ///
    /// Returns whether the watermark was written.
    pub fn advance_last_reduced(&mut self, etag: Etag, timestamp: DateTime<Utc>) -> bool {
        let current = self.last_reduced_etag.unwrap_or(Etag::ZERO);
        if current > etag {
            return false;
        }
        self.last_reduced_etag = Some(etag);
        self.last_reduced_timestamp = Some(timestamp);
        true
    }

    /// Count one reduce attempt and its outcome.
    pub fn record_reduce_outcome(&mut self, succeeded: bool) {
        self.reduce_attempts += 1;
        if succeeded {
            self.reduce_successes += 1;
        } else {
            self.reduce_errors += 1;
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TypesError> {
        serde_json::to_vec(self).map_err(TypesError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        serde_json::from_slice(bytes).map_err(TypesError::from)
    }
}

/// Transient descriptor of one index's work for a single scheduling pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexToWorkOn {
    pub index_name: String,
    pub last_indexed_etag: Etag,
}

impl IndexToWorkOn {
    pub fn new(index_name: impl Into<String>, last_indexed_etag: Option<Etag>) -> Self {
        Self {
            index_name: index_name.into(),
            last_indexed_etag: last_indexed_etag.unwrap_or(Etag::ZERO),
        }
    }
}

/// Metadata of one mapped intermediate result. The payload is not included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedResultInfo {
    pub reduce_key: String,
    pub reduce_group_id: u32,
    pub etag: Etag,
    pub timestamp: DateTime<Utc>,
}

impl MappedResultInfo {
    pub fn reduce_key_and_group(&self) -> ReduceKeyAndGroupId {
        ReduceKeyAndGroupId::new(self.reduce_key.clone(), self.reduce_group_id)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TypesError> {
        serde_json::to_vec(self).map_err(TypesError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        serde_json::from_slice(bytes).map_err(TypesError::from)
    }
}

/// A mapped result together with its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedResult {
    pub info: MappedResultInfo,
    pub data: serde_json::Value,
}

/// Deduplication key for reduce work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReduceKeyAndGroupId {
    pub reduce_key: String,
    pub reduce_group_id: u32,
}

impl ReduceKeyAndGroupId {
    pub fn new(reduce_key: impl Into<String>, reduce_group_id: u32) -> Self {
        Self {
            reduce_key: reduce_key.into(),
            reduce_group_id,
        }
    }
}

/// Reduced output for one key/group of an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducedResult {
    pub reduce_key: String,
    pub reduce_group_id: u32,
    pub values: Vec<serde_json::Value>,
    /// Highest mapped-result etag that went into `values`
    pub etag: Etag,
    pub timestamp: DateTime<Utc>,
}

impl ReducedResult {
    pub fn to_bytes(&self) -> Result<Vec<u8>, TypesError> {
        serde_json::to_vec(self).map_err(TypesError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        serde_json::from_slice(bytes).map_err(TypesError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_map_reduce_flag() {
        let map_only = IndexDefinition::map_only("users_by_name", "from u in docs select u.name");
        assert!(!map_only.is_map_reduce());

        let reduce = IndexDefinition::map_reduce(
            "orders_by_customer",
            "from o in docs select o.customer",
            ReduceDefinition::Count,
        );
        assert!(reduce.is_map_reduce());
    }

    #[test]
    fn test_definition_json_format() {
        let def = IndexDefinition::map_reduce(
            "totals",
            "",
            ReduceDefinition::Sum {
                field: "amount".to_string(),
            },
        );
        let json = String::from_utf8(def.to_bytes().unwrap()).unwrap();
        assert!(json.contains("\"kind\":\"sum\""));
        assert!(json.contains("\"field\":\"amount\""));

        let decoded = IndexDefinition::from_bytes(json.as_bytes()).unwrap();
        assert_eq!(decoded, def);
    }

    #[test]
    fn test_index_to_work_on_defaults_to_zero() {
        let work = IndexToWorkOn::new("idx", None);
        assert_eq!(work.last_indexed_etag, Etag::ZERO);

        let work = IndexToWorkOn::new("idx", Some(Etag::from_sequence(7)));
        assert_eq!(work.last_indexed_etag, Etag::from_sequence(7));
    }

    #[test]
    fn test_advance_last_reduced_never_regresses() {
        let mut stats = IndexStats::new("idx");
        let now = Utc::now();

        assert!(stats.advance_last_reduced(Etag::from_sequence(10), now));
        assert!(stats.advance_last_reduced(Etag::from_sequence(10), now));
        assert!(!stats.advance_last_reduced(Etag::from_sequence(9), now));
        assert_eq!(stats.last_reduced_etag, Some(Etag::from_sequence(10)));

        assert!(stats.advance_last_reduced(Etag::from_sequence(12), now));
        assert_eq!(stats.last_reduced_etag, Some(Etag::from_sequence(12)));
    }

    #[test]
    fn test_record_reduce_outcome() {
        let mut stats = IndexStats::new("idx");
        stats.record_reduce_outcome(true);
        stats.record_reduce_outcome(false);
        stats.record_reduce_outcome(true);

        assert_eq!(stats.reduce_attempts, 3);
        assert_eq!(stats.reduce_successes, 2);
        assert_eq!(stats.reduce_errors, 1);
    }

    #[test]
    fn test_stats_tolerate_missing_counters() {
        let stats = IndexStats::from_bytes(br#"{"name":"legacy"}"#).unwrap();
        assert_eq!(stats.name, "legacy");
        assert!(stats.last_reduced_etag.is_none());
        assert_eq!(stats.reduce_attempts, 0);
    }

    #[test]
    fn test_reduce_key_equality_covers_both_fields() {
        let a = ReduceKeyAndGroupId::new("cust-1", 1);
        let b = ReduceKeyAndGroupId::new("cust-1", 1);
        let c = ReduceKeyAndGroupId::new("cust-1", 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
