//! Accessor handed to the work closure of [`Storage::batch`].
//!
//! Reads go straight to committed state. Writes are staged in a RocksDB
//! `WriteBatch`; stats changes are staged separately and resolved against
//! freshly read stats when the batch commits, so a watermark never moves
//! backwards even if another batch advanced it in the meantime.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rocksdb::{Direction, IteratorMode, WriteBatch};
use tracing::trace;

use docdb_types::{
    Etag, IndexStats, MappedResult, MappedResultInfo, ReduceKeyAndGroupId, ReducedResult,
};

use crate::column_families::{
    CF_INDEX_STATS, CF_MAPPED_RESULTS, CF_MAPPED_RESULTS_BY_KEY, CF_MAPPED_RESULT_DATA,
    CF_REDUCE_RESULTS,
};
use crate::db::Storage;
use crate::error::StorageError;
use crate::keys::{stats_key, MappedResultKey, ReduceKeyIndexKey, ReducedResultKey};

/// Stats changes staged by a batch, applied at commit.
#[derive(Debug, Default)]
pub(crate) struct StatsUpdate {
    /// Proposed reduce watermark; written only if it does not regress the stored one
    pub last_reduced: Option<(Etag, DateTime<Utc>)>,
    pub outcomes: Vec<bool>,
}

/// A mapped-result row whose etag and keys are decided at commit.
#[derive(Debug)]
pub(crate) struct PendingMappedResult {
    pub index: String,
    pub reduce_key: String,
    pub reduce_group_id: u32,
    pub timestamp: DateTime<Utc>,
    /// `None` stages a deletion marker: a metadata row with no payload and no
    /// by-key entry, so the next scan revisits the key/group.
    pub data: Option<serde_json::Value>,
    /// Supplied by the caller; must sort after every committed etag
    pub etag: Option<Etag>,
}

/// Read/write access to the storage tables within one atomic batch.
pub struct StorageActions<'a> {
    storage: &'a Storage,
    batch: WriteBatch,
    stats_updates: BTreeMap<String, StatsUpdate>,
    pending: Vec<PendingMappedResult>,
}

impl<'a> StorageActions<'a> {
    pub(crate) fn new(storage: &'a Storage) -> Self {
        Self {
            storage,
            batch: WriteBatch::default(),
            stats_updates: BTreeMap::new(),
            pending: Vec::new(),
        }
    }

    pub(crate) fn into_parts(
        self,
    ) -> (WriteBatch, BTreeMap<String, StatsUpdate>, Vec<PendingMappedResult>) {
        (self.batch, self.stats_updates, self.pending)
    }

    // ==================== Mapped Results ====================

    /// Stage a mapped result. Its etag is assigned when the batch commits,
    /// so etag order always matches the order rows become visible.
    pub fn put_mapped_result(
        &mut self,
        index: &str,
        reduce_key: &str,
        reduce_group_id: u32,
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        trace!(index = %index, reduce_key = %reduce_key, "Staged mapped result");
        self.pending.push(PendingMappedResult {
            index: index.to_string(),
            reduce_key: reduce_key.to_string(),
            reduce_group_id,
            timestamp,
            data: Some(data),
            etag: None,
        });
        Ok(())
    }

    /// Stage a mapped result whose etag was assigned elsewhere.
    ///
    /// The commit fails with [`StorageError::EtagOrder`] unless the etag sorts
    /// after every etag already committed.
    pub fn put_mapped_result_with_etag(
        &mut self,
        index: &str,
        info: MappedResultInfo,
        data: serde_json::Value,
    ) -> Result<(), StorageError> {
        trace!(index = %index, etag = %info.etag, reduce_key = %info.reduce_key, "Staged mapped result");
        self.pending.push(PendingMappedResult {
            index: index.to_string(),
            reduce_key: info.reduce_key,
            reduce_group_id: info.reduce_group_id,
            timestamp: info.timestamp,
            data: Some(data),
            etag: Some(info.etag),
        });
        Ok(())
    }

    /// Metadata of every mapped result of `index` with an etag strictly
    /// greater than `after`, ascending by etag. Payloads are not read.
    ///
    /// The result always comes from a single forward iteration, so it is
    /// strictly ascending; callers may rely on its first and last elements
    /// being the etag extremes.
    pub fn mapped_result_infos_after(
        &self,
        index: &str,
        after: Etag,
    ) -> Result<Vec<MappedResultInfo>, StorageError> {
        let cf = self.storage.cf(CF_MAPPED_RESULTS)?;
        let prefix = MappedResultKey::index_prefix(index);
        let start = MappedResultKey::new(index, after).to_bytes();

        let iter = self
            .storage
            .db()
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));

        let mut results = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            if key.as_ref() == start.as_slice() {
                continue;
            }
            results.push(MappedResultInfo::from_bytes(&value)?);
        }
        Ok(results)
    }

    /// Every mapped result (payload included) for one key/group of `index`,
    /// ascending by etag.
    pub fn mapped_results_for_reduce_key(
        &self,
        index: &str,
        reduce_key: &ReduceKeyAndGroupId,
    ) -> Result<Vec<MappedResult>, StorageError> {
        let by_key_cf = self.storage.cf(CF_MAPPED_RESULTS_BY_KEY)?;
        let meta_cf = self.storage.cf(CF_MAPPED_RESULTS)?;
        let data_cf = self.storage.cf(CF_MAPPED_RESULT_DATA)?;
        let db = self.storage.db();

        let prefix = ReduceKeyIndexKey::group_prefix(index, reduce_key);
        let iter = db.iterator_cf(by_key_cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut results = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let etag = ReduceKeyIndexKey::etag_from_bytes(&key)?;
            let row_key = MappedResultKey::new(index, etag).to_bytes();

            let meta = db
                .get_cf(meta_cf, &row_key)?
                .ok_or_else(|| StorageError::NotFound(format!("mapped result {} of {}", etag, index)))?;
            let data = db
                .get_cf(data_cf, &row_key)?
                .ok_or_else(|| StorageError::NotFound(format!("mapped result data {} of {}", etag, index)))?;

            results.push(MappedResult {
                info: MappedResultInfo::from_bytes(&meta)?,
                data: serde_json::from_slice(&data)?,
            });
        }
        Ok(results)
    }

    /// Stage removal of one mapped result.
    ///
    /// A deletion marker with a fresh etag takes the row's place in the scan
    /// order, so the next reduce pass recomputes (or drops) its key/group.
    pub fn delete_mapped_result(&mut self, index: &str, info: &MappedResultInfo) -> Result<(), StorageError> {
        let storage = self.storage;
        let meta_cf = storage.cf(CF_MAPPED_RESULTS)?;
        let data_cf = storage.cf(CF_MAPPED_RESULT_DATA)?;
        let by_key_cf = storage.cf(CF_MAPPED_RESULTS_BY_KEY)?;

        let key = MappedResultKey::new(index, info.etag).to_bytes();
        let by_key = ReduceKeyIndexKey::new(index, info.reduce_key_and_group(), info.etag);

        self.batch.delete_cf(meta_cf, &key);
        self.batch.delete_cf(data_cf, &key);
        self.batch.delete_cf(by_key_cf, by_key.to_bytes());

        self.pending.push(PendingMappedResult {
            index: index.to_string(),
            reduce_key: info.reduce_key.clone(),
            reduce_group_id: info.reduce_group_id,
            timestamp: Utc::now(),
            data: None,
            etag: None,
        });
        Ok(())
    }

    // ==================== Indexing Stats ====================

    pub fn get_index_stats(&self, index: &str) -> Result<Option<IndexStats>, StorageError> {
        let cf = self.storage.cf(CF_INDEX_STATS)?;
        match self.storage.db().get_cf(cf, stats_key(index))? {
            Some(bytes) => Ok(Some(IndexStats::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Propose a new reduce watermark for `index`.
    ///
    /// At commit the currently stored watermark is re-read; the new value is
    /// written only if the stored one is less than or equal to it. Several
    /// proposals in one batch keep the highest.
    pub fn update_last_reduced(&mut self, index: &str, etag: Etag, timestamp: DateTime<Utc>) {
        let update = self.stats_updates.entry(index.to_string()).or_default();
        match update.last_reduced {
            Some((staged, _)) if staged > etag => {}
            _ => update.last_reduced = Some((etag, timestamp)),
        }
    }

    /// Count one reduce attempt for `index`.
    pub fn record_reduce_outcome(&mut self, index: &str, succeeded: bool) {
        self.stats_updates
            .entry(index.to_string())
            .or_default()
            .outcomes
            .push(succeeded);
    }

    // ==================== Staleness ====================

    /// Whether `index` has mapped results past its stored reduce watermark.
    pub fn is_reduce_stale(&self, index: &str) -> Result<bool, StorageError> {
        let last_reduced = self
            .get_index_stats(index)?
            .and_then(|stats| stats.last_reduced_etag)
            .unwrap_or(Etag::ZERO);

        let cf = self.storage.cf(CF_MAPPED_RESULTS)?;
        let prefix = MappedResultKey::index_prefix(index);
        let start = MappedResultKey::new(index, last_reduced).to_bytes();

        let iter = self
            .storage
            .db()
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                return Ok(false);
            }
            if key.as_ref() != start.as_slice() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ==================== Reduce Results ====================

    pub fn put_reduced_result(&mut self, index: &str, result: &ReducedResult) -> Result<(), StorageError> {
        let storage = self.storage;
        let cf = storage.cf(CF_REDUCE_RESULTS)?;
        let key = ReducedResultKey::new(
            index,
            ReduceKeyAndGroupId::new(result.reduce_key.clone(), result.reduce_group_id),
        );
        self.batch.put_cf(cf, key.to_bytes(), result.to_bytes()?);
        Ok(())
    }

    pub fn delete_reduced_result(
        &mut self,
        index: &str,
        reduce_key: &ReduceKeyAndGroupId,
    ) -> Result<(), StorageError> {
        let storage = self.storage;
        let cf = storage.cf(CF_REDUCE_RESULTS)?;
        let key = ReducedResultKey::new(index, reduce_key.clone());
        self.batch.delete_cf(cf, key.to_bytes());
        Ok(())
    }

    pub fn get_reduced_result(
        &self,
        index: &str,
        reduce_key: &ReduceKeyAndGroupId,
    ) -> Result<Option<ReducedResult>, StorageError> {
        let cf = self.storage.cf(CF_REDUCE_RESULTS)?;
        let key = ReducedResultKey::new(index, reduce_key.clone());
        match self.storage.db().get_cf(cf, key.to_bytes())? {
            Some(bytes) => Ok(Some(ReducedResult::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every reduced row of `index`, ordered by key then group.
    pub fn reduced_results_for_index(&self, index: &str) -> Result<Vec<ReducedResult>, StorageError> {
        let cf = self.storage.cf(CF_REDUCE_RESULTS)?;
        let prefix = ReducedResultKey::index_prefix(index);
        let iter = self
            .storage
            .db()
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut results = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            results.push(ReducedResult::from_bytes(&value)?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docdb_types::{IndexDefinition, ReduceDefinition};
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();
        storage
            .create_index(&IndexDefinition::map_reduce("orders", "", ReduceDefinition::Count))
            .unwrap();
        (storage, temp_dir)
    }

    fn put(storage: &Storage, index: &str, key: &str, group: u32) -> Etag {
        storage
            .batch(|actions| actions.put_mapped_result(index, key, group, json!({"key": key}), Utc::now()))
            .unwrap();
        storage.last_etag()
    }

    #[test]
    fn test_scan_is_strictly_after_and_ascending() {
        let (storage, _temp) = create_test_storage();
        let e1 = put(&storage, "orders", "a", 0);
        let e2 = put(&storage, "orders", "b", 0);
        let e3 = put(&storage, "orders", "a", 0);

        let rows = storage
            .batch(|actions| actions.mapped_result_infos_after("orders", e1))
            .unwrap();
        let etags: Vec<_> = rows.iter().map(|r| r.etag).collect();
        assert_eq!(etags, vec![e2, e3]);

        let all = storage
            .batch(|actions| actions.mapped_result_infos_after("orders", Etag::ZERO))
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_scan_stays_within_index() {
        let (storage, _temp) = create_test_storage();
        put(&storage, "orders", "a", 0);
        put(&storage, "orders2", "a", 0);
        put(&storage, "order", "a", 0);

        let rows = storage
            .batch(|actions| actions.mapped_result_infos_after("orders", Etag::ZERO))
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_mapped_results_for_reduce_key() {
        let (storage, _temp) = create_test_storage();
        put(&storage, "orders", "cust-1", 1);
        put(&storage, "orders", "cust-2", 1);
        put(&storage, "orders", "cust-1", 1);
        put(&storage, "orders", "cust-1", 2);

        let rows = storage
            .batch(|actions| {
                actions.mapped_results_for_reduce_key("orders", &ReduceKeyAndGroupId::new("cust-1", 1))
            })
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.info.reduce_key == "cust-1"));
        assert_eq!(rows[0].data, json!({"key": "cust-1"}));
        assert!(rows[0].info.etag < rows[1].info.etag);
    }

    #[test]
    fn test_delete_mapped_result() {
        let (storage, _temp) = create_test_storage();
        let put_etag = put(&storage, "orders", "a", 0);

        storage
            .batch(|actions| {
                let rows = actions.mapped_result_infos_after("orders", Etag::ZERO)?;
                for row in &rows {
                    actions.delete_mapped_result("orders", row)?;
                }
                Ok::<_, StorageError>(())
            })
            .unwrap();

        let rows = storage
            .batch(|actions| actions.mapped_results_for_reduce_key("orders", &ReduceKeyAndGroupId::new("a", 0)))
            .unwrap();
        assert!(rows.is_empty());

        // A deletion marker with a newer etag keeps the key visible to scans.
        let marker = storage
            .batch(|actions| actions.mapped_result_infos_after("orders", put_etag))
            .unwrap();
        assert_eq!(marker.len(), 1);
        assert_eq!(marker[0].reduce_key, "a");
        assert!(marker[0].etag > put_etag);
        assert!(storage.batch(|a| a.is_reduce_stale("orders")).unwrap());
    }

    #[test]
    fn test_update_last_reduced_guard() {
        let (storage, _temp) = create_test_storage();
        let high = Etag::from_sequence(20);
        let low = Etag::from_sequence(15);

        storage
            .batch(|actions| {
                actions.update_last_reduced("orders", high, Utc::now());
                Ok::<_, StorageError>(())
            })
            .unwrap();
        storage
            .batch(|actions| {
                actions.update_last_reduced("orders", low, Utc::now());
                Ok::<_, StorageError>(())
            })
            .unwrap();

        let stats = storage.get_index_stats("orders").unwrap().unwrap();
        assert_eq!(stats.last_reduced_etag, Some(high));
    }

    #[test]
    fn test_guard_reads_stats_at_commit() {
        let (storage, _temp) = create_test_storage();
        let concurrent = Etag::from_sequence(30);
        let proposed = Etag::from_sequence(25);

        storage
            .batch(|actions| {
                // The batch reads stats before a concurrent writer advances them.
                let seen = actions.get_index_stats("orders")?.unwrap();
                assert!(seen.last_reduced_etag.is_none());

                storage.batch(|other| {
                    other.update_last_reduced("orders", concurrent, Utc::now());
                    Ok::<_, StorageError>(())
                })?;

                actions.update_last_reduced("orders", proposed, Utc::now());
                Ok::<_, StorageError>(())
            })
            .unwrap();

        let stats = storage.get_index_stats("orders").unwrap().unwrap();
        assert_eq!(stats.last_reduced_etag, Some(concurrent));
    }

    #[test]
    fn test_record_reduce_outcome_counts() {
        let (storage, _temp) = create_test_storage();
        storage
            .batch(|actions| {
                actions.record_reduce_outcome("orders", true);
                actions.record_reduce_outcome("orders", false);
                Ok::<_, StorageError>(())
            })
            .unwrap();

        let stats = storage.get_index_stats("orders").unwrap().unwrap();
        assert_eq!(stats.reduce_attempts, 2);
        assert_eq!(stats.reduce_successes, 1);
        assert_eq!(stats.reduce_errors, 1);
    }

    #[test]
    fn test_is_reduce_stale() {
        let (storage, _temp) = create_test_storage();
        assert!(!storage.batch(|a| a.is_reduce_stale("orders")).unwrap());

        let etag = put(&storage, "orders", "a", 0);
        assert!(storage.batch(|a| a.is_reduce_stale("orders")).unwrap());

        storage
            .batch(|actions| {
                actions.update_last_reduced("orders", etag, Utc::now());
                Ok::<_, StorageError>(())
            })
            .unwrap();
        assert!(!storage.batch(|a| a.is_reduce_stale("orders")).unwrap());
    }

    #[test]
    fn test_reduced_results() {
        let (storage, _temp) = create_test_storage();
        let key = ReduceKeyAndGroupId::new("cust-1", 1);
        let result = ReducedResult {
            reduce_key: "cust-1".to_string(),
            reduce_group_id: 1,
            values: vec![json!({"count": 2})],
            etag: Etag::from_sequence(3),
            timestamp: Utc::now(),
        };

        storage
            .batch(|actions| actions.put_reduced_result("orders", &result))
            .unwrap();
        let stored = storage
            .batch(|actions| actions.get_reduced_result("orders", &key))
            .unwrap()
            .unwrap();
        assert_eq!(stored.values, vec![json!({"count": 2})]);

        let all = storage
            .batch(|actions| actions.reduced_results_for_index("orders"))
            .unwrap();
        assert_eq!(all.len(), 1);

        storage
            .batch(|actions| actions.delete_reduced_result("orders", &key))
            .unwrap();
        assert!(storage
            .batch(|actions| actions.get_reduced_result("orders", &key))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_explicit_etags_advance_counter() {
        let (storage, _temp) = create_test_storage();
        let info = MappedResultInfo {
            reduce_key: "a".to_string(),
            reduce_group_id: 0,
            etag: Etag::from_sequence(100),
            timestamp: Utc::now(),
        };
        storage
            .batch(|actions| actions.put_mapped_result_with_etag("orders", info, json!(null)))
            .unwrap();

        let next = put(&storage, "orders", "b", 0);
        assert!(next > Etag::from_sequence(100));
    }
}
