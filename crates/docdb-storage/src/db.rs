//! RocksDB wrapper for docdb storage.
//!
//! Provides:
//! - Database open/close with column family setup
//! - Atomic batches ([`Storage::batch`]) with guarded watermark updates
//! - Etag assignment for mapped results
//! - Index definition and statistics reads

use rocksdb::{ColumnFamily, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use docdb_types::{Etag, IndexDefinition, IndexStats, MappedResultInfo};

use crate::actions::{PendingMappedResult, StatsUpdate, StorageActions};
use crate::column_families::{
    build_cf_descriptors, ALL_CF_NAMES, CF_INDEX_DEFINITIONS, CF_INDEX_STATS, CF_MAPPED_RESULTS,
    CF_MAPPED_RESULTS_BY_KEY, CF_MAPPED_RESULT_DATA, CF_METADATA,
};
use crate::error::StorageError;
use crate::keys::{definition_key, stats_key, MappedResultKey, ReduceKeyIndexKey, LAST_ETAG_KEY};

/// Main storage interface
pub struct Storage {
    db: DB,
    /// Serializes commits and holds the highest committed etag sequence.
    /// Etags are only assigned while it is held, so a visible etag implies
    /// every lower etag is visible too.
    commit_lock: Mutex<u128>,
}

impl Storage {
    /// Open storage at the given path, creating if necessary
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening storage at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_background_jobs(4);

        let cf_descriptors = build_cf_descriptors();
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let last_etag = Self::load_last_etag(&db)?;
        debug!(last_etag = %last_etag, "Loaded etag counter");

        Ok(Self {
            db,
            commit_lock: Mutex::new(last_etag.sequence()),
        })
    }

    fn load_last_etag(db: &DB) -> Result<Etag, StorageError> {
        let cf = db
            .cf_handle(CF_METADATA)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_METADATA.to_string()))?;

        match db.get_cf(cf, LAST_ETAG_KEY)? {
            Some(bytes) => Ok(Etag::from_slice(&bytes)?),
            None => Ok(Etag::ZERO),
        }
    }

    fn lock_commits(&self) -> MutexGuard<'_, u128> {
        self.commit_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn db(&self) -> &DB {
        &self.db
    }

    pub(crate) fn cf(&self, name: &str) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(name.to_string()))
    }

    /// Highest etag committed so far; [`Etag::ZERO`] for an empty store.
    pub fn last_etag(&self) -> Etag {
        Etag::from_sequence(*self.lock_commits())
    }

    /// Run `work` as one atomic unit.
    ///
    /// Writes staged through the [`StorageActions`] accessor become visible
    /// together when `work` returns `Ok`; if it returns `Err`, nothing is
    /// written. Reads inside `work` see committed state.
    pub fn batch<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut StorageActions<'_>) -> Result<T, E>,
        E: From<StorageError>,
    {
        let mut actions = StorageActions::new(self);
        let value = work(&mut actions)?;
        self.commit(actions)?;
        Ok(value)
    }

    fn commit(&self, actions: StorageActions<'_>) -> Result<(), StorageError> {
        let (mut batch, stats_updates, pending) = actions.into_parts();
        if batch.is_empty() && stats_updates.is_empty() && pending.is_empty() {
            return Ok(());
        }

        let mut last_etag = self.lock_commits();

        let committed_etag = if pending.is_empty() {
            *last_etag
        } else {
            let new_last = self.stage_pending(&mut batch, pending, *last_etag)?;
            let metadata_cf = self.cf(CF_METADATA)?;
            batch.put_cf(metadata_cf, LAST_ETAG_KEY, Etag::from_sequence(new_last).as_bytes());
            new_last
        };

        if !stats_updates.is_empty() {
            let stats_cf = self.cf(CF_INDEX_STATS)?;
            for (index, update) in stats_updates {
                self.apply_stats_update(&mut batch, stats_cf, &index, update)?;
            }
        }

        self.db.write(batch)?;
        *last_etag = committed_etag;
        Ok(())
    }

    /// Assign etags to the staged mapped results and add their rows to `batch`.
    ///
    /// Caller-supplied etags must sort after `committed`; the remaining rows
    /// are numbered after the highest etag in play. Returns the new highest
    /// etag sequence.
    fn stage_pending(
        &self,
        batch: &mut WriteBatch,
        pending: Vec<PendingMappedResult>,
        committed: u128,
    ) -> Result<u128, StorageError> {
        let meta_cf = self.cf(CF_MAPPED_RESULTS)?;
        let data_cf = self.cf(CF_MAPPED_RESULT_DATA)?;
        let by_key_cf = self.cf(CF_MAPPED_RESULTS_BY_KEY)?;

        let mut last = committed;
        for etag in pending.iter().filter_map(|p| p.etag) {
            if etag.sequence() <= committed {
                return Err(StorageError::EtagOrder(format!(
                    "etag {} does not sort after committed etag {}",
                    etag,
                    Etag::from_sequence(committed)
                )));
            }
            last = last.max(etag.sequence());
        }

        for row in pending {
            let etag = match row.etag {
                Some(etag) => etag,
                None => {
                    last = last
                        .checked_add(1)
                        .ok_or_else(|| StorageError::EtagOrder("etag space exhausted".to_string()))?;
                    Etag::from_sequence(last)
                }
            };
            let info = MappedResultInfo {
                reduce_key: row.reduce_key,
                reduce_group_id: row.reduce_group_id,
                etag,
                timestamp: row.timestamp,
            };

            let key = MappedResultKey::new(row.index.as_str(), etag).to_bytes();
            batch.put_cf(meta_cf, &key, info.to_bytes()?);
            if let Some(data) = row.data {
                let by_key = ReduceKeyIndexKey::new(row.index.as_str(), info.reduce_key_and_group(), etag);
                batch.put_cf(data_cf, &key, serde_json::to_vec(&data)?);
                batch.put_cf(by_key_cf, by_key.to_bytes(), b"");
            }
        }
        Ok(last)
    }

    /// Re-read the stored stats under the commit lock and apply a staged update.
    fn apply_stats_update(
        &self,
        batch: &mut WriteBatch,
        stats_cf: &ColumnFamily,
        index: &str,
        update: StatsUpdate,
    ) -> Result<(), StorageError> {
        let Some(bytes) = self.db.get_cf(stats_cf, stats_key(index))? else {
            warn!(index = %index, "Stats missing at commit, dropping update");
            return Ok(());
        };
        let mut stats = IndexStats::from_bytes(&bytes)?;

        if let Some((etag, timestamp)) = update.last_reduced {
            let previous = stats.last_reduced_etag;
            if stats.advance_last_reduced(etag, timestamp) {
                debug!(index = %index, etag = %etag, "Advanced reduce watermark");
            } else {
                debug!(
                    index = %index,
                    stored = ?previous,
                    proposed = %etag,
                    "Stored watermark is ahead, keeping it"
                );
            }
        }
        for succeeded in update.outcomes {
            stats.record_reduce_outcome(succeeded);
        }

        batch.put_cf(stats_cf, stats_key(index), stats.to_bytes()?);
        Ok(())
    }

    // ==================== Index Metadata ====================

    /// Store an index definition and, if none exist yet, fresh stats for it.
    ///
    /// Goes through [`IndexDefinitionStorage`](crate::IndexDefinitionStorage)
    /// so its cache stays current.
    pub(crate) fn create_index(&self, definition: &IndexDefinition) -> Result<(), StorageError> {
        let defs_cf = self.cf(CF_INDEX_DEFINITIONS)?;
        let stats_cf = self.cf(CF_INDEX_STATS)?;

        let _guard = self.lock_commits();

        let mut batch = WriteBatch::default();
        batch.put_cf(defs_cf, definition_key(&definition.name), definition.to_bytes()?);
        if self.db.get_cf(stats_cf, stats_key(&definition.name))?.is_none() {
            let stats = IndexStats::new(definition.name.clone());
            batch.put_cf(stats_cf, stats_key(&definition.name), stats.to_bytes()?);
        }
        self.db.write(batch)?;

        debug!(index = %definition.name, map_reduce = definition.is_map_reduce(), "Stored index definition");
        Ok(())
    }

    /// Remove an index definition. Stats and data are left for cleanup.
    pub(crate) fn delete_index_definition(&self, name: &str) -> Result<(), StorageError> {
        let cf = self.cf(CF_INDEX_DEFINITIONS)?;
        self.db.delete_cf(cf, definition_key(name))?;
        Ok(())
    }

    pub fn get_index_definition(&self, name: &str) -> Result<Option<IndexDefinition>, StorageError> {
        let cf = self.cf(CF_INDEX_DEFINITIONS)?;
        match self.db.get_cf(cf, definition_key(name))? {
            Some(bytes) => Ok(Some(IndexDefinition::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_index_stats(&self, name: &str) -> Result<Option<IndexStats>, StorageError> {
        let cf = self.cf(CF_INDEX_STATS)?;
        match self.db.get_cf(cf, stats_key(name))? {
            Some(bytes) => Ok(Some(IndexStats::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stats of every known index, ordered by name.
    pub fn all_index_stats(&self) -> Result<Vec<IndexStats>, StorageError> {
        let cf = self.cf(CF_INDEX_STATS)?;
        let mut results = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            results.push(IndexStats::from_bytes(&value)?);
        }
        Ok(results)
    }

    // ==================== Maintenance ====================

    /// Flush one column family to disk
    pub fn flush_cf(&self, name: &str) -> Result<(), StorageError> {
        let cf = self.cf(name)?;
        self.db.flush_cf(cf)?;
        Ok(())
    }

    /// Flush all column families to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        for cf_name in ALL_CF_NAMES {
            if let Some(cf) = self.db.cf_handle(cf_name) {
                self.db.flush_cf(cf)?;
            }
        }
        Ok(())
    }
}
