//! Index-facing views over [`Storage`]: definitions and reduce output.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use docdb_types::IndexDefinition;

use crate::column_families::CF_REDUCE_RESULTS;
use crate::db::Storage;
use crate::error::StorageError;

/// Index definitions, cached in memory after the first lookup.
pub struct IndexDefinitionStorage {
    storage: Arc<Storage>,
    cache: DashMap<String, IndexDefinition>,
}

impl IndexDefinitionStorage {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            cache: DashMap::new(),
        }
    }

    /// Persist a definition (seeding stats for a new index) and cache it.
    pub fn add_index(&self, definition: IndexDefinition) -> Result<(), StorageError> {
        self.storage.create_index(&definition)?;
        self.cache.insert(definition.name.clone(), definition);
        Ok(())
    }

    /// Forget a definition. Executors treat the index as invalid from then on.
    pub fn remove_index(&self, name: &str) -> Result<(), StorageError> {
        self.storage.delete_index_definition(name)?;
        self.cache.remove(name);
        Ok(())
    }

    /// Look up a definition; `None` if the index no longer exists.
    pub fn get_index_definition(&self, name: &str) -> Result<Option<IndexDefinition>, StorageError> {
        if let Some(definition) = self.cache.get(name) {
            return Ok(Some(definition.clone()));
        }

        let definition = self.storage.get_index_definition(name)?;
        if let Some(definition) = &definition {
            self.cache.insert(name.to_string(), definition.clone());
        }
        Ok(definition)
    }
}

/// Reduce output segments.
pub struct IndexStorage {
    storage: Arc<Storage>,
}

impl IndexStorage {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Persist reduce-side index output to durable media.
    pub fn flush_reduce_indexes(&self) -> Result<(), StorageError> {
        self.storage.flush_cf(CF_REDUCE_RESULTS)?;
        debug!("Flushed reduce indexes");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docdb_types::ReduceDefinition;
    use tempfile::TempDir;

    fn create_test_storage() -> (Arc<Storage>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();
        (Arc::new(storage), temp_dir)
    }

    #[test]
    fn test_definition_lookup_and_cache() {
        let (storage, _temp) = create_test_storage();
        let definitions = IndexDefinitionStorage::new(storage.clone());

        definitions
            .add_index(IndexDefinition::map_reduce("orders", "", ReduceDefinition::Count))
            .unwrap();
        assert!(definitions.get_index_definition("orders").unwrap().unwrap().is_map_reduce());
        assert!(definitions.get_index_definition("missing").unwrap().is_none());

        // A fresh view reads through to storage.
        let reopened = IndexDefinitionStorage::new(storage);
        assert!(reopened.get_index_definition("orders").unwrap().is_some());
    }

    #[test]
    fn test_remove_index() {
        let (storage, _temp) = create_test_storage();
        let definitions = IndexDefinitionStorage::new(storage);

        definitions
            .add_index(IndexDefinition::map_only("users", ""))
            .unwrap();
        definitions.remove_index("users").unwrap();
        assert!(definitions.get_index_definition("users").unwrap().is_none());
    }

    #[test]
    fn test_redefining_index_refreshes_cache() {
        let (storage, _temp) = create_test_storage();
        let definitions = IndexDefinitionStorage::new(storage.clone());

        definitions.add_index(IndexDefinition::map_only("orders", "")).unwrap();
        assert!(!definitions.get_index_definition("orders").unwrap().unwrap().is_map_reduce());

        definitions
            .add_index(IndexDefinition::map_reduce("orders", "", ReduceDefinition::Count))
            .unwrap();
        assert!(definitions.get_index_definition("orders").unwrap().unwrap().is_map_reduce());
        assert!(storage.get_index_definition("orders").unwrap().unwrap().is_map_reduce());
    }

    #[test]
    fn test_flush_reduce_indexes() {
        let (storage, _temp) = create_test_storage();
        IndexStorage::new(storage).flush_reduce_indexes().unwrap();
    }
}
