//! Shared indexing context.
//!
//! One [`WorkContext`] is created at startup and handed to every executor.
//! It owns the storage views, the executor configuration, the worker budget
//! shared by all index families, registered reduce functions, and a bounded
//! log of recent per-index failures.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Semaphore;

use docdb_storage::{IndexDefinitionStorage, IndexStorage, Storage};
use docdb_types::ReduceDefinition;

use crate::config::ExecutorConfig;
use crate::error::IndexingError;
use crate::reduce_task::{CountReduce, ReduceFunction, SumReduce};

/// Number of failures kept by [`WorkContext::recent_errors`].
pub const MAX_RECENT_ERRORS: usize = 50;

/// One recorded indexing failure.
#[derive(Debug, Clone, Serialize)]
pub struct IndexingErrorRecord {
    pub index: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

pub struct WorkContext {
    storage: Arc<Storage>,
    definitions: IndexDefinitionStorage,
    index_storage: IndexStorage,
    config: ExecutorConfig,
    scheduler: Arc<Semaphore>,
    reduce_functions: DashMap<String, Arc<dyn ReduceFunction>>,
    errors: Mutex<VecDeque<IndexingErrorRecord>>,
}

impl WorkContext {
    /// Create a context with its own worker budget of
    /// `config.max_number_of_parallel_index_tasks` slots.
    pub fn new(storage: Arc<Storage>, config: ExecutorConfig) -> Self {
        let scheduler = Arc::new(Semaphore::new(config.max_number_of_parallel_index_tasks));
        Self::with_scheduler(storage, config, scheduler)
    }

    /// Create a context that draws workers from an existing budget, shared
    /// with other index families.
    pub fn with_scheduler(
        storage: Arc<Storage>,
        config: ExecutorConfig,
        scheduler: Arc<Semaphore>,
    ) -> Self {
        Self {
            definitions: IndexDefinitionStorage::new(storage.clone()),
            index_storage: IndexStorage::new(storage.clone()),
            storage,
            config,
            scheduler,
            reduce_functions: DashMap::new(),
            errors: Mutex::new(VecDeque::new()),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn definitions(&self) -> &IndexDefinitionStorage {
        &self.definitions
    }

    pub fn index_storage(&self) -> &IndexStorage {
        &self.index_storage
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Worker budget for per-index tasks.
    pub fn scheduler(&self) -> &Arc<Semaphore> {
        &self.scheduler
    }

    /// Register a reduce function for `ReduceDefinition::Custom { name }`.
    pub fn register_reduce_function(&self, name: impl Into<String>, function: Arc<dyn ReduceFunction>) {
        self.reduce_functions.insert(name.into(), function);
    }

    /// Resolve the reduce function a definition refers to.
    pub fn reduce_function(
        &self,
        definition: &ReduceDefinition,
    ) -> Result<Arc<dyn ReduceFunction>, IndexingError> {
        match definition {
            ReduceDefinition::Count => Ok(Arc::new(CountReduce)),
            ReduceDefinition::Sum { field } => Ok(Arc::new(SumReduce::new(field.clone()))),
            ReduceDefinition::Custom { name } => self
                .reduce_functions
                .get(name)
                .map(|f| f.value().clone())
                .ok_or_else(|| IndexingError::UnknownReducer(name.clone())),
        }
    }

    /// Remember a failure for `index`, dropping the oldest beyond [`MAX_RECENT_ERRORS`].
    pub fn record_error(&self, index: &str, error: &IndexingError) {
        let mut errors = self
            .errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if errors.len() == MAX_RECENT_ERRORS {
            errors.pop_front();
        }
        errors.push_back(IndexingErrorRecord {
            index: index.to_string(),
            message: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Recent failures, oldest first.
    pub fn recent_errors(&self) -> Vec<IndexingErrorRecord> {
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
