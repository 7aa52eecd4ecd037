//! Reduce tasks: recompute reduced output for a set of reduce keys.
//!
//! A task runs inside the caller's storage batch. For every key/group it
//! loads all mapped results (not only the new ones), runs the index's reduce
//! function, and replaces the stored reduced row. A key/group with no mapped
//! results left has its reduced row removed.

use serde_json::{json, Value};
use tracing::{debug, trace};

use docdb_storage::StorageActions;
use docdb_types::{MappedResult, ReduceKeyAndGroupId, ReducedResult};

use crate::context::WorkContext;
use crate::error::IndexingError;

/// Aggregates the mapped results of one key/group into reduced values.
pub trait ReduceFunction: Send + Sync {
    fn reduce(
        &self,
        reduce_key: &ReduceKeyAndGroupId,
        mapped: &[MappedResult],
    ) -> Result<Vec<Value>, String>;
}

impl<F> ReduceFunction for F
where
    F: Fn(&ReduceKeyAndGroupId, &[MappedResult]) -> Result<Vec<Value>, String> + Send + Sync,
{
    fn reduce(
        &self,
        reduce_key: &ReduceKeyAndGroupId,
        mapped: &[MappedResult],
    ) -> Result<Vec<Value>, String> {
        self(reduce_key, mapped)
    }
}

/// `[{"count": n}]`
#[derive(Debug, Clone, Copy, Default)]
pub struct CountReduce;

impl ReduceFunction for CountReduce {
    fn reduce(
        &self,
        _reduce_key: &ReduceKeyAndGroupId,
        mapped: &[MappedResult],
    ) -> Result<Vec<Value>, String> {
        Ok(vec![json!({ "count": mapped.len() })])
    }
}

/// `[{"sum": total}]` over a numeric field. Missing fields count as zero.
#[derive(Debug, Clone)]
pub struct SumReduce {
    field: String,
}

impl SumReduce {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl ReduceFunction for SumReduce {
    fn reduce(
        &self,
        _reduce_key: &ReduceKeyAndGroupId,
        mapped: &[MappedResult],
    ) -> Result<Vec<Value>, String> {
        let mut total = 0.0;
        for result in mapped {
            match result.data.get(&self.field) {
                None | Some(Value::Null) => {}
                Some(value) => {
                    total += value.as_f64().ok_or_else(|| {
                        format!(
                            "field '{}' is not numeric at etag {}",
                            self.field, result.info.etag
                        )
                    })?;
                }
            }
        }
        Ok(vec![json!({ "sum": total })])
    }
}

/// The unit of aggregation work for one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceTask {
    pub index: String,
    /// Unique key/group pairs, in the order they were first seen
    pub reduce_keys: Vec<ReduceKeyAndGroupId>,
}

impl ReduceTask {
    pub fn new(index: impl Into<String>, reduce_keys: Vec<ReduceKeyAndGroupId>) -> Self {
        Self {
            index: index.into(),
            reduce_keys,
        }
    }

    /// Recompute every key/group of this task within `actions`' batch.
    ///
    /// Returns the number of reduced rows written. The first failing
    /// key/group aborts the task with [`IndexingError::Reduce`].
    pub fn execute(
        &self,
        actions: &mut StorageActions<'_>,
        context: &WorkContext,
    ) -> Result<usize, IndexingError> {
        let definition = context
            .definitions()
            .get_index_definition(&self.index)?
            .ok_or_else(|| IndexingError::Index(format!("index {} no longer exists", self.index)))?;
        let reduce = definition
            .reduce
            .as_ref()
            .ok_or_else(|| IndexingError::Index(format!("index {} is not a map-reduce index", self.index)))?;
        let function = context.reduce_function(reduce)?;

        let mut written = 0;
        for reduce_key in &self.reduce_keys {
            let mapped = actions.mapped_results_for_reduce_key(&self.index, reduce_key)?;
            actions.delete_reduced_result(&self.index, reduce_key)?;

            let Some(latest) = mapped.iter().max_by_key(|m| m.info.etag) else {
                trace!(index = %self.index, reduce_key = %reduce_key.reduce_key, "No mapped results left, removed reduced row");
                continue;
            };

            let values = function
                .reduce(reduce_key, &mapped)
                .map_err(|message| IndexingError::Reduce {
                    index: self.index.clone(),
                    reduce_key: reduce_key.reduce_key.clone(),
                    message,
                })?;

            actions.put_reduced_result(
                &self.index,
                &ReducedResult {
                    reduce_key: reduce_key.reduce_key.clone(),
                    reduce_group_id: reduce_key.reduce_group_id,
                    values,
                    etag: latest.info.etag,
                    timestamp: latest.info.timestamp,
                },
            )?;
            written += 1;
        }

        debug!(
            index = %self.index,
            keys = self.reduce_keys.len(),
            written = written,
            "Executed reduce task"
        );
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use docdb_storage::Storage;
    use docdb_types::{Etag, IndexDefinition, MappedResultInfo, ReduceDefinition};
    use std::sync::Arc;
    use tempfile::TempDir;

    use crate::config::ExecutorConfig;

    fn mapped(etag: u128, data: Value) -> MappedResult {
        MappedResult {
            info: MappedResultInfo {
                reduce_key: "k".to_string(),
                reduce_group_id: 0,
                etag: Etag::from_sequence(etag),
                timestamp: Utc::now(),
            },
            data,
        }
    }

    fn create_context() -> (WorkContext, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(temp_dir.path()).unwrap());
        let context = WorkContext::new(storage, ExecutorConfig::default());
        (context, temp_dir)
    }

    #[test]
    fn test_count_reduce() {
        let key = ReduceKeyAndGroupId::new("k", 0);
        let values = CountReduce
            .reduce(&key, &[mapped(1, json!({})), mapped(2, json!({}))])
            .unwrap();
        assert_eq!(values, vec![json!({"count": 2})]);
    }

    #[test]
    fn test_sum_reduce() {
        let key = ReduceKeyAndGroupId::new("k", 0);
        let sum = SumReduce::new("amount");
        let values = sum
            .reduce(
                &key,
                &[
                    mapped(1, json!({"amount": 2})),
                    mapped(2, json!({"amount": 3.5})),
                    mapped(3, json!({"other": 1})),
                ],
            )
            .unwrap();
        assert_eq!(values, vec![json!({"sum": 5.5})]);
    }

    #[test]
    fn test_sum_reduce_rejects_non_numeric() {
        let key = ReduceKeyAndGroupId::new("k", 0);
        let err = SumReduce::new("amount")
            .reduce(&key, &[mapped(1, json!({"amount": "ten"}))])
            .unwrap_err();
        assert!(err.contains("not numeric"));
    }

    #[test]
    fn test_execute_writes_one_row_per_key() {
        let (context, _temp) = create_context();
        context
            .definitions()
            .add_index(IndexDefinition::map_reduce("orders", "", ReduceDefinition::Count))
            .unwrap();

        let storage = context.storage().clone();
        storage
            .batch(|actions| {
                for key in ["cust-1", "cust-2", "cust-1"] {
                    actions.put_mapped_result("orders", key, 1, json!({}), Utc::now())?;
                }
                Ok::<_, IndexingError>(())
            })
            .unwrap();

        let task = ReduceTask::new(
            "orders",
            vec![
                ReduceKeyAndGroupId::new("cust-1", 1),
                ReduceKeyAndGroupId::new("cust-2", 1),
            ],
        );
        let written = storage.batch(|actions| task.execute(actions, &context)).unwrap();
        assert_eq!(written, 2);

        let rows = storage
            .batch(|actions| actions.reduced_results_for_index("orders"))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].reduce_key, "cust-1");
        assert_eq!(rows[0].values, vec![json!({"count": 2})]);
        assert_eq!(rows[1].values, vec![json!({"count": 1})]);
    }

    #[test]
    fn test_execute_failure_rolls_back_batch() {
        let (context, _temp) = create_context();
        context
            .definitions()
            .add_index(IndexDefinition::map_reduce(
                "totals",
                "",
                ReduceDefinition::Sum {
                    field: "amount".to_string(),
                },
            ))
            .unwrap();

        let storage = context.storage().clone();
        storage
            .batch(|actions| {
                actions.put_mapped_result("totals", "a", 0, json!({"amount": 1}), Utc::now())?;
                actions.put_mapped_result("totals", "b", 0, json!({"amount": "bad"}), Utc::now())?;
                Ok::<_, IndexingError>(())
            })
            .unwrap();

        let task = ReduceTask::new(
            "totals",
            vec![ReduceKeyAndGroupId::new("a", 0), ReduceKeyAndGroupId::new("b", 0)],
        );
        let result = storage.batch(|actions| task.execute(actions, &context));
        assert!(matches!(result, Err(IndexingError::Reduce { .. })));

        // Key "a" was reduced before the failure but the batch never committed.
        let rows = storage
            .batch(|actions| actions.reduced_results_for_index("totals"))
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_execute_requires_map_reduce_definition() {
        let (context, _temp) = create_context();
        context
            .definitions()
            .add_index(IndexDefinition::map_only("users", ""))
            .unwrap();

        let task = ReduceTask::new("users", vec![ReduceKeyAndGroupId::new("k", 0)]);
        let result = context
            .storage()
            .batch(|actions| task.execute(actions, &context));
        assert!(matches!(result, Err(IndexingError::Index(_))));
    }
}
