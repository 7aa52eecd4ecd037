//! Reduce phase executor.
//!
//! Each handled index goes through two storage batches:
//!
//! 1. Scan the metadata of mapped results newer than the reduce watermark,
//!    collapse them into distinct key/group pairs, and run a [`ReduceTask`]
//!    over those pairs.
//! 2. Advance the watermark to the last scanned etag.
//!
//! Step 2 runs whenever step 1 scanned something, even if the reduce failed,
//! so a bad batch of mapped results cannot stall the index forever. The
//! watermark update is guarded at commit time and never moves backwards.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, warn};

use docdb_types::{IndexStats, IndexToWorkOn, MappedResultInfo, ReduceKeyAndGroupId};

use crate::context::WorkContext;
use crate::error::IndexingError;
use crate::executor::IndexingExecutor;
use crate::reduce_task::ReduceTask;

/// What the scan-and-reduce batch produced.
///
/// `scanned` is populated as soon as the scan succeeds, independent of
/// whether the reduce or the commit that followed it failed.
#[derive(Debug)]
pub struct ScanOutcome {
    pub scanned: Vec<MappedResultInfo>,
    /// Number of reduced rows written
    pub result: Result<usize, IndexingError>,
}

pub struct ReducingExecutor {
    context: Arc<WorkContext>,
}

impl ReducingExecutor {
    pub fn new(context: Arc<WorkContext>) -> Self {
        Self { context }
    }

    /// Batch 1: scan new mapped results and reduce the keys they touch.
    pub fn scan_and_reduce(&self, work: &IndexToWorkOn) -> ScanOutcome {
        let index = work.index_name.as_str();
        let mut scanned = Vec::new();

        let result = self.context.storage().batch(|actions| -> Result<usize, IndexingError> {
            scanned = actions.mapped_result_infos_after(index, work.last_indexed_etag)?;
            if scanned.is_empty() {
                return Ok(0);
            }

            let reduce_keys = distinct_reduce_keys(&scanned);
            debug!(
                index = %index,
                mapped_results = scanned.len(),
                reduce_keys = reduce_keys.len(),
                "Reducing new mapped results"
            );
            ReduceTask::new(index, reduce_keys).execute(actions, &self.context)
        });

        ScanOutcome { scanned, result }
    }

    /// Batch 2: move the watermark past everything `outcome` scanned.
    ///
    /// Returns the reduce error if there was one; otherwise the error of this
    /// batch, if any.
    pub fn advance_watermark(&self, index: &str, outcome: ScanOutcome) -> Result<(), IndexingError> {
        let Some(last) = last_by_etag(&outcome.scanned) else {
            return outcome.result.map(|_| ());
        };
        let (etag, timestamp) = (last.etag, last.timestamp);
        let succeeded = outcome.result.is_ok();

        let advanced = self.context.storage().batch(|actions| {
            actions.update_last_reduced(index, etag, timestamp);
            actions.record_reduce_outcome(index, succeeded);
            Ok::<_, IndexingError>(())
        });

        match (outcome.result, advanced) {
            (Ok(written), Ok(())) => {
                debug!(
                    index = %index,
                    scanned = outcome.scanned.len(),
                    written = written,
                    etag = %etag,
                    "Reduced index"
                );
                Ok(())
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => {
                warn!(index = %index, etag = %etag, "Reduce failed, watermark advanced past the failed batch");
                Err(e)
            }
            (Err(e), Err(watermark_error)) => {
                error!(index = %index, error = %watermark_error, "Failed to advance reduce watermark");
                Err(e)
            }
        }
    }
}

impl IndexingExecutor for ReducingExecutor {
    fn name(&self) -> &str {
        "reduce"
    }

    fn context(&self) -> &WorkContext {
        &self.context
    }

    fn is_index_stale(&self, stats: &IndexStats) -> Result<bool, IndexingError> {
        Ok(self
            .context
            .storage()
            .batch(|actions| actions.is_reduce_stale(&stats.name))?)
    }

    fn is_valid_index(&self, stats: &IndexStats) -> bool {
        match self.context.definitions().get_index_definition(&stats.name) {
            Ok(Some(definition)) => definition.is_map_reduce(),
            Ok(None) => false,
            Err(e) => {
                warn!(index = %stats.name, error = %e, "Failed to load index definition");
                false
            }
        }
    }

    fn get_index_to_work_on(&self, stats: &IndexStats) -> IndexToWorkOn {
        IndexToWorkOn::new(stats.name.clone(), stats.last_reduced_etag)
    }

    fn handle_work_for_index(&self, work: &IndexToWorkOn) -> Result<(), IndexingError> {
        let outcome = self.scan_and_reduce(work);
        self.advance_watermark(&work.index_name, outcome)
    }

    fn flush_all_indexes(&self) -> Result<(), IndexingError> {
        self.context.index_storage().flush_reduce_indexes()?;
        Ok(())
    }
}

/// The row with the highest etag, comparing only the first and last rows.
///
/// Scans come from one forward iteration over etag-ordered keys, so the
/// extremes are always at the boundaries.
pub fn last_by_etag(rows: &[MappedResultInfo]) -> Option<&MappedResultInfo> {
    let first = rows.first()?;
    let last = rows.last()?;
    if last.etag >= first.etag {
        Some(last)
    } else {
        Some(first)
    }
}

/// Unique key/group pairs of `rows`, in first-seen order.
pub fn distinct_reduce_keys(rows: &[MappedResultInfo]) -> Vec<ReduceKeyAndGroupId> {
    let mut seen = HashSet::new();
    rows.iter()
        .map(MappedResultInfo::reduce_key_and_group)
        .filter(|key| seen.insert(key.clone()))
        .collect()
}
