//! Generic indexing executor framework.
//!
//! An [`IndexingExecutor`] supplies the phase-specific hooks (validity,
//! staleness, per-index work, flush); [`IndexingPass`] drives one scheduling
//! pass over every known index:
//!
//! 1. Enumerate index stats and keep the valid, stale ones.
//! 2. Run the per-index handler sequentially, or fan out one task per index
//!    bounded by the context's worker budget.
//! 3. Join every task, then flush once if any index was handled.
//!
//! A failure in one index is logged and recorded; it never aborts the
//! others or the pass.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use docdb_types::{IndexStats, IndexToWorkOn};

use crate::context::WorkContext;
use crate::error::IndexingError;
use crate::overlap::OverlapGuard;

/// Phase-specific hooks driven by [`IndexingPass`].
///
/// All hooks are blocking; the pass calls them from blocking worker threads.
pub trait IndexingExecutor: Send + Sync + 'static {
    /// Phase name for logs.
    fn name(&self) -> &str;

    fn context(&self) -> &WorkContext;

    /// Whether the index has input this phase has not processed yet.
    fn is_index_stale(&self, stats: &IndexStats) -> Result<bool, IndexingError>;

    /// Whether this phase applies to the index at all.
    fn is_valid_index(&self, stats: &IndexStats) -> bool;

    fn get_index_to_work_on(&self, stats: &IndexStats) -> IndexToWorkOn;

    /// Bring one index up to date. Called at most once per index per pass.
    fn handle_work_for_index(&self, work: &IndexToWorkOn) -> Result<(), IndexingError>;

    fn flush_all_indexes(&self) -> Result<(), IndexingError>;
}

/// How the per-index work of a pass was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

/// Outcome of one [`IndexingPass::execute`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    /// Another pass was still running; nothing was done
    pub skipped: bool,
    pub candidates: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Sequential when there was nothing to fan out
    pub mode: ExecutionMode,
    pub flushed: bool,
    pub flush_error: Option<String>,
}

impl PassSummary {
    fn empty(skipped: bool) -> Self {
        Self {
            skipped,
            candidates: 0,
            succeeded: 0,
            failed: 0,
            mode: ExecutionMode::Sequential,
            flushed: false,
            flush_error: None,
        }
    }

    /// Whether any index was handled in this pass.
    pub fn did_work(&self) -> bool {
        self.succeeded + self.failed > 0
    }
}

/// Drives scheduling passes for one executor.
pub struct IndexingPass<E: IndexingExecutor> {
    executor: Arc<E>,
    guard: OverlapGuard,
}

impl<E: IndexingExecutor> IndexingPass<E> {
    pub fn new(executor: Arc<E>) -> Self {
        Self {
            executor,
            guard: OverlapGuard::new(),
        }
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    /// Whether a pass is in flight.
    pub fn is_running(&self) -> bool {
        self.guard.is_running()
    }

    /// Run one pass over every index.
    ///
    /// Returns immediately with `skipped: true` if a previous pass is still
    /// running. Per-index failures are reported in the summary, not as `Err`;
    /// `Err` means the pass could not enumerate its candidates.
    pub async fn execute(&self) -> Result<PassSummary, IndexingError> {
        let Some(_run) = self.guard.try_acquire() else {
            debug!(phase = %self.executor.name(), "Previous pass still running, skipping");
            return Ok(PassSummary::empty(true));
        };

        let executor = self.executor.clone();
        let candidates = tokio::task::spawn_blocking(move || collect_candidates(executor.as_ref()))
            .await
            .map_err(join_error)??;

        let mut summary = PassSummary::empty(false);
        summary.candidates = candidates.len();
        if candidates.is_empty() {
            debug!(phase = %self.executor.name(), "No stale indexes");
            return Ok(summary);
        }

        let max_parallel = self
            .executor
            .context()
            .config()
            .max_number_of_parallel_index_tasks;
        let outcomes = if max_parallel <= 1 || candidates.len() == 1 {
            summary.mode = ExecutionMode::Sequential;
            self.run_sequential(candidates).await
        } else {
            summary.mode = ExecutionMode::Parallel;
            self.run_parallel(candidates).await
        };

        for (index, result) in outcomes {
            match result {
                Ok(()) => summary.succeeded += 1,
                Err(e) => {
                    warn!(phase = %self.executor.name(), index = %index, error = %e, "Failed to index");
                    self.executor.context().record_error(&index, &e);
                    summary.failed += 1;
                }
            }
        }

        let executor = self.executor.clone();
        let flushed = tokio::task::spawn_blocking(move || executor.flush_all_indexes())
            .await
            .map_err(join_error)
            .and_then(|r| r);
        match flushed {
            Ok(()) => summary.flushed = true,
            Err(e) => {
                error!(phase = %self.executor.name(), error = %e, "Failed to flush indexes");
                summary.flush_error = Some(e.to_string());
            }
        }

        info!(
            phase = %self.executor.name(),
            mode = ?summary.mode,
            candidates = summary.candidates,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Indexing pass complete"
        );
        Ok(summary)
    }

    async fn run_sequential(
        &self,
        candidates: Vec<IndexToWorkOn>,
    ) -> Vec<(String, Result<(), IndexingError>)> {
        let mut outcomes = Vec::with_capacity(candidates.len());
        for work in candidates {
            let index = work.index_name.clone();
            let result = handle_blocking(self.executor.clone(), work).await;
            outcomes.push((index, result));
        }
        outcomes
    }

    async fn run_parallel(
        &self,
        candidates: Vec<IndexToWorkOn>,
    ) -> Vec<(String, Result<(), IndexingError>)> {
        let scheduler = self.executor.context().scheduler().clone();
        let mut join_set = JoinSet::new();

        for work in candidates {
            let executor = self.executor.clone();
            let scheduler = scheduler.clone();
            join_set.spawn(async move {
                let index = work.index_name.clone();
                let result = match scheduler.acquire_owned().await {
                    Ok(_permit) => handle_blocking(executor, work).await,
                    Err(_) => Err(IndexingError::Join("worker budget closed".to_string())),
                };
                (index, result)
            });
        }

        let mut outcomes = Vec::with_capacity(join_set.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                // Tasks only await the permit and the blocking handler; this is
                // a runtime shutdown, the index is picked up again next pass.
                Err(e) => error!(error = %e, "Index task did not complete"),
            }
        }
        outcomes
    }
}

fn collect_candidates<E: IndexingExecutor>(executor: &E) -> Result<Vec<IndexToWorkOn>, IndexingError> {
    let all_stats = executor.context().storage().all_index_stats()?;
    let mut candidates = Vec::new();
    for stats in &all_stats {
        if !executor.is_valid_index(stats) {
            continue;
        }
        match executor.is_index_stale(stats) {
            Ok(true) => candidates.push(executor.get_index_to_work_on(stats)),
            Ok(false) => {}
            Err(e) => {
                warn!(phase = %executor.name(), index = %stats.name, error = %e, "Staleness check failed, skipping index");
            }
        }
    }
    debug!(
        phase = %executor.name(),
        indexes = all_stats.len(),
        candidates = candidates.len(),
        "Collected indexes to work on"
    );
    Ok(candidates)
}

/// Run the handler for one index on a blocking thread, turning a panic into
/// an error for that index.
async fn handle_blocking<E: IndexingExecutor>(
    executor: Arc<E>,
    work: IndexToWorkOn,
) -> Result<(), IndexingError> {
    tokio::task::spawn_blocking(move || executor.handle_work_for_index(&work))
        .await
        .map_err(join_error)?
}

fn join_error(err: tokio::task::JoinError) -> IndexingError {
    if err.is_panic() {
        let payload = err.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        IndexingError::Panic(message)
    } else {
        IndexingError::from(err)
    }
}
