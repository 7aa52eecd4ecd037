//! Incremental reduce indexing for docdb.
//!
//! This crate keeps the reduced output of map-reduce indexes in step with
//! their mapped results without rescanning them.
//!
//! ## Key Components
//!
//! - [`IndexingExecutor`]: phase hooks (validity, staleness, per-index work, flush)
//! - [`IndexingPass`]: one scheduling pass, sequential or bounded-parallel
//! - [`ReducingExecutor`]: the reduce phase, driven by the etag watermark
//! - [`ReduceTask`]: recomputes reduced rows for a set of key/group pairs
//! - [`WorkContext`]: storage views, worker budget, reduce functions, error log
//!
//! ## Example
//!
//! ```ignore
//! use docdb_indexing::{ExecutorConfig, IndexingPass, ReducingExecutor, WorkContext};
//!
//! let context = Arc::new(WorkContext::new(storage, ExecutorConfig::default()));
//! let pass = IndexingPass::new(Arc::new(ReducingExecutor::new(context)));
//! let summary = pass.execute().await?;
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod overlap;
pub mod reduce_task;
pub mod reducing;

pub use config::ExecutorConfig;
pub use context::{IndexingErrorRecord, WorkContext, MAX_RECENT_ERRORS};
pub use error::IndexingError;
pub use executor::{ExecutionMode, IndexingExecutor, IndexingPass, PassSummary};
pub use overlap::{OverlapGuard, RunGuard};
pub use reduce_task::{CountReduce, ReduceFunction, ReduceTask, SumReduce};
pub use reducing::{distinct_reduce_keys, last_by_etag, ReducingExecutor, ScanOutcome};
