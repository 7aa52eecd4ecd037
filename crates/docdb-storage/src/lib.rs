//! Storage layer for the docdb indexing engine.
//!
//! Provides RocksDB-backed storage with:
//! - Column family isolation for mapped results, payloads, stats and reduce output
//! - Etag-ordered keys for incremental scans past a watermark
//! - Atomic batches via WriteBatch ([`Storage::batch`])
//! - Watermark updates guarded against regression at commit time

pub mod actions;
pub mod column_families;
pub mod db;
pub mod error;
pub mod index_storage;
pub mod keys;

pub use actions::StorageActions;
pub use db::Storage;
pub use error::StorageError;
pub use index_storage::{IndexDefinitionStorage, IndexStorage};
