//! # docdb-types
//!
//! Shared domain types for the docdb indexing engine.
//!
//! - [`Etag`]: fixed-width, byte-ordered mutation identifiers
//! - Index metadata: [`IndexDefinition`], [`IndexStats`]
//! - Work descriptors: [`IndexToWorkOn`], [`MappedResultInfo`], [`ReduceKeyAndGroupId`]
//! - [`Settings`]: layered configuration

pub mod config;
pub mod error;
pub mod etag;
pub mod index;

pub use config::Settings;
pub use error::TypesError;
pub use etag::{Etag, ETAG_LEN};
pub use index::{
    IndexDefinition, IndexStats, IndexToWorkOn, MappedResult, MappedResultInfo,
    ReduceDefinition, ReduceKeyAndGroupId, ReducedResult,
};
