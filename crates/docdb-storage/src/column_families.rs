//! Column family definitions for RocksDB.
//!
//! - mapped_results: mapped-result metadata keyed by index + etag
//! - mapped_result_data: mapped-result payloads, same keys as mapped_results
//! - mapped_results_by_key: secondary index (index, reduce key, group, etag)
//! - index_stats: per-index statistics and reduce watermark
//! - index_definitions: stored index definitions
//! - reduce_results: reduced output per index/key/group
//! - metadata: storage-wide counters

use rocksdb::{ColumnFamilyDescriptor, Options};

pub const CF_MAPPED_RESULTS: &str = "mapped_results";

pub const CF_MAPPED_RESULT_DATA: &str = "mapped_result_data";

pub const CF_MAPPED_RESULTS_BY_KEY: &str = "mapped_results_by_key";

pub const CF_INDEX_STATS: &str = "index_stats";

pub const CF_INDEX_DEFINITIONS: &str = "index_definitions";

pub const CF_REDUCE_RESULTS: &str = "reduce_results";

pub const CF_METADATA: &str = "metadata";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[
    CF_MAPPED_RESULTS,
    CF_MAPPED_RESULT_DATA,
    CF_MAPPED_RESULTS_BY_KEY,
    CF_INDEX_STATS,
    CF_INDEX_DEFINITIONS,
    CF_REDUCE_RESULTS,
    CF_METADATA,
];

/// Payloads are the bulk of the data and are read only by reduce tasks.
fn payload_options() -> Options {
    let mut opts = Options::default();
    opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
    opts
}

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    vec![
        ColumnFamilyDescriptor::new(CF_MAPPED_RESULTS, Options::default()),
        ColumnFamilyDescriptor::new(CF_MAPPED_RESULT_DATA, payload_options()),
        ColumnFamilyDescriptor::new(CF_MAPPED_RESULTS_BY_KEY, Options::default()),
        ColumnFamilyDescriptor::new(CF_INDEX_STATS, Options::default()),
        ColumnFamilyDescriptor::new(CF_INDEX_DEFINITIONS, Options::default()),
        ColumnFamilyDescriptor::new(CF_REDUCE_RESULTS, payload_options()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
    ]
}
