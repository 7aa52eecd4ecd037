//! docdb daemon library exports.
//!
//! # Modules
//!
//! - `cli`: Command-line argument parsing with clap
//! - `commands`: Command implementations (run, stats)

pub mod cli;
pub mod commands;

pub use cli::{Cli, Commands};
pub use commands::{build_reduce_pass, load_settings, run_indexer, run_pass_loop, show_stats, Overrides};
