//! CLI argument parsing for the docdb indexing daemon.
//!
//! CLI flags override all other config sources.

use clap::{Parser, Subcommand};

/// docdb indexing daemon
///
/// Keeps map-reduce index output up to date with mapped results.
#[derive(Parser, Debug)]
#[command(name = "docdb-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/docdb/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run reduce passes until interrupted
    Run {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,

        /// Override database path
        #[arg(long)]
        db_path: Option<String>,

        /// Override the number of indexes reduced concurrently
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Override the delay between passes, in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// Print index stats as JSON
    Stats {
        /// Override database path
        #[arg(long)]
        db_path: Option<String>,
    },
}
