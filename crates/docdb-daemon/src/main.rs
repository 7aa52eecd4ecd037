//! docdb indexing daemon
//!
//! Runs incremental reduce passes over the map-reduce indexes of a docdb
//! store.
//!
//! # Usage
//!
//! ```bash
//! docdb-daemon run [--once] [--db-path PATH] [--max-parallel N] [--interval-ms MS]
//! docdb-daemon stats [--db-path PATH]
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/docdb/config.toml)
//! 3. Environment variables (DOCDB_*)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use docdb_daemon::{run_indexer, show_stats, Cli, Commands, Overrides};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            once,
            db_path,
            max_parallel,
            interval_ms,
        } => {
            let overrides = Overrides {
                db_path: db_path.as_deref(),
                max_parallel,
                interval_ms,
                log_level: cli.log_level.as_deref(),
            };
            run_indexer(cli.config.as_deref(), once, overrides).await?;
        }
        Commands::Stats { db_path } => {
            show_stats(cli.config.as_deref(), db_path.as_deref())?;
        }
    }

    Ok(())
}
