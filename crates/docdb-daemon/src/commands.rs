//! Command implementations for the docdb daemon.
//!
//! Handles:
//! - run: Load config, open storage, run reduce passes until shutdown
//! - stats: Print stored index stats

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use docdb_indexing::{ExecutorConfig, IndexingPass, PassSummary, ReducingExecutor, WorkContext};
use docdb_storage::Storage;
use docdb_types::Settings;

/// CLI values applied on top of loaded settings.
#[derive(Debug, Default, Clone)]
pub struct Overrides<'a> {
    pub db_path: Option<&'a str>,
    pub max_parallel: Option<usize>,
    pub interval_ms: Option<u64>,
    pub log_level: Option<&'a str>,
}

/// Load settings (defaults -> file -> env) and apply CLI overrides last.
pub fn load_settings(config_path: Option<&str>, overrides: &Overrides<'_>) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;

    if let Some(db_path) = overrides.db_path {
        settings.db_path = db_path.to_string();
    }
    if let Some(max_parallel) = overrides.max_parallel {
        settings.max_number_of_parallel_index_tasks = max_parallel;
    }
    if let Some(interval_ms) = overrides.interval_ms {
        settings.pass_interval_ms = interval_ms;
    }
    if let Some(log_level) = overrides.log_level {
        settings.log_level = log_level.to_string();
    }

    settings.validate().context("Invalid configuration")?;
    Ok(settings)
}

fn init_logging(settings: &Settings) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

fn open_storage(settings: &Settings) -> Result<Arc<Storage>> {
    let db_path = settings.expanded_db_path();
    info!("Opening storage at {:?}", db_path);

    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let storage = Storage::open(&db_path).context("Failed to open storage")?;
    Ok(Arc::new(storage))
}

/// Build the reduce pass over `storage`.
pub fn build_reduce_pass(storage: Arc<Storage>, settings: &Settings) -> IndexingPass<ReducingExecutor> {
    let context = Arc::new(WorkContext::new(storage, ExecutorConfig::from(settings)));
    IndexingPass::new(Arc::new(ReducingExecutor::new(context)))
}

/// Run the reduce indexer.
///
/// 1. Load configuration (defaults -> file -> env -> CLI)
/// 2. Open RocksDB storage
/// 3. Run one pass, or passes on an interval until SIGINT/SIGTERM
/// 4. Flush storage before exiting
pub async fn run_indexer(config_path: Option<&str>, once: bool, overrides: Overrides<'_>) -> Result<()> {
    let settings = load_settings(config_path, &overrides)?;
    init_logging(&settings)?;

    info!("docdb reduce indexer starting...");
    info!("Configuration:");
    info!("  Database path: {}", settings.db_path);
    info!("  Max parallel index tasks: {}", settings.max_number_of_parallel_index_tasks);
    info!("  Pass interval: {}ms", settings.pass_interval_ms);
    info!("  Log level: {}", settings.log_level);

    let storage = open_storage(&settings)?;
    let pass = build_reduce_pass(storage.clone(), &settings);

    if once {
        let summary = pass.execute().await.context("Reduce pass failed")?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        let shutdown = CancellationToken::new();
        tokio::spawn(forward_shutdown_signal(shutdown.clone()));
        let passes = run_pass_loop(
            &pass,
            Duration::from_millis(settings.pass_interval_ms),
            shutdown,
        )
        .await;
        info!(passes = passes, "Reduce indexer stopped");
    }

    storage.flush().context("Failed to flush storage")?;
    Ok(())
}

/// Run passes every `interval` until `shutdown` is cancelled.
///
/// A pass in progress is always allowed to finish. Returns the number of
/// passes started.
pub async fn run_pass_loop(
    pass: &IndexingPass<ReducingExecutor>,
    interval: Duration,
    shutdown: CancellationToken,
) -> usize {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut passes = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                passes += 1;
                match pass.execute().await {
                    Ok(summary) => log_summary(&summary),
                    Err(e) => error!(error = %e, "Reduce pass failed"),
                }
            }
        }
    }
    passes
}

fn log_summary(summary: &PassSummary) {
    if summary.did_work() {
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            flushed = summary.flushed,
            "Reduce pass finished"
        );
    }
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM.
async fn forward_shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
    shutdown.cancel();
}

/// Print every index's stats as JSON.
pub fn show_stats(config_path: Option<&str>, db_path: Option<&str>) -> Result<()> {
    let overrides = Overrides {
        db_path,
        ..Default::default()
    };
    let settings = load_settings(config_path, &overrides)?;
    let storage = open_storage(&settings)?;
    let stats = storage.all_index_stats().context("Failed to read index stats")?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use docdb_storage::IndexDefinitionStorage;
    use docdb_types::{Etag, IndexDefinition, ReduceDefinition};

    fn test_settings(dir: &tempfile::TempDir, max_parallel: usize) -> Settings {
        let db_path = dir.path().join("db");
        let overrides = Overrides {
            db_path: db_path.to_str(),
            max_parallel: Some(max_parallel),
            ..Default::default()
        };
        load_settings(None, &overrides).unwrap()
    }

    #[test]
    fn test_overrides_win() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = test_settings(&dir, 3);
        assert_eq!(settings.max_number_of_parallel_index_tasks, 3);
        assert!(settings.db_path.ends_with("db"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let overrides = Overrides {
            interval_ms: Some(0),
            ..Default::default()
        };
        assert!(load_settings(None, &overrides).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pass_loop_reduces_and_stops_on_shutdown() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = test_settings(&dir, 2);
        let storage = open_storage(&settings).unwrap();

        IndexDefinitionStorage::new(storage.clone())
            .add_index(IndexDefinition::map_reduce("orders", "", ReduceDefinition::Count))
            .unwrap();
        storage
            .batch(|actions| {
                actions.put_mapped_result("orders", "customers/1", 0, serde_json::json!({}), Utc::now())
            })
            .unwrap();
        let etag = storage.last_etag();

        let pass = build_reduce_pass(storage.clone(), &settings);
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stopper.cancel();
        });

        let passes = run_pass_loop(&pass, Duration::from_millis(20), shutdown).await;
        assert!(passes >= 1);

        let stats = storage.get_index_stats("orders").unwrap().unwrap();
        assert_eq!(stats.last_reduced_etag, Some(etag));
        assert_ne!(etag, Etag::ZERO);
    }
}
