//! Sync commands: one-shot, per-table, watch mode, and status

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use duosync_core::{DatabaseManager, DuosyncConfig, SyncEngine, SyncWorker};
use tokio::sync::watch;
use tracing::info;

#[derive(Parser, Debug)]
pub struct SyncArgs {
    /// Sync only this table
    #[arg(long)]
    pub table: Option<String>,

    /// Keep syncing on an interval until Ctrl-C
    #[arg(long)]
    pub watch: bool,

    /// Seconds between passes in watch mode (default: sync.interval_secs)
    #[arg(long, value_name = "SECS", requires = "watch")]
    pub interval: Option<u64>,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Number of entries to show
    #[arg(long, short = 'n', default_value_t = 20)]
    pub limit: usize,

    /// Print entries as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run_sync(db: Arc<DatabaseManager>, config: &DuosyncConfig, args: SyncArgs) -> Result<()> {
    let mut engine = SyncEngine::from_config(db, &config.sync);
    if let Some(table) = &args.table {
        engine = engine.with_tracked_tables(vec![table.clone()]);
    }

    if args.watch {
        let interval = args
            .interval
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.sync.interval());
        if interval.is_zero() {
            bail!("--interval must be at least 1 second");
        }
        return watch_mode(Arc::new(engine), interval).await;
    }

    if let Some(table) = &args.table {
        let report = engine
            .sync_table(table)
            .await
            .with_context(|| format!("failed to sync {}", table))?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let results = engine.sync_all_tables().await.context("sync failed")?;
    println!("{}", serde_json::to_string_pretty(&results)?);

    let failed: Vec<&String> = results
        .iter()
        .filter(|(_, r)| r.error.is_some())
        .map(|(table, _)| table)
        .collect();
    if !failed.is_empty() {
        bail!("{} of {} tables failed to sync: {:?}", failed.len(), results.len(), failed);
    }
    Ok(())
}

async fn watch_mode(engine: Arc<SyncEngine>, interval: Duration) -> Result<()> {
    info!(policy = engine.policy_name(), interval_secs = interval.as_secs(), "watching for changes");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = SyncWorker::new(engine, interval).spawn(shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down sync worker");
    let _ = shutdown_tx.send(true);
    handle.await.context("sync worker panicked")?;
    Ok(())
}

pub async fn run_status(db: Arc<DatabaseManager>, config: &DuosyncConfig, args: StatusArgs) -> Result<()> {
    let engine = SyncEngine::from_config(db, &config.sync);
    let entries = engine
        .recent_status(args.limit)
        .await
        .context("failed to read sync status")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No sync runs recorded yet");
        return Ok(());
    }
    for entry in &entries {
        println!(
            "{}  {:<9}  {}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.status.as_str(),
            entry.message
        );
    }
    Ok(())
}
