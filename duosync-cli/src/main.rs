//! duosync CLI - local-first storage with a cloud replica
//!
//! Every command loads `~/.duosync/config.toml` (plus `.env` and `DUOSYNC_*`
//! overrides), opens the local and cloud pools, runs, and closes them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use duosync_core::{load_dotenv, DatabaseManager, DuosyncConfig};
use tracing::debug;

mod commands;
mod config;
mod tracing_setup;

#[derive(Parser, Debug)]
#[command(
    name = "duosync",
    author,
    version,
    about = "Local-first SQLite storage mirrored to a cloud Postgres replica",
    long_about = "Writes land in the local store first and are mirrored to the cloud \
                  when it is reachable. `duosync sync` reconciles whatever the mirror missed."
)]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides)
    #[arg(long, global = true)]
    debug: bool,

    /// Export traces over OTLP (requires the telemetry feature)
    #[arg(long, global = true)]
    otel: bool,

    /// Config file to use instead of ~/.duosync/config.toml
    #[arg(long, short = 'c', global = true, env = "DUOSYNC_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage duosync configuration (path, show, validate, init)
    Config(config::ConfigArgs),
    #[command(flatten)]
    Store(StoreCommands),
}

/// Commands that open the stores
#[derive(Subcommand, Debug)]
enum StoreCommands {
    /// Create the change_log and sync_status tables on both stores
    Init,
    /// Run raw SQL against the local store (mirrored to the cloud with --write)
    Query(commands::records::QueryArgs),
    /// Insert a record
    Insert(commands::records::InsertArgs),
    /// Fetch one record by id
    Get(commands::records::GetArgs),
    /// Update fields of a record
    Update(commands::records::UpdateArgs),
    /// Delete a record
    Delete(commands::records::DeleteArgs),
    /// Show the change history of a record
    History(commands::records::GetArgs),
    /// Reconcile local and cloud change logs
    Sync(commands::sync::SyncArgs),
    /// Show recent sync outcomes
    Status(commands::sync::StatusArgs),
    /// Check that both stores answer
    Health,
}

fn load_config(path: Option<&PathBuf>) -> Result<DuosyncConfig> {
    let config = match path {
        Some(path) => DuosyncConfig::load_from(path),
        None => DuosyncConfig::load(),
    }
    .context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    let command = match cli.command {
        Commands::Config(args) => return config::run_config(args, cli.config.as_deref()),
        Commands::Store(command) => command,
    };

    let config = load_config(cli.config.as_ref())?;
    let db = Arc::new(DatabaseManager::new(&config).context("failed to set up connection pools")?);

    let result = match command {
        StoreCommands::Init => commands::run_init(&db).await,
        StoreCommands::Query(args) => commands::records::run_query(&db, args).await,
        StoreCommands::Insert(args) => commands::records::run_insert(&db, args).await,
        StoreCommands::Get(args) => commands::records::run_get(&db, args).await,
        StoreCommands::Update(args) => commands::records::run_update(&db, args).await,
        StoreCommands::Delete(args) => commands::records::run_delete(&db, args).await,
        StoreCommands::History(args) => commands::records::run_history(&db, args).await,
        StoreCommands::Sync(args) => commands::sync::run_sync(db.clone(), &config, args).await,
        StoreCommands::Status(args) => commands::sync::run_status(db.clone(), &config, args).await,
        StoreCommands::Health => commands::run_health(&db).await,
    };

    db.close().await;
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_files = load_dotenv();
    let cli = Cli::parse();
    tracing_setup::init(&tracing_setup::TracingConfig {
        debug: cli.debug,
        otel: cli.otel,
    })
    .ok();
    debug!(files = ?env_files, "loaded env files");

    let result = run(cli).await;
    tracing_setup::shutdown_otel();
    result
}
