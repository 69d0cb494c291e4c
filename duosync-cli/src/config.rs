use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use duosync_core::DuosyncConfig;

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show config file path
    Path,
    /// Print the effective configuration (token masked)
    Show,
    /// Validate the effective configuration
    Validate,
    /// Write a default config file
    Init(InitArgs),
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Force overwrite existing config
    #[arg(long, short)]
    pub force: bool,
}

pub fn run_config(args: ConfigArgs, path: Option<&Path>) -> Result<()> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(DuosyncConfig::config_path);

    match args.command {
        ConfigCommands::Path => {
            println!("{}", path.display());
            Ok(())
        }
        ConfigCommands::Show => run_show(&path),
        ConfigCommands::Validate => run_validate(&path),
        ConfigCommands::Init(args) => run_init(&path, args),
    }
}

fn run_show(path: &Path) -> Result<()> {
    let config = DuosyncConfig::load_from(path).context("failed to load configuration")?;
    print!("{}", config.redacted().to_toml()?);
    Ok(())
}

fn run_validate(path: &Path) -> Result<()> {
    let config = DuosyncConfig::load_from(path).context("failed to load configuration")?;
    match config.validate() {
        Ok(()) => {
            println!("✅ Configuration is valid ({})", path.display());
            if !config.has_cloud() {
                println!("   ⚠ No cloud URL set; writes stay local and sync is unavailable");
            }
            Ok(())
        }
        Err(e) => {
            println!("❌ {}", e);
            bail!("configuration at {} is invalid", path.display())
        }
    }
}

fn run_init(path: &Path, args: InitArgs) -> Result<()> {
    if path.exists() && !args.force {
        bail!("Config already exists at {}\n\nUse --force to overwrite", path.display());
    }

    DuosyncConfig::default()
        .save_to(path)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    println!("✅ Created config at: {}", path.display());
    println!("\nNext steps:");
    println!("  1. Edit the config: $EDITOR {}", path.display());
    println!("  2. Set cloud.url (or DUOSYNC_CLOUD_URL) to your Postgres replica");
    println!("  3. Run: duosync init");
    Ok(())
}
