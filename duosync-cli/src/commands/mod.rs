//! Command implementations that need an open [`DatabaseManager`]

pub mod records;
pub mod sync;

use anyhow::{bail, Context, Result};
use duosync_core::DatabaseManager;

pub async fn run_init(db: &DatabaseManager) -> Result<()> {
    db.init_schema()
        .await
        .context("failed to create bookkeeping tables")?;
    println!("✅ change_log and sync_status ready on {}", db.primary().endpoint());
    if let Some(cloud) = db.secondary() {
        println!("   cloud: {}", cloud.endpoint());
    }
    Ok(())
}

pub async fn run_health(db: &DatabaseManager) -> Result<()> {
    let report = db.health().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.local.reachable {
        bail!("local store {} is unreachable", report.local.endpoint);
    }
    Ok(())
}
