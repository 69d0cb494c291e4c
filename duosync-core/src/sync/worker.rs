//! Background sync loop

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::SyncEngine;

/// Runs `sync_all_tables` on a fixed interval until shut down
pub struct SyncWorker {
    engine: Arc<SyncEngine>,
    interval: Duration,
}

impl SyncWorker {
    pub fn new(engine: Arc<SyncEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Loop until `shutdown` flips to true or its sender is dropped.
    /// The first sync starts immediately.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "sync worker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("sync worker stopped");
    }

    /// One pass over every tracked table. Returns the number of failed tables.
    pub async fn run_once(&self) -> usize {
        match self.engine.sync_all_tables().await {
            Ok(results) => {
                let failed = results.values().filter(|r| r.error.is_some()).count();
                if failed > 0 {
                    warn!(tables = results.len(), failed, "sync pass finished with failures");
                } else {
                    info!(tables = results.len(), "sync pass finished");
                }
                failed
            }
            Err(e) => {
                error!(error = %e, "sync pass failed");
                1
            }
        }
    }
}
