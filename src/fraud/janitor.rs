//! Memory janitor
//!
//! Inserts already prune the window, but a quiet scorer would otherwise hold
//! stale entries (and their memory) until the next assessment.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use super::memory::TransactionMemory;

pub struct MemoryJanitor {
    memory: Arc<TransactionMemory>,
    interval: Duration,
}

impl MemoryJanitor {
    pub fn new(memory: Arc<TransactionMemory>, interval: Duration) -> Self {
        Self { memory, interval }
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting fraud memory janitor");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Fraud memory janitor stopped");
    }

    pub async fn sweep(&self) -> usize {
        let removed = self.memory.prune(Utc::now()).await;
        if removed > 0 {
            debug!(removed, "Pruned fraud memory");
        }
        removed
    }
}
