//! Pending Transaction Reaper
//!
//! Background worker that finds transactions stuck in `pending` (the engine
//! crashed, or a compensation could not be confirmed) and reverses them.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::ReaperConfig;
use super::engine::TransactionEngine;
use super::error::TransactionResult;

/// Compensates stale pending transactions
///
/// Each scan takes up to `batch_size` pending transactions created more than
/// `stale_threshold_secs` ago, oldest first, reverses every money leg they
/// may have applied and marks them `failed`. A transaction whose reversal
/// fails stays pending and is retried on the next scan.
pub struct TransactionReaper {
    engine: Arc<TransactionEngine>,
    config: ReaperConfig,
}

impl TransactionReaper {
    pub fn new(engine: Arc<TransactionEngine>, config: ReaperConfig) -> Self {
        Self { engine, config }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            scan_interval_secs = self.config.scan_interval_secs,
            stale_threshold_secs = self.config.stale_threshold_secs,
            "Starting transaction reaper"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.scan_interval()) => {
                    if let Err(e) = self.scan_and_recover().await {
                        error!(error = %e, "Reaper scan failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Transaction reaper stopped");
    }

    /// Run a single scan; returns how many transactions were reversed
    pub async fn scan_and_recover(&self) -> TransactionResult<usize> {
        let stale = self
            .engine
            .stale_pending(
                self.config.stale_threshold(),
                self.config.batch_size,
                Utc::now(),
            )
            .await?;

        if stale.is_empty() {
            debug!("No stale transactions found");
            return Ok(0);
        }
        info!(count = stale.len(), "Found stale pending transactions");

        let mut recovered = 0;
        for tx in &stale {
            match self.engine.compensate(tx).await {
                Ok(done) => {
                    info!(
                        transaction_id = %done.id,
                        reference = %done.reference,
                        status = %done.status,
                        "Stale transaction reversed"
                    );
                    recovered += 1;
                }
                Err(e) => {
                    warn!(
                        transaction_id = %tx.id,
                        error = %e,
                        "Failed to reverse stale transaction, will retry"
                    );
                }
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::topics;
    use crate::transactions::AdapterError;
    use crate::transactions::TransactionStatus;
    use crate::transactions::engine::test_support::Harness;
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn immediate() -> ReaperConfig {
        ReaperConfig {
            scan_interval_secs: 1,
            stale_threshold_secs: 0,
            batch_size: 10,
        }
    }

    /// Leaves one transfer pending with the sender already debited
    async fn stuck(h: &Harness) {
        h.fund("acc-a", 100).await;
        h.faults
            .set_fail_credit(Some(AdapterError::Unavailable("timeout".into())));
        h.faults
            .set_fail_reverse(Some(AdapterError::Unavailable("timeout".into())));
        assert!(
            h.engine
                .transfer("acc-a", &Harness::transfer_req(10, "K1"))
                .await
                .is_err()
        );
        h.faults.set_fail_credit(None);
    }

    #[tokio::test]
    async fn test_scan_reverses_stale_pending() {
        let h = Harness::new().await;
        stuck(&h).await;
        assert_eq!(h.balance("acc-a").await, Decimal::from(90));
        h.faults.set_fail_reverse(None);

        let engine = h.engine.clone();
        let reaper = TransactionReaper::new(engine.clone(), immediate());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(reaper.scan_and_recover().await.unwrap(), 1);
        assert_eq!(h.wallets.wallet("wallet-acc-a").await.unwrap().balance, Decimal::from(100));

        // Nothing left to do
        assert_eq!(reaper.scan_and_recover().await.unwrap(), 0);

        let page = engine
            .history_for_account("acc-a", "acc-a", &Default::default())
            .await
            .unwrap();
        assert_eq!(page.transactions[0].status, TransactionStatus::Failed);
        assert_eq!(
            page.transactions[0].failed_reason.as_deref(),
            Some("Transaction timed out and was reversed")
        );

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(h.broker.records(topics::TRANSACTION_FAILED).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_reversal_stays_pending() {
        let h = Harness::new().await;
        stuck(&h).await;
        let reaper = TransactionReaper::new(h.engine.clone(), immediate());
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(reaper.scan_and_recover().await.unwrap(), 0);
        assert_eq!(h.wallets.wallet("wallet-acc-a").await.unwrap().balance, Decimal::from(90));

        h.faults.set_fail_reverse(None);
        assert_eq!(reaper.scan_and_recover().await.unwrap(), 1);
        assert_eq!(h.wallets.wallet("wallet-acc-a").await.unwrap().balance, Decimal::from(100));
    }

    #[tokio::test]
    async fn test_fresh_pending_is_left_alone() {
        let h = Harness::new().await;
        stuck(&h).await;
        h.faults.set_fail_reverse(None);
        let reaper = TransactionReaper::new(
            h.engine.clone(),
            ReaperConfig {
                stale_threshold_secs: 3600,
                ..immediate()
            },
        );
        assert_eq!(reaper.scan_and_recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = Harness::new().await;
        let reaper = TransactionReaper::new(h.engine.clone(), immediate());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reaper.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
