//! Wallet Provisioner
//!
//! Consumes `account-created` and `account-deletion-requested`. Both handlers
//! are state-convergent, so redelivery after a crash between "processed" and
//! "committed" is harmless.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::error::WalletError;
use super::service::WalletService;
use crate::events::payloads::{AccountCreated, AccountDeletionRequested};
use crate::events::{EventHandler, HandlerError, Message, topics};

pub const CONSUMER_GROUP: &str = "wallet-service";

pub struct WalletProvisioner {
    service: Arc<WalletService>,
}

impl WalletProvisioner {
    pub fn new(service: Arc<WalletService>) -> Self {
        Self { service }
    }

    pub fn topics() -> Vec<String> {
        topics::WALLET_INPUT_TOPICS
            .iter()
            .map(|t| t.to_string())
            .collect()
    }
}

fn classify(e: WalletError) -> HandlerError {
    match e {
        WalletError::Storage(_) | WalletError::Internal(_) => HandlerError::Retryable(e.to_string()),
        other => HandlerError::Fatal(other.to_string()),
    }
}

#[async_trait]
impl EventHandler for WalletProvisioner {
    fn name(&self) -> &'static str {
        "wallet-provisioner"
    }

    async fn handle(&self, msg: &Message) -> Result<(), HandlerError> {
        match msg.topic.as_str() {
            topics::ACCOUNT_CREATED => {
                let event: AccountCreated = msg
                    .decode()
                    .map_err(|e| HandlerError::Fatal(format!("bad account-created payload: {}", e)))?;
                let out = self.service.provision_account(&event).await.map_err(classify)?;
                info!(
                    account_id = %event.account_id,
                    wallet_id = %out.wallet.wallet_id,
                    wallet_created = out.wallet_created,
                    card_created = out.card_created,
                    "Processed account-created"
                );
                Ok(())
            }
            topics::ACCOUNT_DELETION_REQUESTED => {
                let event: AccountDeletionRequested = msg.decode().map_err(|e| {
                    HandlerError::Fatal(format!("bad account-deletion-requested payload: {}", e))
                })?;
                self.service
                    .disable_account(&event.account_id)
                    .await
                    .map_err(classify)?;
                Ok(())
            }
            other => Err(HandlerError::Fatal(format!("unexpected topic {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Currency;
    use crate::events::{ConsumerRunner, ConsumerSettings, EventBus, EventProducer, ProducerConfig};
    use crate::storage::StorageError;
    use crate::wallet::model::{CardStatus, WalletStatus};
    use crate::wallet::service::test_support;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::sync::watch;

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify(WalletError::Storage(StorageError::Unavailable("down".into()))),
            HandlerError::Retryable(_)
        ));
        assert!(matches!(classify(WalletError::WalletNotFound), HandlerError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_bad_payload_is_fatal() {
        let (svc, _broker) = test_support::service();
        let handler = WalletProvisioner::new(Arc::new(svc));
        let msg = Message {
            topic: topics::ACCOUNT_CREATED.into(),
            partition: 0,
            offset: crate::events::Offset::Log(0),
            key: "k".into(),
            payload: b"{not json".to_vec(),
            headers: vec![],
        };
        assert!(matches!(handler.handle(&msg).await, Err(HandlerError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_consumes_account_events_end_to_end() {
        let (svc, broker) = test_support::service();
        let svc = Arc::new(svc);
        let bus: Arc<dyn EventBus> = Arc::new(broker.clone());
        let (producer, _task) = EventProducer::start(bus.clone(), &ProducerConfig::default()).unwrap();

        let (tx, rx) = watch::channel(false);
        let settings = ConsumerSettings {
            poll_interval_ms: 20,
            ..Default::default()
        };
        let runner = ConsumerRunner::new(
            bus,
            CONSUMER_GROUP,
            WalletProvisioner::topics(),
            Arc::new(WalletProvisioner::new(svc.clone())),
            settings,
        );
        let handle = tokio::spawn(runner.run(rx));

        let created = AccountCreated::for_test("acc-1");
        producer.emit("acc-1", &created).await.unwrap();
        // duplicate delivery
        producer.emit("acc-1", &created).await.unwrap();

        let mut wallet = None;
        for _ in 0..100 {
            if let Ok(w) = svc.default_wallet("acc-1").await {
                wallet = Some(w);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let wallet = wallet.expect("wallet provisioned");
        assert!(wallet.is_default);
        assert_eq!(wallet.status, WalletStatus::Active);
        assert_eq!(wallet.currency, Currency::Usd);

        producer
            .emit(
                "acc-1",
                &AccountDeletionRequested {
                    account_id: "acc-1".into(),
                    email: "a@x".into(),
                    requested_at: Utc::now(),
                    scheduled_deletion: Utc::now(),
                },
            )
            .await
            .unwrap();
        for _ in 0..100 {
            if svc.default_wallet("acc-1").await.unwrap().status == WalletStatus::Disabled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            svc.default_wallet("acc-1").await.unwrap().status,
            WalletStatus::Disabled
        );
        assert_eq!(svc.list_wallets("acc-1").await.unwrap().len(), 1);
        let cards = svc.list_cards("acc-1").await.unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].card_status, CardStatus::Active);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
