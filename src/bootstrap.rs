//! Process wiring
//!
//! One process hosts any subset of the four services. Collaborators hosted in
//! the same process are called in-process; the others over HTTP. Every
//! background worker and server shares one shutdown channel.

use anyhow::{Context, Result, bail};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use utoipa::OpenApi;

use crate::config::{AppConfig, ServiceKind};
use crate::events::{self, ConsumerRunner, EventBus, EventProducer, ensure_topics, topics};
use crate::fraud::FraudEngine;
use crate::fraud::handlers::FraudApiDoc;
use crate::fraud::janitor::MemoryJanitor;
use crate::gateway::{self, TokenKeys};
use crate::storage::{Store, open_store};
use crate::transactions::adapters::{
    HttpRiskAssessor, HttpUserDirectory, HttpWalletGateway, LocalRiskAssessor,
    LocalUserDirectory, LocalWalletGateway,
};
use crate::transactions::handlers::TransactionApiDoc;
use crate::transactions::{
    Adapters, RiskAssessor, TransactionEngine, TransactionReaper, UserDirectory, WalletGateway,
};
use crate::users::handlers::UserApiDoc;
use crate::users::{RateLimiter, UserService};
use crate::wallet::handlers::WalletApiDoc;
use crate::wallet::provisioner::CONSUMER_GROUP;
use crate::wallet::{WalletProvisioner, WalletService};

/// Service instances living in this process
#[derive(Default)]
struct Hosted {
    users: Option<Arc<UserService>>,
    wallets: Option<Arc<WalletService>>,
    fraud: Option<Arc<FraudEngine>>,
    transactions: Option<Arc<TransactionEngine>>,
}

/// Build every requested service, serve until Ctrl-C, then drain.
pub async fn run(config: AppConfig, services: Vec<ServiceKind>) -> Result<()> {
    if services.is_empty() {
        bail!("no service selected");
    }
    let names: Vec<&str> = services.iter().map(|s| s.as_str()).collect();
    info!(services = ?names, environment = %config.environment, "Starting services");

    let bus = events::open_bus(&config.bus).await?;
    let (producer, producer_task) = EventProducer::start(bus.clone(), &config.bus.producer)
        .context("Invalid producer configuration")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let needs_keys = services.iter().any(|s| *s != ServiceKind::Fraud);
    let keys = if needs_keys {
        let secret = config
            .auth
            .jwt_secret
            .clone()
            .filter(|s| !s.is_empty())
            .context("JWT_KEY must be set for the users, wallets and transactions services")?;
        Some(Arc::new(TokenKeys::new(&secret)))
    } else {
        None
    };

    let hosted = build_services(&config, &services, &bus, &producer, keys.clone()).await?;

    // ------------------------------------------------------------------------
    // Background workers
    // ------------------------------------------------------------------------

    if let Some(wallets) = &hosted.wallets {
        ensure_topics(
            bus.as_ref(),
            &topics::WALLET_INPUT_TOPICS,
            config.bus.partitions,
            config.bus.replication_factor,
            config.bus.provision_attempts,
            config.bus.provision_backoff(),
        )
        .await
        .context("Required topics are missing")?;

        let runner = ConsumerRunner::new(
            bus.clone(),
            CONSUMER_GROUP,
            WalletProvisioner::topics(),
            Arc::new(WalletProvisioner::new(wallets.clone())),
            config.bus.consumer.clone(),
        );
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = runner.run(rx).await {
                error!(error = %e, "Wallet provisioner stopped with error");
            }
        }));
    }

    if let Some(fraud) = &hosted.fraud {
        let janitor = MemoryJanitor::new(fraud.memory(), config.fraud.janitor_interval());
        tasks.push(tokio::spawn(janitor.run(shutdown_rx.clone())));
    }

    if let Some(engine) = &hosted.transactions {
        let reaper = TransactionReaper::new(engine.clone(), config.transactions.reaper.clone());
        tasks.push(tokio::spawn(reaper.run(shutdown_rx.clone())));
    }

    // ------------------------------------------------------------------------
    // HTTP servers
    // ------------------------------------------------------------------------

    let host = config.services.host.clone();
    for service in &services {
        let router = match (service, &keys) {
            (ServiceKind::Users, Some(_)) => {
                let Some(users) = hosted.users.clone() else {
                    continue;
                };
                let limiter = Arc::new(RateLimiter::new(
                    config.auth.rate_limit_per_sec,
                    config.auth.rate_limit_burst,
                    std::time::Duration::from_secs(config.auth.visitor_idle_secs),
                    std::time::Duration::from_secs(config.auth.visitor_sweep_secs),
                ));
                tasks.push(tokio::spawn(limiter.clone().run_janitor(shutdown_rx.clone())));
                crate::users::handlers::router(users, limiter, config.cookie_secure())
                    .merge(gateway::docs("users", UserApiDoc::openapi()))
            }
            (ServiceKind::Wallets, Some(keys)) => {
                let Some(wallets) = hosted.wallets.clone() else {
                    continue;
                };
                crate::wallet::handlers::router(wallets, keys.clone())
                    .merge(gateway::docs("wallets", WalletApiDoc::openapi()))
            }
            (ServiceKind::Transactions, Some(keys)) => {
                let Some(engine) = hosted.transactions.clone() else {
                    continue;
                };
                crate::transactions::handlers::router(engine, keys.clone())
                    .merge(gateway::docs("transactions", TransactionApiDoc::openapi()))
            }
            (ServiceKind::Fraud, _) => {
                let Some(fraud) = hosted.fraud.clone() else {
                    continue;
                };
                crate::fraud::handlers::router(fraud)
                    .merge(gateway::docs("fraud-detection", FraudApiDoc::openapi()))
            }
            (_, None) => continue,
        };

        let name = service.as_str();
        let port = config.services.port_of(*service);
        let host = host.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = gateway::serve(name, router, &host, port, rx).await {
                error!(service = name, error = %e, "HTTP server failed");
            }
        }));
    }
    drop(hosted);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Task ended abnormally");
        }
    }

    // the batcher drains once the last producer handle is gone
    drop(producer);
    match tokio::time::timeout(std::time::Duration::from_secs(10), producer_task).await {
        Ok(_) => info!("Event producer flushed"),
        Err(_) => warn!("Event producer did not flush in time"),
    }
    info!("All services stopped");
    Ok(())
}

/// Fraud and Users first, so Wallets and Transactions can call them in-process
async fn build_services(
    config: &AppConfig,
    services: &[ServiceKind],
    bus: &Arc<dyn EventBus>,
    producer: &EventProducer,
    keys: Option<Arc<TokenKeys>>,
) -> Result<Hosted> {
    let hosts = |kind: ServiceKind| services.contains(&kind);
    let mut hosted = Hosted::default();
    info!(backend = bus.backend(), "Event bus ready");

    if hosts(ServiceKind::Fraud) {
        hosted.fraud = Some(Arc::new(FraudEngine::new(config.fraud.clone())));
    }

    if hosts(ServiceKind::Users) {
        let store = Store::new(open_store(&config.storage, ServiceKind::Users).await?);
        let keys = keys.clone().context("users service needs token keys")?;
        hosted.users = Some(Arc::new(UserService::new(
            store,
            keys,
            producer.clone(),
            config.auth.clone(),
        )));
    }

    if hosts(ServiceKind::Wallets) {
        let store = Store::new(open_store(&config.storage, ServiceKind::Wallets).await?);
        hosted.wallets = Some(Arc::new(WalletService::new(
            store,
            config.wallet.clone(),
            producer.clone(),
        )));
    }

    if hosts(ServiceKind::Transactions) {
        let store = Store::new(open_store(&config.storage, ServiceKind::Transactions).await?);
        let adapters = adapters_for(config, &hosted)?;
        hosted.transactions = Some(Arc::new(TransactionEngine::new(
            store,
            adapters,
            producer.clone(),
            config.transactions.clone(),
            config.fraud.fail_open,
        )));
    }

    Ok(hosted)
}

fn adapters_for(config: &AppConfig, hosted: &Hosted) -> Result<Adapters> {
    let timeout = std::time::Duration::from_millis(config.services.http_timeout_ms);
    let fraud_timeout = std::time::Duration::from_millis(config.services.fraud_timeout_ms);

    let users: Arc<dyn UserDirectory> = match &hosted.users {
        Some(users) => Arc::new(LocalUserDirectory::new(users.clone())),
        None => Arc::new(HttpUserDirectory::new(
            &config.services.user_service_url,
            timeout,
        )?),
    };
    let wallets: Arc<dyn WalletGateway> = match &hosted.wallets {
        Some(wallets) => Arc::new(LocalWalletGateway::new(wallets.clone())),
        None => Arc::new(HttpWalletGateway::new(
            &config.services.wallet_service_url,
            timeout,
        )?),
    };
    let risk: Arc<dyn RiskAssessor> = match &hosted.fraud {
        Some(engine) => Arc::new(LocalRiskAssessor::new(engine.clone())),
        None => Arc::new(HttpRiskAssessor::new(
            &config.services.fraud_detection_url,
            fraud_timeout,
        )?),
    };
    info!(
        users = users.name(),
        wallets = wallets.name(),
        risk = risk.name(),
        "Transaction adapters wired"
    );
    Ok(Adapters {
        users,
        wallets,
        risk,
    })
}

/// `--service` value: one name, a comma list, or `all`
pub fn parse_services(arg: &str) -> Result<Vec<ServiceKind>> {
    if arg == "all" {
        return Ok(ServiceKind::ALL.to_vec());
    }
    let mut out = Vec::new();
    for part in arg.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some(kind) = ServiceKind::parse(part) else {
            bail!("unknown service: {}", part);
        };
        if !out.contains(&kind) {
            out.push(kind);
        }
    }
    if out.is_empty() {
        bail!("no service selected");
    }
    Ok(out)
}
