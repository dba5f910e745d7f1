use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use crate::events::consumer::ConsumerSettings;
use crate::events::producer::ProducerConfig;
use crate::fraud::FraudConfig;
use crate::transactions::TransactionsConfig;
use crate::wallet::WalletConfig;

/// Which service(s) a process hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Users,
    Wallets,
    Transactions,
    Fraud,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 4] = [
        ServiceKind::Users,
        ServiceKind::Wallets,
        ServiceKind::Transactions,
        ServiceKind::Fraud,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Users => "users",
            ServiceKind::Wallets => "wallets",
            ServiceKind::Transactions => "transactions",
            ServiceKind::Fraud => "fraud",
        }
    }

    /// Prefix of the per-service `*_REDIS_PASSWORD` / `*_REDIS_PORT` variables.
    fn env_prefix(&self) -> &'static str {
        match self {
            ServiceKind::Users => "USER",
            ServiceKind::Wallets => "WALLET",
            ServiceKind::Transactions => "TRANSACTION",
            ServiceKind::Fraud => "FRAUD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "users" | "user" => Some(ServiceKind::Users),
            "wallets" | "wallet" => Some(ServiceKind::Wallets),
            "transactions" | "transaction" => Some(ServiceKind::Transactions),
            "fraud" | "fraud-detection" => Some(ServiceKind::Fraud),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// `local` or `prod`
    pub environment: String,
    pub storage: StorageConfig,
    pub bus: BusConfig,
    pub services: ServicesConfig,
    pub auth: AuthConfig,
    pub fraud: FraudConfig,
    pub wallet: WalletConfig,
    pub transactions: TransactionsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "omni.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            environment: "local".to_string(),
            storage: StorageConfig::default(),
            bus: BusConfig::default(),
            services: ServicesConfig::default(),
            auth: AuthConfig::default(),
            fraud: FraudConfig::default(),
            wallet: WalletConfig::default(),
            transactions: TransactionsConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Redis,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
        }
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) if !pw.is_empty() => {
                format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db)
            }
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    pub redis: RedisConfig,
    /// Per-service overrides keyed by service name (`users`, `wallets`, ...)
    pub per_service: HashMap<String, RedisConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            redis: RedisConfig::default(),
            per_service: HashMap::new(),
        }
    }
}

impl StorageConfig {
    pub fn redis_for(&self, service: ServiceKind) -> RedisConfig {
        self.per_service
            .get(service.as_str())
            .cloned()
            .unwrap_or_else(|| self.redis.clone())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BusConfig {
    pub backend: BackendKind,
    pub redis: RedisConfig,
    pub partitions: u32,
    pub replication_factor: u16,
    pub provision_attempts: u32,
    pub provision_backoff_ms: u64,
    pub producer: ProducerConfig,
    pub consumer: ConsumerSettings,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            redis: RedisConfig::default(),
            partitions: 3,
            replication_factor: 1,
            provision_attempts: 5,
            provision_backoff_ms: 2000,
            producer: ProducerConfig::default(),
            consumer: ConsumerSettings::default(),
        }
    }
}

impl BusConfig {
    pub fn provision_backoff(&self) -> Duration {
        Duration::from_millis(self.provision_backoff_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServicesConfig {
    pub host: String,
    pub users_port: u16,
    pub wallets_port: u16,
    pub transactions_port: u16,
    pub fraud_port: u16,
    pub user_service_url: String,
    pub wallet_service_url: String,
    pub fraud_detection_url: String,
    pub http_timeout_ms: u64,
    pub fraud_timeout_ms: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            users_port: 8080,
            wallets_port: 8082,
            transactions_port: 8083,
            fraud_port: 8085,
            user_service_url: "http://users:8080".to_string(),
            wallet_service_url: "http://wallets:8082".to_string(),
            fraud_detection_url: "http://fraud-detection-service:8085".to_string(),
            http_timeout_ms: 10_000,
            fraud_timeout_ms: 5_000,
        }
    }
}

impl ServicesConfig {
    pub fn port_of(&self, service: ServiceKind) -> u16 {
        match service {
            ServiceKind::Users => self.users_port,
            ServiceKind::Wallets => self.wallets_port,
            ServiceKind::Transactions => self.transactions_port,
            ServiceKind::Fraud => self.fraud_port,
        }
    }

    pub fn set_port(&mut self, service: ServiceKind, port: u16) {
        match service {
            ServiceKind::Users => self.users_port = port,
            ServiceKind::Wallets => self.wallets_port = port,
            ServiceKind::Transactions => self.transactions_port = port,
            ServiceKind::Fraud => self.fraud_port = port,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret for access and refresh tokens. Required by the Users service.
    pub jwt_secret: Option<String>,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    /// Defaults to `environment == "prod"` when unset.
    pub cookie_secure: Option<bool>,
    pub change_password_max_attempts: usize,
    pub change_password_window_secs: u64,
    pub rate_limit_per_sec: f64,
    pub rate_limit_burst: u32,
    pub visitor_idle_secs: u64,
    pub visitor_sweep_secs: u64,
    pub deletion_grace_days: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            access_ttl_secs: 15 * 60,
            refresh_ttl_secs: 7 * 24 * 60 * 60,
            cookie_secure: None,
            change_password_max_attempts: 5,
            change_password_window_secs: 15 * 60,
            rate_limit_per_sec: 1.0,
            rate_limit_burst: 3,
            visitor_idle_secs: 3 * 60,
            visitor_sweep_secs: 60,
            deletion_grace_days: 30,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let config: AppConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config yaml: {}", config_path))?;
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "prod"
    }

    pub fn cookie_secure(&self) -> bool {
        self.auth.cookie_secure.unwrap_or_else(|| self.is_production())
    }

    /// Overlay the recognised environment variables.
    ///
    /// `PORT` only applies when the process hosts a single service.
    pub fn apply_env(&mut self, single_service: Option<ServiceKind>) {
        self.apply_vars(|k| std::env::var(k).ok(), single_service);
    }

    fn apply_vars<F>(&mut self, var: F, single_service: Option<ServiceKind>)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(env) = var("ENVIRONMENT") {
            self.environment = env;
            // `prod` selects the remote backend unless MODE says otherwise
            if self.environment == "prod" {
                self.storage.backend = BackendKind::Redis;
            }
        }
        if let Some(mode) = var("MODE") {
            if mode == "memcached" {
                self.storage.backend = BackendKind::Memory;
            }
        }

        for service in ServiceKind::ALL {
            let prefix = service.env_prefix();
            let password = var(&format!("{}_REDIS_PASSWORD", prefix));
            let port = var(&format!("{}_REDIS_PORT", prefix)).and_then(|p| p.parse::<u16>().ok());
            if password.is_none() && port.is_none() {
                continue;
            }
            let base = self.storage.redis_for(service);
            let entry = self
                .storage
                .per_service
                .entry(service.as_str().to_string())
                .or_insert(base);
            if let Some(pw) = password {
                entry.password = Some(pw);
            }
            if let Some(port) = port {
                entry.port = port;
            }
        }

        if let Some(url) = var("USER_SERVICE_URL") {
            self.services.user_service_url = url;
        }
        if let Some(url) = var("WALLET_SERVICE_URL") {
            self.services.wallet_service_url = url;
        }
        if let Some(url) = var("FRAUD_DETECTION_URL") {
            self.services.fraud_detection_url = url;
        }
        if let (Some(service), Some(port)) = (
            single_service,
            var("PORT").and_then(|p| p.parse::<u16>().ok()),
        ) {
            self.services.set_port(service, port);
        }
        if let Some(key) = var("JWT_KEY") {
            if !key.is_empty() {
                self.auth.jwt_secret = Some(key);
            }
        }
    }
}
