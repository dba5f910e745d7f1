//! Wallet & Virtual-Card service
//!
//! - [`service::WalletService`]: wallets, idempotent balance operations and
//!   the virtual-card lifecycle
//! - [`provisioner::WalletProvisioner`]: consumes `account-created` /
//!   `account-deletion-requested`
//! - [`handlers`]: public `/api/wallets/...` plus the `/internal/...` surface
//!   the transactions service drives over HTTP

pub mod card;
pub mod error;
pub mod handlers;
pub mod model;
pub mod provisioner;
pub mod service;
pub mod store;

pub use error::{WalletError, WalletResult};
pub use model::{
    BalanceChange, CardStatus, CardView, VirtualCard, Wallet, WalletStatus, WalletType, WalletView,
};
pub use provisioner::WalletProvisioner;
pub use service::WalletService;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Argon2 cost block for CVV hashing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CardKdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for CardKdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub default_daily_limit: Decimal,
    pub default_monthly_limit: Decimal,
    /// Leading digits of every generated card number
    pub card_issuer_prefix: String,
    pub card_validity_years: u32,
    pub default_name_on_card: String,
    /// Applied balance-operation ids remembered per wallet / card
    pub applied_ops_window: usize,
    pub kdf: CardKdfParams,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            default_daily_limit: Decimal::from(5000),
            default_monthly_limit: Decimal::from(20000),
            card_issuer_prefix: "4".to_string(),
            card_validity_years: 3,
            default_name_on_card: "Card Holder".to_string(),
            applied_ops_window: 512,
            kdf: CardKdfParams::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = WalletConfig::default();
        assert_eq!(cfg.default_daily_limit, Decimal::from(5000));
        assert_eq!(cfg.default_monthly_limit, Decimal::from(20000));
        assert_eq!(cfg.card_issuer_prefix, "4");
        assert_eq!(cfg.card_validity_years, 3);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg: WalletConfig = serde_yaml::from_str("card_validity_years: 5\n").unwrap();
        assert_eq!(cfg.card_validity_years, 5);
        assert_eq!(cfg.kdf, CardKdfParams::default());
    }
}
