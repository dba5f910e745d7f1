//! Users service
//!
//! - [`service::UserService`]: registration, sign-in, refresh-token rotation,
//!   device sessions, profile, account deletion and KYC
//! - [`contacts`]: contact requests between omni-tags
//! - [`handlers`]: `/api/users/auth/...` plus the `/internal/users/...`
//!   lookup used by the transactions service
//! - [`rate_limit`]: per-IP token bucket in front of login and refresh
//!
//! `account-created` is emitted on registration and again on KYC approval;
//! the wallet provisioner treats the second one as an activation.

pub mod contacts;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod model;
pub mod password;
pub mod rate_limit;
pub mod service;
pub mod sessions;
pub mod store;

pub use error::{UserError, UserResult};
pub use model::{AccountStatus, Contact, ContactStatus, User};
pub use rate_limit::RateLimiter;
pub use service::UserService;
