//! omni - wallets, virtual cards and transfers over a partitioned event bus
//!
//! Four services that can run as separate processes or together in one:
//!
//! - [`users`] - accounts, sessions, refresh-token rotation, contacts, KYC
//! - [`wallet`] - wallets, idempotent balance operations, virtual cards
//! - [`transactions`] - transfer and purchase pipelines with compensation
//! - [`fraud`] - in-line rule-based risk scoring
//!
//! Shared plumbing:
//!
//! - [`events`] - partitioned bus, batching producer, at-least-once consumer
//! - [`storage`] - key-value store with conditional writes and CAS updates
//! - [`gateway`] - HTTP errors, tokens, cookies and the server loop
//! - [`bootstrap`] - wires the services hosted by one process

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod logging;

pub mod events;
pub mod gateway;
pub mod storage;

pub mod fraud;
pub mod transactions;
pub mod users;
pub mod wallet;

pub mod bootstrap;

// Convenient re-exports at crate root
pub use config::{AppConfig, ServiceKind};
pub use core_types::{AccountId, Currency, KycStatus};
