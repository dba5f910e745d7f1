//! Fraud Detection
//!
//! Rules-only risk scorer with a short-lived memory of recent traffic.
//!
//! - [`rules`]: the rule trait and the canonical rule set
//! - [`memory`]: recent-transaction window feeding the velocity rules
//! - [`engine`]: scoring, level/decision mapping and recording
//! - [`janitor`]: periodic pruning of the window
//! - [`handlers`]: `POST /api/fraud-detection/assess`, `GET /health`

pub mod engine;
pub mod error;
pub mod handlers;
pub mod janitor;
pub mod memory;
pub mod model;
pub mod rules;

pub use engine::FraudEngine;
pub use error::{FraudError, FraudResult};
pub use memory::{HistoryEntry, TransactionMemory, Velocity};
pub use model::{Decision, RiskAssessmentRequest, RiskAssessmentResponse, RiskLevel};
pub use rules::{RiskRule, RuleContext, canonical_rules};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Thresholds and point values of the canonical rule set, score mapping and
/// window retention. Every constant the scorer uses lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FraudConfig {
    // === Amount rules ===
    pub very_large_amount: Decimal,
    pub very_large_points: u32,
    pub large_amount: Decimal,
    /// Upper bound of the "large" band. `None` leaves the band open-ended so
    /// crossing `very_large_amount` never drops points.
    pub large_amount_cap: Option<Decimal>,
    pub large_points: u32,
    pub structuring_min: Decimal,
    pub structuring_max: Decimal,
    pub structuring_points: u32,
    pub round_amount_min: Decimal,
    pub round_points: u32,
    pub tiny_amount_max: Decimal,
    pub tiny_points: u32,

    // === Velocity rules ===
    pub hourly_count_limit: usize,
    pub hourly_count_points: u32,
    pub daily_count_limit: usize,
    pub daily_count_points: u32,
    pub hourly_volume_limit: Decimal,
    pub hourly_volume_points: u32,
    pub daily_volume_limit: Decimal,
    pub daily_volume_points: u32,
    pub repeat_receiver_limit: usize,
    pub repeat_receiver_points: u32,

    // === Pattern rules ===
    pub keywords: Vec<String>,
    pub keyword_points: u32,
    pub undescribed_amount: Decimal,
    pub undescribed_points: u32,
    /// Local hours `[start, end)` considered unusual
    pub late_night_start: u32,
    pub late_night_end: u32,
    pub late_night_points: u32,
    pub self_transfer_points: u32,

    // === Score mapping ===
    pub medium_score: u32,
    pub high_score: u32,
    pub review_score: u32,
    pub decline_score: u32,

    // === Memory ===
    pub retention_secs: u64,
    pub max_entries: usize,
    pub janitor_interval_secs: u64,

    /// Let transfers through (flagged `unavailable`) when the scorer cannot be reached
    pub fail_open: bool,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            very_large_amount: Decimal::from(10_000),
            very_large_points: 30,
            large_amount: Decimal::from(5_000),
            large_amount_cap: Some(Decimal::from(10_000)),
            large_points: 15,
            structuring_min: Decimal::from(9_990),
            structuring_max: Decimal::new(999_999, 2),
            structuring_points: 20,
            round_amount_min: Decimal::from(1_000),
            round_points: 5,
            tiny_amount_max: Decimal::ONE,
            tiny_points: 8,

            hourly_count_limit: 10,
            hourly_count_points: 25,
            daily_count_limit: 50,
            daily_count_points: 15,
            hourly_volume_limit: Decimal::from(5_000),
            hourly_volume_points: 30,
            daily_volume_limit: Decimal::from(20_000),
            daily_volume_points: 20,
            repeat_receiver_limit: 5,
            repeat_receiver_points: 12,

            keywords: [
                "urgent",
                "emergency",
                "cash out",
                "withdraw all",
                "bitcoin",
                "crypto",
                "lottery",
                "prize",
                "winner",
                "tax refund",
                "irs",
                "government",
                "inheritance",
                "lawyer",
                "attorney",
                "court",
                "legal fees",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            keyword_points: 15,
            undescribed_amount: Decimal::from(1_000),
            undescribed_points: 10,
            late_night_start: 0,
            late_night_end: 5,
            late_night_points: 8,
            self_transfer_points: 100,

            medium_score: 25,
            high_score: 50,
            review_score: 50,
            decline_score: 70,

            retention_secs: 24 * 60 * 60,
            max_entries: 10_000,
            janitor_interval_secs: 60,

            fail_open: true,
        }
    }
}

impl FraudConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs.max(1))
    }

    pub fn level_for(&self, score: u32) -> RiskLevel {
        if score >= self.high_score {
            RiskLevel::High
        } else if score >= self.medium_score {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn decision_for(&self, score: u32) -> Decision {
        if score >= self.decline_score {
            Decision::Decline
        } else if score >= self.review_score {
            Decision::Review
        } else {
            Decision::Approve
        }
    }
}
