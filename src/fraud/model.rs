use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use utoipa::ToSchema;

/// Risk assessment request, sent by the Transactions service before it
/// moves money.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessmentRequest {
    #[serde(default)]
    #[schema(example = "0b7f0d4e-1c1e-4c38-9d8d-2d9b4c1a7e11")]
    pub transaction_id: String,
    #[serde(default)]
    pub sender_account_id: String,
    #[serde(default)]
    pub receiver_account_id: String,
    #[serde(default)]
    #[schema(value_type = f64, example = 250.0)]
    pub amount: Decimal,
    #[serde(default)]
    #[schema(example = "USD")]
    pub currency: String,
    #[serde(default)]
    #[schema(example = "transfer")]
    pub transaction_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    #[schema(value_type = Object)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Review,
    Decline,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Review => "review",
            Decision::Decline => "decline",
        }
    }

    /// Only `decline` stops money movement in-line.
    pub fn blocks(&self) -> bool {
        matches!(self, Decision::Decline)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessmentResponse {
    pub transaction_id: String,
    /// 0-100
    #[schema(example = 35)]
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    pub decision: Decision,
    #[serde(default)]
    pub reasons: Vec<String>,
    pub assessed_at: DateTime<Utc>,
}
