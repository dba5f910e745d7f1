use chrono::{DateTime, Local, Timelike, Utc};
use std::sync::Arc;
use tracing::info;

use super::error::{FraudError, FraudResult};
use super::memory::{HistoryEntry, TransactionMemory};
use super::model::{Decision, RiskAssessmentRequest, RiskAssessmentResponse};
use super::rules::{RiskRule, RuleContext, canonical_rules};
use super::FraudConfig;

const NORMAL_REASON: &str = "Transaction within normal parameters";
const MAX_SCORE: u32 = 100;

/// Rule evaluation plus velocity memory.
///
/// Scoring itself is a pure function of the request and a snapshot of the
/// memory; the only write is recording a non-declined transaction afterwards.
pub struct FraudEngine {
    config: FraudConfig,
    rules: Vec<Arc<dyn RiskRule>>,
    memory: Arc<TransactionMemory>,
}

impl FraudEngine {
    pub fn new(config: FraudConfig) -> Self {
        let rules = canonical_rules(&config);
        Self::with_rules(config, rules)
    }

    /// Engine with a custom rule list (memory retention still from `config`).
    pub fn with_rules(config: FraudConfig, rules: Vec<Arc<dyn RiskRule>>) -> Self {
        let memory = Arc::new(TransactionMemory::new(
            config.retention(),
            config.max_entries,
        ));
        Self {
            config,
            rules,
            memory,
        }
    }

    pub fn config(&self) -> &FraudConfig {
        &self.config
    }

    pub fn memory(&self) -> Arc<TransactionMemory> {
        self.memory.clone()
    }

    pub fn validate(req: &RiskAssessmentRequest) -> FraudResult<()> {
        if req.transaction_id.trim().is_empty() {
            return Err(FraudError::MissingTransactionId);
        }
        if req.sender_account_id.trim().is_empty() {
            return Err(FraudError::MissingSenderAccountId);
        }
        if req.amount <= rust_decimal::Decimal::ZERO {
            return Err(FraudError::InvalidAmount);
        }
        Ok(())
    }

    pub async fn assess(&self, req: &RiskAssessmentRequest) -> FraudResult<RiskAssessmentResponse> {
        self.assess_at(req, Utc::now(), Local::now().hour()).await
    }

    /// Assess against an explicit clock.
    pub async fn assess_at(
        &self,
        req: &RiskAssessmentRequest,
        now: DateTime<Utc>,
        local_hour: u32,
    ) -> FraudResult<RiskAssessmentResponse> {
        Self::validate(req)?;

        let velocity = self
            .memory
            .velocity(&req.sender_account_id, &req.receiver_account_id, now)
            .await;
        let ctx = RuleContext {
            request: req,
            velocity: &velocity,
            local_hour,
        };

        let mut total: u32 = 0;
        let mut reasons = Vec::new();
        for rule in &self.rules {
            if let Some(reason) = rule.check(&ctx) {
                total = total.saturating_add(rule.points());
                reasons.push(reason);
            }
        }
        if reasons.is_empty() {
            reasons.push(NORMAL_REASON.to_string());
        }

        let risk_level = self.config.level_for(total);
        let risk_score = total.min(MAX_SCORE);
        let decision = self.config.decision_for(risk_score);

        info!(
            transaction_id = %req.transaction_id,
            score = risk_score,
            level = %risk_level,
            decision = %decision,
            reasons = reasons.len(),
            "Risk assessed"
        );

        // Declined probes must not inflate the sender's velocity counters
        if decision != Decision::Decline {
            self.memory
                .record(
                    HistoryEntry {
                        transaction_id: req.transaction_id.clone(),
                        sender_account_id: req.sender_account_id.clone(),
                        receiver_account_id: req.receiver_account_id.clone(),
                        amount: req.amount,
                        timestamp: now,
                    },
                    now,
                )
                .await;
        }

        Ok(RiskAssessmentResponse {
            transaction_id: req.transaction_id.clone(),
            risk_score,
            risk_level,
            decision,
            reasons,
            assessed_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fraud::model::RiskLevel;
    use crate::fraud::rules::FnRule;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    const NOON: u32 = 12;

    fn request(id: &str, amount: &str, description: &str) -> RiskAssessmentRequest {
        RiskAssessmentRequest {
            transaction_id: id.into(),
            sender_account_id: "acc-a".into(),
            receiver_account_id: "acc-b".into(),
            amount: Decimal::from_str(amount).unwrap(),
            currency: "USD".into(),
            transaction_type: "transfer".into(),
            description: description.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_normal_transaction() {
        let engine = FraudEngine::new(FraudConfig::default());
        let resp = engine
            .assess_at(&request("t1", "10", "hi"), Utc::now(), NOON)
            .await
            .unwrap();
        assert_eq!(resp.risk_score, 0);
        assert_eq!(resp.risk_level, RiskLevel::Low);
        assert_eq!(resp.decision, Decision::Approve);
        assert_eq!(resp.reasons, vec![NORMAL_REASON.to_string()]);
        assert_eq!(engine.memory().len().await, 1);
    }

    #[tokio::test]
    async fn test_structuring_is_declined_and_not_recorded() {
        let engine = FraudEngine::new(FraudConfig::default());
        let resp = engine
            .assess_at(&request("t2", "9995", "hi"), Utc::now(), NOON)
            .await
            .unwrap();
        // large 15 + structuring 20 + round 5 + hourly volume 30
        assert_eq!(resp.risk_score, 70);
        assert_eq!(resp.decision, Decision::Decline);
        assert!(resp.risk_level >= RiskLevel::Medium);
        assert!(resp.reasons.iter().any(|r| r.contains("possible structuring")));
        assert!(engine.memory().is_empty().await);
    }

    #[tokio::test]
    async fn test_self_transfer_caps_at_100() {
        let engine = FraudEngine::new(FraudConfig::default());
        let mut req = request("t3", "20000", "");
        req.receiver_account_id = req.sender_account_id.clone();
        let resp = engine.assess_at(&req, Utc::now(), 2).await.unwrap();
        assert_eq!(resp.risk_score, 100);
        assert_eq!(resp.risk_level, RiskLevel::High);
        assert_eq!(resp.decision, Decision::Decline);
    }

    #[tokio::test]
    async fn test_velocity_builds_up() {
        let engine = FraudEngine::new(FraudConfig::default());
        let now = Utc::now();
        for i in 0..10 {
            let resp = engine
                .assess_at(&request(&format!("v{}", i), "1.50", "coffee"), now, NOON)
                .await
                .unwrap();
            assert_eq!(resp.decision, Decision::Approve);
        }
        // 10 prior in the hour and 10 to the same receiver
        let resp = engine
            .assess_at(&request("v10", "1.50", "coffee"), now, NOON)
            .await
            .unwrap();
        assert_eq!(resp.risk_score, 25 + 12);
        assert_eq!(resp.risk_level, RiskLevel::Medium);
        assert!(resp.reasons.iter().any(|r| r == "High frequency: 10 transactions in last hour"));
    }

    #[tokio::test]
    async fn test_validation() {
        let engine = FraudEngine::new(FraudConfig::default());
        let now = Utc::now();

        let missing_id = request("", "10", "");
        assert_eq!(
            engine.assess_at(&missing_id, now, NOON).await.unwrap_err(),
            FraudError::MissingTransactionId
        );

        let mut missing_sender = request("t", "10", "");
        missing_sender.sender_account_id.clear();
        assert_eq!(
            engine.assess_at(&missing_sender, now, NOON).await.unwrap_err(),
            FraudError::MissingSenderAccountId
        );

        let zero = request("t", "0", "");
        assert_eq!(
            engine.assess_at(&zero, now, NOON).await.unwrap_err(),
            FraudError::InvalidAmount
        );
        assert!(engine.memory().is_empty().await);
    }

    #[tokio::test]
    async fn test_doubling_does_not_lower_score_with_open_band() {
        let cfg = FraudConfig {
            large_amount_cap: None,
            ..Default::default()
        };
        let amounts = ["1.5", "3", "700", "1000", "2600", "4999.5", "9995", "19990", "40000"];
        for a in amounts {
            let base = Decimal::from_str(a).unwrap();
            let engine = FraudEngine::new(cfg.clone());
            let now = Utc::now();
            let mut req = request("m1", a, "rent");
            let low = engine.assess_at(&req, now, NOON).await.unwrap().risk_score;

            let engine = FraudEngine::new(cfg.clone());
            req.amount = base * Decimal::TWO;
            let high = engine.assess_at(&req, now, NOON).await.unwrap().risk_score;
            assert!(high >= low, "amount {} scored {} but doubled scored {}", a, low, high);
        }
    }

    #[tokio::test]
    async fn test_custom_rule_list() {
        let rule: Arc<dyn RiskRule> = Arc::new(FnRule::new("Always", 60, |_| {
            Some("always fires".to_string())
        }));
        let engine = FraudEngine::with_rules(FraudConfig::default(), vec![rule]);
        let resp = engine
            .assess_at(&request("c1", "10", "x"), Utc::now(), NOON)
            .await
            .unwrap();
        assert_eq!(resp.risk_score, 60);
        assert_eq!(resp.decision, Decision::Review);
        // reviews are still remembered
        assert_eq!(engine.memory().len().await, 1);
    }
}
