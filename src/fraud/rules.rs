//! Risk rules.
//!
//! A rule looks at one request plus a velocity snapshot taken before scoring
//! and either stays silent or returns a human-readable reason. Rules are
//! independent: the engine sums the points of every rule that fires.

use rust_decimal::Decimal;
use std::sync::Arc;

use super::FraudConfig;
use super::memory::Velocity;
use super::model::RiskAssessmentRequest;

pub struct RuleContext<'a> {
    pub request: &'a RiskAssessmentRequest,
    pub velocity: &'a Velocity,
    /// Hour of day (0-23) on the scorer's local clock
    pub local_hour: u32,
}

pub trait RiskRule: Send + Sync {
    fn name(&self) -> &str;
    fn points(&self) -> u32;
    /// `Some(reason)` when the rule fires.
    fn check(&self, ctx: &RuleContext<'_>) -> Option<String>;
}

type CheckFn = dyn Fn(&RuleContext<'_>) -> Option<String> + Send + Sync;

/// Rule backed by a closure over its thresholds.
pub struct FnRule {
    name: String,
    points: u32,
    check: Box<CheckFn>,
}

impl FnRule {
    pub fn new<F>(name: impl Into<String>, points: u32, check: F) -> Self
    where
        F: Fn(&RuleContext<'_>) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            points,
            check: Box::new(check),
        }
    }
}

impl RiskRule for FnRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn points(&self) -> u32 {
        self.points
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Option<String> {
        (self.check)(ctx)
    }
}

fn dollars(amount: Decimal) -> String {
    format!("${:.2}", amount)
}

/// The canonical rule set, parameterised by `config`.
pub fn canonical_rules(config: &FraudConfig) -> Vec<Arc<dyn RiskRule>> {
    let c = config.clone();
    let mut rules: Vec<Arc<dyn RiskRule>> = Vec::with_capacity(14);

    // ------------------------------------------------------------------
    // Amount
    // ------------------------------------------------------------------
    let threshold = c.very_large_amount;
    rules.push(Arc::new(FnRule::new(
        "Very Large Transaction",
        c.very_large_points,
        move |ctx| {
            let amount = ctx.request.amount;
            (amount > threshold).then(|| format!("Very large amount: {}", dollars(amount)))
        },
    )));

    let (floor, cap) = (c.large_amount, c.large_amount_cap);
    rules.push(Arc::new(FnRule::new("Large Transaction", c.large_points, move |ctx| {
        let amount = ctx.request.amount;
        let below_cap = cap.is_none_or(|cap| amount <= cap);
        (amount > floor && below_cap).then(|| format!("Large amount: {}", dollars(amount)))
    })));

    let (min, max) = (c.structuring_min, c.structuring_max);
    rules.push(Arc::new(FnRule::new(
        "Suspicious Amount Pattern",
        c.structuring_points,
        move |ctx| {
            let amount = ctx.request.amount;
            (amount >= min && amount <= max).then(|| {
                format!(
                    "Suspicious amount pattern: {} (possible structuring)",
                    dollars(amount)
                )
            })
        },
    )));

    let round_min = c.round_amount_min;
    rules.push(Arc::new(FnRule::new("Round Amount", c.round_points, move |ctx| {
        let amount = ctx.request.amount;
        (amount >= round_min && amount.fract().is_zero())
            .then(|| format!("Round amount: {}", dollars(amount)))
    })));

    let tiny_max = c.tiny_amount_max;
    rules.push(Arc::new(FnRule::new("Tiny Transaction", c.tiny_points, move |ctx| {
        let amount = ctx.request.amount;
        (amount > Decimal::ZERO && amount < tiny_max)
            .then(|| format!("Tiny test transaction: {}", dollars(amount)))
    })));

    // ------------------------------------------------------------------
    // Velocity
    // ------------------------------------------------------------------
    let limit = c.hourly_count_limit;
    rules.push(Arc::new(FnRule::new(
        "High Transaction Frequency (1 hour)",
        c.hourly_count_points,
        move |ctx| {
            let n = ctx.velocity.sender_count_1h;
            (n >= limit).then(|| format!("High frequency: {} transactions in last hour", n))
        },
    )));

    let limit = c.daily_count_limit;
    rules.push(Arc::new(FnRule::new(
        "High Transaction Frequency (24 hours)",
        c.daily_count_points,
        move |ctx| {
            let n = ctx.velocity.sender_count_24h;
            (n >= limit).then(|| format!("High frequency: {} transactions in last 24 hours", n))
        },
    )));

    let limit = c.hourly_volume_limit;
    rules.push(Arc::new(FnRule::new(
        "High Volume (1 hour)",
        c.hourly_volume_points,
        move |ctx| {
            let prior = ctx.velocity.sender_total_1h;
            (prior + ctx.request.amount > limit)
                .then(|| format!("High volume: {} sent in last hour", dollars(prior)))
        },
    )));

    let limit = c.daily_volume_limit;
    rules.push(Arc::new(FnRule::new(
        "High Volume (24 hours)",
        c.daily_volume_points,
        move |ctx| {
            let prior = ctx.velocity.sender_total_24h;
            (prior + ctx.request.amount > limit)
                .then(|| format!("High volume: {} sent in last 24 hours", dollars(prior)))
        },
    )));

    let limit = c.repeat_receiver_limit;
    rules.push(Arc::new(FnRule::new(
        "Repeated Transactions to Same Receiver",
        c.repeat_receiver_points,
        move |ctx| {
            let n = ctx.velocity.pair_count_1h;
            (n >= limit).then(|| {
                format!(
                    "Repeated transactions: {} transactions to same receiver in last hour",
                    n
                )
            })
        },
    )));

    // ------------------------------------------------------------------
    // Pattern
    // ------------------------------------------------------------------
    let keywords: Vec<String> = c.keywords.iter().map(|k| k.to_lowercase()).collect();
    rules.push(Arc::new(FnRule::new(
        "Suspicious Description Keywords",
        c.keyword_points,
        move |ctx| {
            let desc = ctx.request.description.to_lowercase();
            keywords
                .iter()
                .find(|k| !k.is_empty() && desc.contains(k.as_str()))
                .map(|k| format!("Suspicious keyword in description: '{}'", k))
        },
    )));

    let undescribed = c.undescribed_amount;
    rules.push(Arc::new(FnRule::new(
        "Empty Description for Large Amount",
        c.undescribed_points,
        move |ctx| {
            (ctx.request.amount > undescribed && ctx.request.description.trim().is_empty())
                .then(|| "No description for large transaction".to_string())
        },
    )));

    let (start, end) = (c.late_night_start, c.late_night_end);
    rules.push(Arc::new(FnRule::new(
        "Late Night Transaction",
        c.late_night_points,
        move |ctx| {
            let hour = ctx.local_hour;
            (hour >= start && hour < end).then(|| format!("Late night transaction at {}:00", hour))
        },
    )));

    // ------------------------------------------------------------------
    // Account
    // ------------------------------------------------------------------
    rules.push(Arc::new(FnRule::new(
        "Same Sender and Receiver",
        c.self_transfer_points,
        |ctx| {
            (ctx.request.sender_account_id == ctx.request.receiver_account_id)
                .then(|| "Sender and receiver are the same account".to_string())
        },
    )));

    rules
}
