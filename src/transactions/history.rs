//! History query parsing and filtering

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use utoipa::IntoParams;

use super::error::{TransactionError, TransactionResult};
use super::model::{Transaction, TransactionCategory, TransactionStatus, TransactionType};

/// Raw query string of the history endpoints
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase", default)]
#[into_params(parameter_in = Query)]
pub struct HistoryQuery {
    /// Page size, clamped to [1, 100]; default 20
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// e.g. `transfer`, `card_purchase`
    #[serde(rename = "type")]
    pub transaction_type: Option<String>,
    /// `credit` or `debit`
    pub category: Option<String>,
    pub status: Option<String>,
    #[param(value_type = Option<f64>)]
    pub min_amount: Option<Decimal>,
    #[param(value_type = Option<f64>)]
    pub max_amount: Option<Decimal>,
    /// RFC 3339 timestamp or `YYYY-MM-DD`
    pub start_date: Option<String>,
    /// RFC 3339 timestamp or `YYYY-MM-DD` (whole day included)
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryFilter {
    pub transaction_type: Option<TransactionType>,
    pub category: Option<TransactionCategory>,
    pub status: Option<TransactionStatus>,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    pub fn is_empty(&self) -> bool {
        *self == HistoryFilter::default()
    }

    pub fn matches(&self, tx: &Transaction) -> bool {
        if self.transaction_type.is_some_and(|t| t != tx.transaction_type) {
            return false;
        }
        if self.category.is_some_and(|c| c != tx.transaction_category) {
            return false;
        }
        if self.status.is_some_and(|s| s != tx.status) {
            return false;
        }
        if self.min_amount.is_some_and(|m| tx.amount < m) {
            return false;
        }
        if self.max_amount.is_some_and(|m| tx.amount > m) {
            return false;
        }
        if self.start.is_some_and(|s| tx.created_at < s) {
            return false;
        }
        if self.end.is_some_and(|e| tx.created_at > e) {
            return false;
        }
        true
    }
}

/// A validated query: filter plus clamped paging
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub filter: HistoryFilter,
    pub limit: usize,
    pub offset: usize,
}

impl HistoryQuery {
    pub fn parse(&self, default_limit: usize, max_limit: usize) -> TransactionResult<PageRequest> {
        let filter = HistoryFilter {
            transaction_type: parse_enum(self.transaction_type.as_deref())?,
            category: parse_enum(self.category.as_deref())?,
            status: parse_enum(self.status.as_deref())?,
            min_amount: self.min_amount,
            max_amount: self.max_amount,
            start: parse_date(self.start_date.as_deref(), false)?,
            end: parse_date(self.end_date.as_deref(), true)?,
        };
        if let (Some(min), Some(max)) = (filter.min_amount, filter.max_amount) {
            if min > max {
                return Err(TransactionError::Validation(
                    "minAmount cannot exceed maxAmount".into(),
                ));
            }
        }
        if let (Some(start), Some(end)) = (filter.start, filter.end) {
            if start > end {
                return Err(TransactionError::Validation(
                    "startDate cannot be after endDate".into(),
                ));
            }
        }
        let limit = self.limit.unwrap_or(default_limit).clamp(1, max_limit.max(1));
        // sorted-index ranges are signed 64-bit on the remote backend
        let max_offset = (i64::MAX as usize).saturating_sub(limit);
        Ok(PageRequest {
            filter,
            limit,
            offset: self.offset.unwrap_or(0).min(max_offset),
        })
    }
}

fn parse_enum<T>(raw: Option<&str>) -> TransactionResult<Option<T>>
where
    T: std::str::FromStr<Err = String>,
{
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s.parse().map(Some).map_err(TransactionError::Validation),
    }
}

/// Day-only end dates cover the whole day.
fn parse_date(raw: Option<&str>, end_of_day: bool) -> TransactionResult<Option<DateTime<Utc>>> {
    let Some(s) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    let day = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| TransactionError::Validation(format!("Invalid date: {}", s)))?;
    let time = if end_of_day {
        NaiveTime::from_hms_milli_opt(23, 59, 59, 999)
    } else {
        Some(NaiveTime::MIN)
    };
    let time = time.ok_or_else(|| TransactionError::Internal("bad time of day".into()))?;
    Ok(Some(day.and_time(time).and_utc()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_limit_clamped() {
        let q = HistoryQuery::default();
        assert_eq!(q.parse(20, 100).unwrap().limit, 20);
        let q = HistoryQuery {
            limit: Some(1000),
            ..Default::default()
        };
        assert_eq!(q.parse(20, 100).unwrap().limit, 100);
        let q = HistoryQuery {
            limit: Some(0),
            offset: Some(7),
            ..Default::default()
        };
        let page = q.parse(20, 100).unwrap();
        assert_eq!(page.limit, 1);
        assert_eq!(page.offset, 7);
    }

    #[test]
    fn test_huge_offset_clamped() {
        let q = HistoryQuery {
            offset: Some(usize::MAX),
            ..Default::default()
        };
        let page = q.parse(20, 100).unwrap();
        assert_eq!(page.limit, 20);
        assert_eq!(page.offset, i64::MAX as usize - 20);
        assert!(page.offset.checked_add(page.limit).is_some());
    }

    #[test]
    fn test_unknown_enum_rejected() {
        let q = HistoryQuery {
            status: Some("done".into()),
            ..Default::default()
        };
        let err = q.parse(20, 100).unwrap_err();
        assert_eq!(err.to_string(), "Invalid transaction status: done");
    }

    #[test]
    fn test_dates() {
        let q = HistoryQuery {
            start_date: Some("2025-01-01".into()),
            end_date: Some("2025-01-31".into()),
            ..Default::default()
        };
        let f = q.parse(20, 100).unwrap().filter;
        assert_eq!(f.start, Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        assert!(f.end.unwrap() > Utc.with_ymd_and_hms(2025, 1, 31, 23, 59, 0).unwrap());

        let q = HistoryQuery {
            start_date: Some("2025-02-01T10:00:00Z".into()),
            end_date: Some("2025-01-01".into()),
            ..Default::default()
        };
        assert!(q.parse(20, 100).is_err());

        let q = HistoryQuery {
            start_date: Some("yesterday".into()),
            ..Default::default()
        };
        assert!(q.parse(20, 100).is_err());
    }

    #[test]
    fn test_query_string_names() {
        let q: HistoryQuery = serde_json::from_value(serde_json::json!({
            "type": "card_purchase",
            "category": "debit",
            "minAmount": 5
        }))
        .unwrap();
        let f = q.parse(20, 100).unwrap().filter;
        assert_eq!(f.transaction_type, Some(TransactionType::CardPurchase));
        assert_eq!(f.category, Some(TransactionCategory::Debit));
        assert_eq!(f.min_amount, Some(Decimal::from(5)));
        assert!(!f.is_empty());
        assert!(HistoryFilter::default().is_empty());
    }
}
