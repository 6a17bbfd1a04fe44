//! Billing item models

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of charge
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BillingType {
    /// One-time, per project
    ProjectFee,
    /// One-time, per connection, on entering InProgress
    ConnectionFee,
    /// Recurring, per connection and calendar month
    MonthlyEanFee,
}

impl BillingType {
    pub fn is_recurring(self) -> bool {
        matches!(self, Self::MonthlyEanFee)
    }
}

impl fmt::Display for BillingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProjectFee => write!(f, "project_fee"),
            Self::ConnectionFee => write!(f, "connection_fee"),
            Self::MonthlyEanFee => write!(f, "monthly_ean_fee"),
        }
    }
}

impl FromStr for BillingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project_fee" => Ok(Self::ProjectFee),
            "connection_fee" => Ok(Self::ConnectionFee),
            "monthly_ean_fee" => Ok(Self::MonthlyEanFee),
            _ => Err(format!("Unknown billing type: {}", s)),
        }
    }
}

/// Calendar month key in `YYYY-MM` form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BilledMonth {
    year: i32,
    month: u32,
}

impl BilledMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, String> {
        if !(1..=12).contains(&month) {
            return Err(format!("Invalid month {} in billing key", month));
        }
        if !(1000..=9999).contains(&year) {
            return Err(format!("Invalid year {} in billing key", year));
        }
        Ok(Self { year, month })
    }

    pub fn of(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Midnight UTC on the first day of the month
    pub fn first_day(&self) -> DateTime<Utc> {
        let date = NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .unwrap_or(NaiveDate::MIN)
            .and_hms_opt(0, 0, 0)
            .unwrap_or_default();
        Utc.from_utc_datetime(&date)
    }
}

impl fmt::Display for BilledMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for BilledMonth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| format!("Invalid billed month: {}", s))?;
        if year.len() != 4 || month.len() != 2 {
            return Err(format!("Invalid billed month: {}", s));
        }
        let year: i32 = year
            .parse()
            .map_err(|_| format!("Invalid billed month: {}", s))?;
        let month: u32 = month
            .parse()
            .map_err(|_| format!("Invalid billed month: {}", s))?;
        Self::new(year, month)
    }
}

impl TryFrom<String> for BilledMonth {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BilledMonth> for String {
    fn from(value: BilledMonth) -> Self {
        value.to_string()
    }
}

/// Uniqueness key of a billing item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BillingKey {
    pub reference_id: Uuid,
    pub billing_type: BillingType,
    /// Set only for recurring types
    pub billed_month: Option<BilledMonth>,
}

impl fmt::Display for BillingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.billed_month {
            Some(month) => write!(f, "{}:{}:{}", self.reference_id, self.billing_type, month),
            None => write!(f, "{}:{}", self.reference_id, self.billing_type),
        }
    }
}

/// A one-time or monthly charge caused by a connection or project
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BillingItem {
    pub id: Uuid,
    pub reference_id: Uuid,
    pub billing_type: BillingType,
    pub name: String,
    pub amount_cents: i64,
    pub billable_from: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billed_month: Option<BilledMonth>,
    pub created_at: DateTime<Utc>,
}

impl BillingItem {
    pub fn key(&self) -> BillingKey {
        BillingKey {
            reference_id: self.reference_id,
            billing_type: self.billing_type,
            billed_month: self.billed_month,
        }
    }
}

/// Input to `BillingTrigger::create_if_absent`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingRequest {
    pub reference_id: Uuid,
    pub billing_type: BillingType,
    pub amount_cents: i64,
    pub name: String,
    pub billable_from: DateTime<Utc>,
    pub billed_month: Option<BilledMonth>,
}

impl BillingRequest {
    pub fn key(&self) -> BillingKey {
        BillingKey {
            reference_id: self.reference_id,
            billing_type: self.billing_type,
            billed_month: self.billed_month,
        }
    }

    pub fn into_item(self) -> BillingItem {
        BillingItem {
            id: Uuid::new_v4(),
            reference_id: self.reference_id,
            billing_type: self.billing_type,
            name: self.name,
            amount_cents: self.amount_cents,
            billable_from: self.billable_from,
            billed_month: self.billed_month,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billed_month_parse_and_display() {
        let month: BilledMonth = "2025-01".parse().unwrap();
        assert_eq!(month.year(), 2025);
        assert_eq!(month.month(), 1);
        assert_eq!(month.to_string(), "2025-01");
        assert!("2025-13".parse::<BilledMonth>().is_err());
        assert!("2025-1".parse::<BilledMonth>().is_err());
        assert!("january".parse::<BilledMonth>().is_err());
    }

    #[test]
    fn test_billed_month_next_wraps_year() {
        let dec: BilledMonth = "2024-12".parse().unwrap();
        assert_eq!(dec.next().to_string(), "2025-01");
        assert_eq!(dec.first_day().to_rfc3339(), "2024-12-01T00:00:00+00:00");
    }

    #[test]
    fn test_billed_month_serializes_as_string() {
        let month: BilledMonth = "2025-02".parse().unwrap();
        assert_eq!(serde_json::to_string(&month).unwrap(), "\"2025-02\"");
        let back: BilledMonth = serde_json::from_str("\"2025-02\"").unwrap();
        assert_eq!(back, month);
        assert!(serde_json::from_str::<BilledMonth>("\"2025-00\"").is_err());
    }

    #[test]
    fn test_billing_key_distinguishes_months() {
        let id = Uuid::new_v4();
        let jan = BillingKey {
            reference_id: id,
            billing_type: BillingType::MonthlyEanFee,
            billed_month: Some("2025-01".parse().unwrap()),
        };
        let feb = BillingKey {
            billed_month: Some("2025-02".parse().unwrap()),
            ..jan
        };
        assert_ne!(jan, feb);
        assert!(jan.to_string().ends_with("monthly_ean_fee:2025-01"));
    }
}
