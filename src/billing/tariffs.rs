//! Tariff configuration and the billing requests built from it

use super::models::{BilledMonth, BillingRequest, BillingType};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

/// `tariffs` section of the YAML configuration. Amounts are in cents.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TariffSettings {
    pub connection_fee_cents: i64,
    pub project_fee_cents: i64,
    /// Used when an organization has no rate of its own
    pub default_monthly_ean_rate_cents: i64,
    pub currency: String,
}

impl Default for TariffSettings {
    fn default() -> Self {
        Self {
            connection_fee_cents: 15_000,
            project_fee_cents: 50_000,
            default_monthly_ean_rate_cents: 1_250,
            currency: "EUR".into(),
        }
    }
}

impl TariffSettings {
    pub fn connection_fee(&self, connection_id: Uuid, at: DateTime<Utc>) -> BillingRequest {
        BillingRequest {
            reference_id: connection_id,
            billing_type: BillingType::ConnectionFee,
            amount_cents: self.connection_fee_cents,
            name: "Connection fee".into(),
            billable_from: at,
            billed_month: None,
        }
    }

    pub fn project_fee(&self, project_id: Uuid, at: DateTime<Utc>) -> BillingRequest {
        BillingRequest {
            reference_id: project_id,
            billing_type: BillingType::ProjectFee,
            amount_cents: self.project_fee_cents,
            name: "Project fee".into(),
            billable_from: at,
            billed_month: None,
        }
    }

    /// Monthly EAN fee at the organization's rate, falling back to the default
    pub fn monthly_ean_fee(
        &self,
        connection_id: Uuid,
        month: BilledMonth,
        organization_rate_cents: Option<i64>,
    ) -> BillingRequest {
        BillingRequest {
            reference_id: connection_id,
            billing_type: BillingType::MonthlyEanFee,
            amount_cents: organization_rate_cents.unwrap_or(self.default_monthly_ean_rate_cents),
            name: format!("Monthly EAN fee {}", month),
            billable_from: month.first_day(),
            billed_month: Some(month),
        }
    }
}
