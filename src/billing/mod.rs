//! Billing items, tariffs, idempotent emission and the monthly sweep

pub mod models;
pub mod sweep;
pub mod tariffs;
pub mod trigger;

pub use models::{BilledMonth, BillingItem, BillingKey, BillingRequest, BillingType};
pub use sweep::{MonthlyBillingSweep, SweepFailure, SweepReport};
pub use tariffs::TariffSettings;
pub use trigger::{BillingOutcome, BillingTrigger};
