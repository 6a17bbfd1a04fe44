//! Monthly recurring billing sweep, run once per calendar month by an
//! external scheduler. Re-running a month is harmless.

use super::models::{BilledMonth, BillingItem};
use super::tariffs::TariffSettings;
use super::trigger::{BillingOutcome, BillingTrigger};
use crate::connection::models::Connection;
use crate::error::{DomainError, Result};
use crate::events::{EntityType, EventEmitter};
use crate::hierarchy::models::HierarchyLevel;
use crate::hierarchy::resolver::PathResolver;
use crate::store::resilience::{read_with_retry, CallPolicy};
use crate::store::traits::Repository;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// A connection the sweep could not bill
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SweepFailure {
    pub connection_id: Uuid,
    pub reason: String,
    pub retryable: bool,
}

/// Outcome of one sweep run
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SweepReport {
    pub month: Option<BilledMonth>,
    /// Items inserted by this run
    pub emitted: Vec<BillingItem>,
    /// Connections already billed for the month or not yet active in it
    pub skipped: usize,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct MonthlyBillingSweep {
    repo: Arc<dyn Repository>,
    policy: CallPolicy,
    resolver: PathResolver,
    billing: BillingTrigger,
    tariffs: TariffSettings,
    events: Arc<dyn EventEmitter>,
}

impl MonthlyBillingSweep {
    pub fn new(
        repo: Arc<dyn Repository>,
        policy: CallPolicy,
        tariffs: TariffSettings,
        events: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            resolver: PathResolver::new(repo.clone(), policy),
            billing: BillingTrigger::new(repo.clone(), policy),
            repo,
            policy,
            tariffs,
            events,
        }
    }

    /// Emit `month`'s fee for every billable subscription that lacks one
    pub async fn run(&self, month: BilledMonth) -> Result<SweepReport> {
        let repo = &self.repo;
        let subscriptions = read_with_retry(&self.policy, "list_active_subscriptions", move || {
            repo.list_active_subscriptions()
        })
        .await?;

        let mut report = SweepReport {
            month: Some(month),
            ..Default::default()
        };
        for connection in subscriptions {
            if !connection.is_billable_subscription() || activated_after(&connection, month) {
                debug!(connection_id = %connection.id, %month, "Not billable for month");
                report.skipped += 1;
                continue;
            }
            match self.bill(&connection, month).await {
                Ok(BillingOutcome::Created(item)) => {
                    self.events.emit_created(
                        EntityType::BillingItem,
                        &item.id.to_string(),
                        serde_json::json!({
                            "reference_id": item.reference_id,
                            "billing_type": item.billing_type,
                            "amount_cents": item.amount_cents,
                            "billed_month": item.billed_month,
                            "currency": self.tariffs.currency,
                        }),
                        None,
                    );
                    report.emitted.push(item);
                }
                Ok(BillingOutcome::Existing(_)) => report.skipped += 1,
                Err(e) => {
                    error!(
                        connection_id = %connection.id,
                        billed_month = %month,
                        error = %e,
                        "Monthly billing failed"
                    );
                    report.failures.push(SweepFailure {
                        connection_id: connection.id,
                        reason: e.to_string(),
                        retryable: e.is_retryable(),
                    });
                }
            }
        }

        info!(
            billed_month = %month,
            emitted = report.emitted.len(),
            skipped = report.skipped,
            failures = report.failures.len(),
            "Monthly billing sweep finished"
        );
        Ok(report)
    }

    async fn bill(&self, connection: &Connection, month: BilledMonth) -> Result<BillingOutcome> {
        let organization = self
            .resolver
            .organization_of(connection.id, HierarchyLevel::Connection)
            .await?;
        self.billing
            .create_if_absent(self.tariffs.monthly_ean_fee(
                connection.id,
                month,
                organization.monthly_ean_rate_cents,
            ))
            .await
    }

    /// Run the sweep and return the items it emitted.
    ///
    /// Fails when any connection could not be billed; items emitted before
    /// the failure stay recorded and a re-run only fills the gaps.
    pub async fn run_monthly_billing_sweep(&self, month: BilledMonth) -> Result<Vec<BillingItem>> {
        let report = self.run(month).await?;
        match report.failures.first() {
            None => Ok(report.emitted),
            Some(first) => Err(DomainError::BillingFailed {
                connection_id: first.connection_id,
                reason: format!(
                    "{} of the {} failed: {}",
                    report.failures.len(),
                    month,
                    first.reason
                ),
            }),
        }
    }
}

/// Activated in a later month than the one being billed
fn activated_after(connection: &Connection, month: BilledMonth) -> bool {
    connection
        .activation_date
        .is_some_and(|at| BilledMonth::of(at) > month)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::models::BillingType;
    use crate::events::NoopEmitter;
    use crate::store::MemoryRepository;
    use crate::test_helpers::*;
    use chrono::{TimeZone, Utc};

    fn sweep(repo: Arc<MemoryRepository>) -> MonthlyBillingSweep {
        MonthlyBillingSweep::new(
            repo,
            test_policy(),
            TariffSettings::default(),
            Arc::new(NoopEmitter),
        )
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent_per_month() {
        let (repo, chain) = seeded_chain_in_memory().await;
        let active = seed_active_connection(
            &repo,
            chain.object.id,
            Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap(),
        )
        .await;
        let sweep = sweep(repo.clone());
        let jan: BilledMonth = "2025-01".parse().unwrap();

        let first = sweep.run(jan).await.unwrap();
        assert_eq!(first.emitted.len(), 1);
        assert_eq!(first.emitted[0].reference_id, active.id);
        assert_eq!(first.emitted[0].amount_cents, ORG_MONTHLY_RATE_CENTS);
        assert!(first.is_clean());

        let again = sweep.run(jan).await.unwrap();
        assert!(again.emitted.is_empty());
        assert_eq!(again.skipped, 1);

        let feb = sweep.run_monthly_billing_sweep(jan.next()).await.unwrap();
        assert_eq!(feb.len(), 1);
        assert_eq!(feb[0].billing_type, BillingType::MonthlyEanFee);
        assert_eq!(feb[0].billed_month, Some(jan.next()));
        assert_eq!(repo.billing_count().await, 2);
    }

    #[tokio::test]
    async fn test_sweep_skips_months_before_activation() {
        let (repo, chain) = seeded_chain_in_memory().await;
        seed_active_connection(
            &repo,
            chain.object.id,
            Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
        )
        .await;
        let report = sweep(repo).run("2025-02".parse().unwrap()).await.unwrap();
        assert!(report.emitted.is_empty());
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_sweep_ignores_inactive_connections() {
        let (repo, chain) = seeded_chain_in_memory().await;
        seed_connection(&repo, chain.object.id).await;
        let report = sweep(repo).run("2025-01".parse().unwrap()).await.unwrap();
        assert!(report.emitted.is_empty());
        assert_eq!(report.skipped, 0);
    }

    #[tokio::test]
    async fn test_sweep_reports_failures() {
        let (repo, chain) = seeded_chain_in_memory().await;
        let active = seed_active_connection(
            &repo,
            chain.object.id,
            Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap(),
        )
        .await;
        repo.fail_billing_writes(true);
        let sweep = sweep(repo.clone());
        let jan: BilledMonth = "2025-01".parse().unwrap();

        let report = sweep.run(jan).await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].connection_id, active.id);
        assert!(report.failures[0].retryable);

        let err = sweep.run_monthly_billing_sweep(jan).await.unwrap_err();
        assert!(matches!(err, DomainError::BillingFailed { connection_id, .. } if connection_id == active.id));
    }

    #[tokio::test]
    async fn test_sweep_uses_default_rate_without_org_rate() {
        let (repo, chain) = seeded_chain_with_org_rate(None).await;
        seed_active_connection(
            &repo,
            chain.object.id,
            Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap(),
        )
        .await;
        let items = sweep(repo)
            .run_monthly_billing_sweep("2025-01".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(
            items[0].amount_cents,
            TariffSettings::default().default_monthly_ean_rate_cents
        );
    }
}
