//! Idempotent billing emission.
//!
//! Every billing item is keyed by `(reference_id, type)` for one-time fees
//! and `(reference_id, type, billed_month)` for the monthly fee. Emission
//! checks the key first and the store enforces it again on insert, so a
//! request can be repeated any number of times and inserts at most once.

use super::models::{BillingItem, BillingKey, BillingRequest};
use crate::error::{DomainError, Result, StoreError};
use crate::store::resilience::{read_with_retry, with_timeout, CallPolicy};
use crate::store::traits::Repository;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of `create_if_absent`
#[derive(Debug, Clone, PartialEq)]
pub enum BillingOutcome {
    /// This call inserted the item
    Created(BillingItem),
    /// An item with the same key was already recorded
    Existing(BillingItem),
}

impl BillingOutcome {
    pub fn item(&self) -> &BillingItem {
        match self {
            Self::Created(item) | Self::Existing(item) => item,
        }
    }

    pub fn into_item(self) -> BillingItem {
        match self {
            Self::Created(item) | Self::Existing(item) => item,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

#[derive(Clone)]
pub struct BillingTrigger {
    repo: Arc<dyn Repository>,
    policy: CallPolicy,
}

impl BillingTrigger {
    pub fn new(repo: Arc<dyn Repository>, policy: CallPolicy) -> Self {
        Self { repo, policy }
    }

    pub async fn find(&self, key: &BillingKey) -> Result<Option<BillingItem>> {
        let repo = &self.repo;
        read_with_retry(&self.policy, "find_billing_item", move || {
            repo.find_billing_item(key)
        })
        .await
    }

    /// Insert the item unless one with the same key exists; return the
    /// existing one otherwise.
    pub async fn create_if_absent(&self, request: BillingRequest) -> Result<BillingOutcome> {
        let key = request.key();
        if let Some(existing) = self.find(&key).await? {
            debug!(%key, "Billing item already recorded");
            return Ok(BillingOutcome::Existing(existing));
        }

        let item = request.into_item();
        match with_timeout(&self.policy, "insert_billing_item", self.repo.insert_billing_item(&item))
            .await
        {
            Ok(()) => {
                info!(
                    reference_id = %item.reference_id,
                    billing_type = %item.billing_type,
                    billed_month = ?item.billed_month,
                    amount_cents = item.amount_cents,
                    "Billing item created"
                );
                Ok(BillingOutcome::Created(item))
            }
            // Lost a race against another writer with the same key
            Err(DomainError::Store(StoreError::DuplicateKey(_))) => {
                warn!(%key, "Concurrent billing insert, returning the recorded item");
                let existing = self.find(&key).await?.ok_or(DomainError::DuplicateKey {
                    key: key.to_string(),
                })?;
                Ok(BillingOutcome::Existing(existing))
            }
            Err(e) => Err(e),
        }
    }

    /// Build the item for inclusion in a caller's `WriteBatch` when none is
    /// recorded yet. The batch commit enforces the key again.
    pub async fn stage_if_absent(&self, request: BillingRequest) -> Result<Option<BillingItem>> {
        if self.find(&request.key()).await?.is_some() {
            debug!(key = %request.key(), "Billing item already recorded, nothing to stage");
            return Ok(None);
        }
        Ok(Some(request.into_item()))
    }

    /// Drop staged items whose key has been recorded since they were staged
    pub async fn restage(&self, staged: Vec<BillingItem>) -> Result<Vec<BillingItem>> {
        let mut pending = Vec::with_capacity(staged.len());
        for item in staged {
            if self.find(&item.key()).await?.is_none() {
                pending.push(item);
            }
        }
        Ok(pending)
    }

    /// Billing items recorded for a connection or project
    pub async fn billing_items_for(&self, reference_id: Uuid) -> Result<Vec<BillingItem>> {
        let repo = &self.repo;
        read_with_retry(&self.policy, "list_billing_items", move || {
            repo.list_billing_items(reference_id)
        })
        .await
    }
}
