//! Connection lifecycle state machine.
//!
//! Status changes are applied under a per-connection lock and committed
//! together with their mandated billing items in one `WriteBatch`, guarded
//! by the connection's version. Either both land or neither does.

use super::ean::EanGenerator;
use super::models::{Connection, ConnectionStatus, CreateConnectionRequest};
use crate::billing::models::{BilledMonth, BillingItem};
use crate::billing::tariffs::TariffSettings;
use crate::billing::trigger::BillingTrigger;
use crate::error::{DomainError, Result, StoreError};
use crate::events::{EntityType, EventEmitter};
use crate::hierarchy::models::{HierarchyLevel, PartialHierarchy};
use crate::hierarchy::resolver::PathResolver;
use crate::hierarchy::validator::HierarchyValidator;
use crate::store::resilience::{read_with_retry, with_timeout, CallPolicy};
use crate::store::traits::{Repository, WriteBatch};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of a successful transition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionOutcome {
    pub connection: Connection,
    /// Billing items inserted by this transition (empty on replays)
    pub emitted_billing: Vec<BillingItem>,
}

pub struct ConnectionLifecycle {
    repo: Arc<dyn Repository>,
    policy: CallPolicy,
    resolver: PathResolver,
    validator: HierarchyValidator,
    billing: BillingTrigger,
    tariffs: TariffSettings,
    ean: EanGenerator,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    events: Arc<dyn EventEmitter>,
}

impl ConnectionLifecycle {
    pub fn new(
        repo: Arc<dyn Repository>,
        policy: CallPolicy,
        tariffs: TariffSettings,
        ean: EanGenerator,
        events: Arc<dyn EventEmitter>,
    ) -> Self {
        let resolver = PathResolver::new(repo.clone(), policy);
        Self {
            validator: HierarchyValidator::new(resolver.clone()),
            billing: BillingTrigger::new(repo.clone(), policy),
            resolver,
            repo,
            policy,
            tariffs,
            ean,
            locks: DashMap::new(),
            events,
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get_connection(&self, id: Uuid) -> Result<Connection> {
        let repo = &self.repo;
        read_with_retry(&self.policy, "get_connection", move || repo.get_connection(id))
            .await?
            .ok_or(DomainError::NotFound {
                level: HierarchyLevel::Connection,
                id,
            })
    }

    /// Legal target statuses for the connection as currently stored
    pub async fn available_transitions(&self, id: Uuid) -> Result<Vec<ConnectionStatus>> {
        Ok(self.get_connection(id).await?.status.available_transitions())
    }

    async fn ean_taken(&self, ean: &str, own_id: Uuid) -> Result<bool> {
        let repo = &self.repo;
        let found = read_with_retry(&self.policy, "find_connection_by_ean", move || {
            repo.find_connection_by_ean(ean)
        })
        .await?;
        Ok(found.is_some_and(|c| c.id != own_id))
    }

    /// Generate an EAN no other connection holds
    async fn unique_ean(&self, own_id: Uuid) -> Result<String> {
        for attempt in 1..=self.ean.max_attempts() {
            let candidate = self.ean.generate();
            if !self.ean_taken(&candidate, own_id).await? {
                return Ok(candidate);
            }
            warn!(connection_id = %own_id, attempt, "EAN collision, regenerating");
        }
        Err(DomainError::DuplicateKey {
            key: format!("ean:{}*", self.ean.prefix()),
        })
    }

    // ========================================================================
    // Locking
    // ========================================================================

    fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.locks.entry(id).or_default().clone()
    }

    /// Drop the lock entry once nobody else holds or waits on it
    fn release_lock(&self, id: Uuid) {
        self.locks.remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// Create a connection in Concept under an object
    pub async fn create_connection(&self, request: CreateConnectionRequest) -> Result<Connection> {
        if request.name.trim().is_empty() {
            return Err(DomainError::InvalidRequest(
                "connection name must not be empty".into(),
            ));
        }
        let connection = Connection::new(
            request.object_id,
            request.name,
            request.utility,
            request.capacity,
            request.grid_operator,
        );

        self.validator
            .check_placement(
                HierarchyLevel::Connection,
                connection.id,
                Some(connection.object_id),
                &request.placement,
            )
            .await?;
        with_timeout(
            &self.policy,
            "commit",
            self.repo
                .commit(WriteBatch::new().insert_connection(connection.clone())),
        )
        .await
        .map_err(DomainError::lift_commit)?;

        info!(connection_id = %connection.id, object_id = %connection.object_id, "Connection created");
        self.events.emit_created(
            EntityType::Connection,
            &connection.id.to_string(),
            serde_json::json!({
                "name": connection.name,
                "object_id": connection.object_id,
                "status": connection.status,
            }),
            None,
        );
        Ok(connection)
    }

    /// Re-parent a connection under another object
    pub async fn move_connection(
        &self,
        id: Uuid,
        new_object_id: Uuid,
        placement: PartialHierarchy,
    ) -> Result<Connection> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.move_locked(id, new_object_id, &placement).await
        };
        drop(lock);
        self.release_lock(id);
        result
    }

    async fn move_locked(
        &self,
        id: Uuid,
        new_object_id: Uuid,
        placement: &PartialHierarchy,
    ) -> Result<Connection> {
        let current = self.get_connection(id).await?;
        if current.status.is_terminal() {
            return Err(DomainError::InvalidRequest(format!(
                "connection {} is {} and can no longer be moved",
                id, current.status
            )));
        }
        if current.object_id == new_object_id {
            return Ok(current);
        }

        self.validator
            .check_placement(HierarchyLevel::Connection, id, Some(new_object_id), placement)
            .await?;

        let mut next = current.clone();
        next.object_id = new_object_id;
        with_timeout(
            &self.policy,
            "commit",
            self.repo
                .commit(WriteBatch::new().update_connection(next.clone(), current.version)),
        )
        .await
        .map_err(DomainError::lift_commit)?;
        next.version = current.version + 1;
        next.updated_at = Some(Utc::now());

        info!(connection_id = %id, from = %current.object_id, to = %new_object_id, "Connection moved");
        self.events.emit_moved(
            EntityType::Connection,
            &id.to_string(),
            serde_json::json!({
                "old_object_id": current.object_id,
                "new_object_id": new_object_id,
            }),
            None,
        );
        Ok(next)
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Apply a status transition now
    pub async fn apply_transition(
        &self,
        id: Uuid,
        target: ConnectionStatus,
    ) -> Result<TransitionOutcome> {
        self.apply_transition_at(id, target, Utc::now()).await
    }

    /// Apply a status transition as of `at`: the milestone timestamp and
    /// the billed month of an activation are taken from it.
    ///
    /// Requesting the status the connection already has is a replay and
    /// succeeds without side effects.
    pub async fn apply_transition_at(
        &self,
        id: Uuid,
        target: ConnectionStatus,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.transition_locked(id, target, at).await
        };
        drop(lock);
        self.release_lock(id);
        result
    }

    async fn transition_locked(
        &self,
        id: Uuid,
        target: ConnectionStatus,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let current = self.get_connection(id).await?;

        if current.status == target {
            debug!(connection_id = %id, status = %target, "Transition replayed, nothing to do");
            return Ok(TransitionOutcome {
                connection: current,
                emitted_billing: Vec::new(),
            });
        }
        if !current.status.can_transition_to(target) {
            return Err(DomainError::IllegalTransition {
                connection_id: id,
                from: current.status,
                to: target,
            });
        }

        let mut next = current.clone();
        next.status = target;
        next.stamp_milestone(target, at);
        if current.status == ConnectionStatus::Active {
            next.is_active_subscription = false;
        }

        let mut staged = Vec::new();
        let mut generated_ean = false;
        match target {
            ConnectionStatus::InProgress => {
                staged.extend(
                    self.billing
                        .stage_if_absent(self.tariffs.connection_fee(id, at))
                        .await?,
                );
            }
            ConnectionStatus::Connected if next.ean.is_none() => {
                next.ean = Some(self.unique_ean(id).await?);
                generated_ean = true;
            }
            ConnectionStatus::Active => {
                if next.ean.is_none() {
                    return Err(DomainError::GuardFailed {
                        connection_id: id,
                        target,
                        reason: "an EAN must be assigned before activation".into(),
                    });
                }
                next.is_active_subscription = true;
                let organization = self
                    .resolver
                    .organization_of(id, HierarchyLevel::Connection)
                    .await?;
                staged.extend(
                    self.billing
                        .stage_if_absent(self.tariffs.monthly_ean_fee(
                            id,
                            BilledMonth::of(at),
                            organization.monthly_ean_rate_cents,
                        ))
                        .await?,
                );
            }
            _ => {}
        }

        let emitted = self
            .commit_transition(&current, &mut next, staged, generated_ean)
            .await?;
        next.version = current.version + 1;
        next.updated_at = Some(Utc::now());

        info!(
            connection_id = %id,
            from = %current.status,
            to = %target,
            ean = ?next.ean,
            billing_items = emitted.len(),
            "Transition applied"
        );
        self.emit_transition(&current, &next, &emitted).await;

        Ok(TransitionOutcome {
            connection: next,
            emitted_billing: emitted,
        })
    }

    /// Commit the status write and its billing together, resolving key
    /// collisions raised by concurrent writers. Returns the billing items
    /// that were inserted.
    async fn commit_transition(
        &self,
        current: &Connection,
        next: &mut Connection,
        mut staged: Vec<BillingItem>,
        generated_ean: bool,
    ) -> Result<Vec<BillingItem>> {
        let id = current.id;
        let mut attempts = 0u32;
        loop {
            let batch = staged.iter().cloned().fold(
                WriteBatch::new().update_connection(next.clone(), current.version),
                WriteBatch::insert_billing,
            );
            let err = match with_timeout(&self.policy, "commit", self.repo.commit(batch)).await {
                Ok(()) => return Ok(staged),
                Err(e) => e,
            };
            attempts += 1;

            match err {
                DomainError::Store(StoreError::VersionConflict { .. }) => {
                    warn!(connection_id = %id, "Connection advanced concurrently");
                    return Err(DomainError::Conflict { connection_id: id });
                }
                DomainError::Store(StoreError::DuplicateKey(key))
                    if attempts < self.ean.max_attempts() =>
                {
                    let mut resolved = false;
                    if generated_ean {
                        if let Some(ean) = next.ean.clone() {
                            if self.ean_taken(&ean, id).await? {
                                warn!(connection_id = %id, "EAN taken at commit, regenerating");
                                next.ean = Some(self.unique_ean(id).await?);
                                resolved = true;
                            }
                        }
                    }
                    let before = staged.len();
                    staged = self.billing.restage(staged).await?;
                    if staged.len() != before {
                        warn!(connection_id = %id, "Billing recorded concurrently, committing status only");
                        resolved = true;
                    }
                    if !resolved {
                        return Err(DomainError::DuplicateKey { key });
                    }
                }
                DomainError::Store(StoreError::DuplicateKey(key)) => {
                    return Err(DomainError::DuplicateKey { key });
                }
                e @ DomainError::Store(_) if !staged.is_empty() => {
                    warn!(connection_id = %id, error = %e, "Transition aborted, billing not recorded");
                    return Err(DomainError::BillingFailed {
                        connection_id: id,
                        reason: e.to_string(),
                    });
                }
                e => return Err(e.lift_commit()),
            }
        }
    }

    async fn emit_transition(&self, from: &Connection, to: &Connection, emitted: &[BillingItem]) {
        let (organization_id, path) =
            match self.resolver.resolve_path(to.id, HierarchyLevel::Connection).await {
                Ok(path) => (
                    path.organization_id().map(|id| id.to_string()),
                    Some(path.display_names()),
                ),
                Err(e) => {
                    warn!(connection_id = %to.id, error = %e, "Could not resolve path for event");
                    (None, None)
                }
            };

        for item in emitted {
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
                organization_id.clone(),
            );
        }
        self.events.emit_transitioned(
            &to.id.to_string(),
            serde_json::json!({
                "from": from.status,
                "to": to.status,
                "ean": to.ean,
                "path": path,
                "billing_types": emitted.iter().map(|i| i.billing_type).collect::<Vec<_>>(),
            }),
            organization_id,
        );
    }
}
