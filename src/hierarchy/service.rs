//! Hierarchy administration: create, move, rename and delete nodes.
//!
//! Every placement change goes through `HierarchyValidator` immediately
//! before its commit, and the store checks parent existence again inside
//! the commit itself.

use super::models::{CreateNodeRequest, HierarchyLevel, HierarchyNode, PartialHierarchy, Path, LEVELS};
use super::resolver::PathResolver;
use super::validator::HierarchyValidator;
use crate::billing::models::BillingItem;
use crate::billing::tariffs::TariffSettings;
use crate::billing::trigger::BillingTrigger;
use crate::error::{DomainError, Result};
use crate::events::{EntityType, EventEmitter};
use crate::store::resilience::{read_with_retry, with_timeout, CallPolicy};
use crate::store::traits::{NodePatch, Repository, WriteBatch};
use chrono::Utc;
use futures::future::try_join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// A newly created node and the billing its creation emitted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedNode {
    pub node: HierarchyNode,
    pub emitted_billing: Vec<BillingItem>,
}

pub struct HierarchyService {
    repo: Arc<dyn Repository>,
    policy: CallPolicy,
    resolver: PathResolver,
    validator: HierarchyValidator,
    billing: BillingTrigger,
    tariffs: TariffSettings,
    events: Arc<dyn EventEmitter>,
}

impl HierarchyService {
    pub fn new(
        repo: Arc<dyn Repository>,
        policy: CallPolicy,
        tariffs: TariffSettings,
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
            events,
        }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn validator(&self) -> &HierarchyValidator {
        &self.validator
    }

    pub async fn resolve_path(&self, id: Uuid, level: HierarchyLevel) -> Result<Path> {
        self.resolver.resolve_path(id, level).await
    }

    pub async fn validate_full_hierarchy(&self, partial: &PartialHierarchy) -> Result<bool> {
        self.validator.validate_full_hierarchy(partial).await
    }

    pub async fn get_node(&self, level: HierarchyLevel, id: Uuid) -> Result<HierarchyNode> {
        self.resolver.lookup(level, id).await
    }

    /// Direct children of `parent_id` at `level`
    pub async fn children(&self, level: HierarchyLevel, parent_id: Uuid) -> Result<Vec<HierarchyNode>> {
        if level.parent().is_none() {
            return Err(DomainError::InvalidRequest(format!(
                "{} nodes have no parent",
                level
            )));
        }
        let repo = &self.repo;
        read_with_retry(&self.policy, "list_children", move || {
            repo.list_children(level, parent_id)
        })
        .await
    }

    fn check_rate(level: HierarchyLevel, rate: Option<i64>) -> Result<()> {
        match rate {
            Some(_) if level != HierarchyLevel::Organization => Err(DomainError::InvalidRequest(
                "only organizations carry a monthly EAN rate".into(),
            )),
            Some(r) if r < 0 => Err(DomainError::InvalidRequest(format!(
                "monthly EAN rate must not be negative, got {}",
                r
            ))),
            _ => Ok(()),
        }
    }

    pub async fn create_node(&self, request: CreateNodeRequest) -> Result<CreatedNode> {
        if request.level == HierarchyLevel::Connection {
            return Err(DomainError::InvalidRequest(
                "connections are created through the connection lifecycle".into(),
            ));
        }
        if request.name.trim().is_empty() {
            return Err(DomainError::InvalidRequest("name must not be empty".into()));
        }
        Self::check_rate(request.level, request.monthly_ean_rate_cents)?;

        let mut node = HierarchyNode::new(request.level, request.name, request.parent_id);
        node.monthly_ean_rate_cents = request.monthly_ean_rate_cents;

        self.validator
            .check_placement(node.level, node.id, node.parent_id, &request.placement)
            .await?;

        let mut staged = Vec::new();
        if node.level == HierarchyLevel::Project {
            staged.extend(
                self.billing
                    .stage_if_absent(self.tariffs.project_fee(node.id, Utc::now()))
                    .await?,
            );
            // The billing lookup awaited; check the placement again
            self.validator
                .check_placement(node.level, node.id, node.parent_id, &request.placement)
                .await?;
        }

        let batch = staged
            .iter()
            .cloned()
            .fold(WriteBatch::new().insert_node(node.clone()), WriteBatch::insert_billing);
        with_timeout(&self.policy, "commit", self.repo.commit(batch))
            .await
            .map_err(DomainError::lift_commit)?;

        info!(level = %node.level, id = %node.id, name = %node.name, "Node created");
        let organization_id = self.organization_of(&node).await;
        self.events.emit_created(
            node.level.into(),
            &node.id.to_string(),
            serde_json::json!({ "name": node.name, "parent_id": node.parent_id }),
            organization_id.clone(),
        );
        for item in &staged {
            info!(
                reference_id = %item.reference_id,
                billing_type = %item.billing_type,
                amount_cents = item.amount_cents,
                "Billing item created"
            );
            self.events.emit_created(
                EntityType::BillingItem,
                &item.id.to_string(),
                serde_json::json!({
                    "reference_id": item.reference_id,
                    "billing_type": item.billing_type,
                    "amount_cents": item.amount_cents,
                    "currency": self.tariffs.currency,
                }),
                organization_id.clone(),
            );
        }

        Ok(CreatedNode {
            node,
            emitted_billing: staged,
        })
    }

    /// Re-parent a node. Connections move through the connection lifecycle.
    pub async fn move_node(
        &self,
        level: HierarchyLevel,
        id: Uuid,
        new_parent_id: Uuid,
        placement: PartialHierarchy,
    ) -> Result<HierarchyNode> {
        match level {
            HierarchyLevel::Organization => {
                return Err(DomainError::InvalidRequest(
                    "organizations have no parent to move under".into(),
                ))
            }
            HierarchyLevel::Connection => {
                return Err(DomainError::InvalidRequest(
                    "connections move through the connection lifecycle".into(),
                ))
            }
            _ => {}
        }

        let mut node = self.resolver.lookup(level, id).await?;
        if node.parent_id == Some(new_parent_id) {
            debug!(%level, %id, "Node already under requested parent");
            return Ok(node);
        }
        let old_parent_id = node.parent_id;

        self.validator
            .check_placement(level, id, Some(new_parent_id), &placement)
            .await?;
        with_timeout(
            &self.policy,
            "commit",
            self.repo
                .commit(WriteBatch::new().move_node(level, id, new_parent_id)),
        )
        .await
        .map_err(DomainError::lift_commit)?;
        node.parent_id = Some(new_parent_id);

        info!(%level, %id, ?old_parent_id, %new_parent_id, "Node moved");
        let organization_id = self.organization_of(&node).await;
        self.events.emit_moved(
            level.into(),
            &id.to_string(),
            serde_json::json!({ "old_parent_id": old_parent_id, "new_parent_id": new_parent_id }),
            organization_id,
        );
        Ok(node)
    }

    /// Rename a node or change an organization's monthly EAN rate
    pub async fn update_node(
        &self,
        level: HierarchyLevel,
        id: Uuid,
        patch: NodePatch,
    ) -> Result<HierarchyNode> {
        if patch.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(DomainError::InvalidRequest("name must not be empty".into()));
        }
        if let Some(rate) = patch.monthly_ean_rate_cents {
            Self::check_rate(level, rate)?;
        }

        with_timeout(&self.policy, "update_node", self.repo.update_node(level, id, &patch))
            .await
            .map_err(DomainError::lift_commit)?;
        let node = self.resolver.lookup(level, id).await?;

        let organization_id = self.organization_of(&node).await;
        self.events.emit_updated(
            level.into(),
            &id.to_string(),
            serde_json::json!({
                "name": node.name,
                "monthly_ean_rate_cents": node.monthly_ean_rate_cents,
            }),
            organization_id,
        );
        Ok(node)
    }

    /// Delete a childless node
    pub async fn delete_node(&self, level: HierarchyLevel, id: Uuid) -> Result<()> {
        if level == HierarchyLevel::Connection {
            return Err(DomainError::InvalidRequest(
                "connections are ended or cancelled, not deleted".into(),
            ));
        }
        let node = self.resolver.lookup(level, id).await?;

        // Fast path only; the store re-checks inside the delete itself
        if !level.is_leaf() {
            let child_levels = LEVELS
                .iter()
                .filter(|meta| meta.parent_level == Some(level))
                .map(|meta| meta.level);
            let counts = try_join_all(child_levels.map(|child| async move {
                Ok::<_, DomainError>(self.children(child, id).await?.len())
            }))
            .await?;
            let children: usize = counts.iter().sum();
            if children > 0 {
                return Err(DomainError::HasChildren {
                    level,
                    id,
                    children,
                });
            }
        }

        let organization_id = self.organization_of(&node).await;
        with_timeout(&self.policy, "delete_node", self.repo.delete_node(level, id))
            .await
            .map_err(DomainError::lift_commit)?;

        info!(%level, %id, "Node deleted");
        self.events
            .emit_deleted(level.into(), &id.to_string(), organization_id);
        Ok(())
    }

    /// Owning organization id for event filtering; best effort
    async fn organization_of(&self, node: &HierarchyNode) -> Option<String> {
        if node.level == HierarchyLevel::Organization {
            return Some(node.id.to_string());
        }
        self.resolver
            .organization_of(node.id, node.level)
            .await
            .ok()
            .map(|org| org.id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::models::BillingType;
    use crate::events::{CrudAction, EventBus, NoopEmitter};
    use crate::store::MemoryRepository;
    use crate::test_helpers::*;

    fn service(repo: Arc<MemoryRepository>) -> HierarchyService {
        HierarchyService::new(
            repo,
            test_policy(),
            TariffSettings::default(),
            Arc::new(NoopEmitter),
        )
    }

    fn request(level: HierarchyLevel, name: &str, parent_id: Option<Uuid>) -> CreateNodeRequest {
        CreateNodeRequest {
            level,
            name: name.into(),
            parent_id,
            placement: PartialHierarchy::default(),
            monthly_ean_rate_cents: None,
        }
    }

    #[tokio::test]
    async fn test_create_full_chain_through_service() {
        let repo = Arc::new(MemoryRepository::new());
        let svc = service(repo);

        let mut parent = None;
        let mut last = None;
        for level in HierarchyLevel::CHAIN {
            let created = svc
                .create_node(request(level, &format!("{level} one"), parent))
                .await
                .unwrap();
            parent = Some(created.node.id);
            last = Some(created.node);
        }

        let object = last.unwrap();
        let path = svc
            .resolve_path(object.id, HierarchyLevel::Object)
            .await
            .unwrap();
        assert_eq!(path.segments.len(), 6);
        assert_eq!(
            path.display_names(),
            "organization one / entity one / category one / project one / complex one / object one"
        );
    }

    #[tokio::test]
    async fn test_project_creation_emits_project_fee() {
        let (repo, chain) = seeded_chain_in_memory().await;
        let svc = service(repo.clone());
        let before = repo.billing_count().await;

        let created = svc
            .create_node(request(
                HierarchyLevel::Project,
                "Project Dune",
                Some(chain.category.id),
            ))
            .await
            .unwrap();

        assert_eq!(created.emitted_billing.len(), 1);
        let fee = &created.emitted_billing[0];
        assert_eq!(fee.billing_type, BillingType::ProjectFee);
        assert_eq!(fee.reference_id, created.node.id);
        assert_eq!(fee.amount_cents, TariffSettings::default().project_fee_cents);
        assert_eq!(repo.billing_count().await, before + 1);
    }

    #[tokio::test]
    async fn test_project_fee_failure_blocks_creation() {
        let (repo, chain) = seeded_chain_in_memory().await;
        let svc = service(repo.clone());
        repo.fail_billing_writes(true);

        let req = request(HierarchyLevel::Project, "Project Dune", Some(chain.category.id));
        assert!(svc.create_node(req).await.is_err());
        assert_eq!(
            svc.children(HierarchyLevel::Project, chain.category.id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_create_rejects_wrong_parent_level_and_bad_placement() {
        let (repo, chain) = seeded_chain_in_memory().await;
        let svc = service(repo);

        // A complex must hang under a project, not a category
        let err = svc
            .create_node(request(
                HierarchyLevel::Complex,
                "Misplaced",
                Some(chain.category.id),
            ))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DomainError::NotFound {
                level: HierarchyLevel::Project,
                ..
            }
        ));

        let mut req = request(HierarchyLevel::Meter, "Meter 1", Some(chain.object.id));
        req.placement = PartialHierarchy {
            complex_id: Some(chain.project.id),
            ..Default::default()
        };
        assert!(matches!(
            svc.create_node(req).await.unwrap_err(),
            DomainError::Validation { .. }
        ));

        let mut req = request(HierarchyLevel::Entity, "Rated", Some(chain.organization.id));
        req.monthly_ean_rate_cents = Some(100);
        assert!(matches!(
            svc.create_node(req).await.unwrap_err(),
            DomainError::InvalidRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_move_node_between_chains() {
        let (repo, chain, other) = seeded_two_chains().await;
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let svc = HierarchyService::new(
            repo,
            test_policy(),
            TariffSettings::default(),
            Arc::new(bus),
        );

        let moved = svc
            .move_node(
                HierarchyLevel::Object,
                chain.object.id,
                other.complex.id,
                other.partial(),
            )
            .await
            .unwrap();
        assert_eq!(moved.parent_id, Some(other.complex.id));

        let path = svc
            .resolve_path(chain.object.id, HierarchyLevel::Object)
            .await
            .unwrap();
        assert_eq!(path.organization_id(), Some(other.organization.id));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.action, CrudAction::Moved);
        assert_eq!(event.organization_id, Some(other.organization.id.to_string()));
    }

    #[tokio::test]
    async fn test_move_rejects_inconsistent_placement() {
        let (repo, chain, other) = seeded_two_chains().await;
        let svc = service(repo);
        let err = svc
            .move_node(
                HierarchyLevel::Complex,
                chain.complex.id,
                other.project.id,
                PartialHierarchy {
                    category_id: Some(chain.category.id),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DomainError::Validation {
                child_level: HierarchyLevel::Project,
                ..
            }
        ));
        // Nothing moved
        let node = svc
            .get_node(HierarchyLevel::Complex, chain.complex.id)
            .await
            .unwrap();
        assert_eq!(node.parent_id, Some(chain.project.id));
    }

    #[tokio::test]
    async fn test_delete_blocked_while_children_exist() {
        let (repo, chain) = seeded_chain_in_memory().await;
        seed_connection(&repo, chain.object.id).await;
        let svc = service(repo);

        let err = svc
            .delete_node(HierarchyLevel::Object, chain.object.id)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::HasChildren { children: 1, .. }));

        let meter = svc
            .create_node(request(HierarchyLevel::Meter, "Meter 1", Some(chain.object.id)))
            .await
            .unwrap()
            .node;
        svc.delete_node(HierarchyLevel::Meter, meter.id)
            .await
            .unwrap();
        assert!(matches!(
            svc.get_node(HierarchyLevel::Meter, meter.id).await.unwrap_err(),
            DomainError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_delete_refused_when_child_lands_after_check() {
        let (repo, chain) = seeded_chain_in_memory().await;
        let empty = HierarchyNode::new(HierarchyLevel::Complex, "Complex South", Some(chain.project.id));
        repo.insert_node(&empty).await.unwrap();

        // Another writer places an object under the complex after the
        // service counted its children
        let racing = Arc::new(InterleavedRepository::new(repo.clone()));
        let late = HierarchyNode::new(HierarchyLevel::Object, "Block Z", Some(empty.id));
        racing.before_next_delete(WriteBatch::new().insert_node(late.clone()));
        let svc = HierarchyService::new(
            racing,
            test_policy(),
            TariffSettings::default(),
            Arc::new(NoopEmitter),
        );

        let err = svc
            .delete_node(HierarchyLevel::Complex, empty.id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DomainError::HasChildren {
                level: HierarchyLevel::Complex,
                children: 1,
                ..
            }
        ));

        let path = svc
            .resolve_path(late.id, HierarchyLevel::Object)
            .await
            .unwrap();
        assert_eq!(path.id(HierarchyLevel::Complex), Some(empty.id));
        assert_eq!(path.id(HierarchyLevel::Organization), Some(chain.organization.id));
    }

    #[tokio::test]
    async fn test_update_rate_and_name() {
        let (repo, chain) = seeded_chain_in_memory().await;
        let svc = service(repo);

        let org = svc
            .update_node(
                HierarchyLevel::Organization,
                chain.organization.id,
                NodePatch {
                    name: Some("Acme Housing Group".into()),
                    monthly_ean_rate_cents: Some(Some(1_500)),
                },
            )
            .await
            .unwrap();
        assert_eq!(org.name, "Acme Housing Group");
        assert_eq!(org.monthly_ean_rate_cents, Some(1_500));

        let err = svc
            .update_node(
                HierarchyLevel::Complex,
                chain.complex.id,
                NodePatch {
                    name: None,
                    monthly_ean_rate_cents: Some(Some(10)),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidRequest(_)));
    }
}
