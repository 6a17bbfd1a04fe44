//! Test helper factories and seeded repository builders
//!
//! Provides full hierarchy chains seeded into a `MemoryRepository` and
//! connections in a given lifecycle state.
#![allow(dead_code)]

use crate::billing::models::{BillingItem, BillingKey};
use crate::connection::ean::{EanGenerator, EanSettings};
use crate::connection::models::{Connection, ConnectionStatus, UtilityKind};
use crate::error::StoreResult;
use crate::hierarchy::models::{HierarchyLevel, HierarchyNode, PartialHierarchy};
use crate::store::resilience::CallPolicy;
use crate::store::traits::{NodePatch, Repository, WriteBatch};
use crate::store::MemoryRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Monthly EAN rate of the seeded organization
pub const ORG_MONTHLY_RATE_CENTS: i64 = 1_100;

/// Short timeouts and no real backoff
pub fn test_policy() -> CallPolicy {
    CallPolicy {
        timeout: Duration::from_secs(2),
        retry_attempts: 1,
        retry_backoff: Duration::from_millis(1),
    }
}

/// One node per structural level, each the parent of the next
#[derive(Debug, Clone)]
pub struct SeededChain {
    pub organization: HierarchyNode,
    pub entity: HierarchyNode,
    pub category: HierarchyNode,
    pub project: HierarchyNode,
    pub complex: HierarchyNode,
    pub object: HierarchyNode,
}

impl SeededChain {
    /// Every id of the chain as a placement
    pub fn partial(&self) -> PartialHierarchy {
        PartialHierarchy {
            object_id: Some(self.object.id),
            complex_id: Some(self.complex.id),
            project_id: Some(self.project.id),
            category_id: Some(self.category.id),
            entity_id: Some(self.entity.id),
            organization_id: Some(self.organization.id),
        }
    }
}

// ============================================================================
// Seeding
// ============================================================================

/// Insert a full chain into `repo` through normal commits
pub async fn seed_chain(repo: &MemoryRepository, org_rate: Option<i64>) -> SeededChain {
    let organization = HierarchyNode::organization("Acme Housing", org_rate);
    let entity = HierarchyNode::new(HierarchyLevel::Entity, "Acme Rentals", Some(organization.id));
    let category = HierarchyNode::new(HierarchyLevel::Category, "Renovation", Some(entity.id));
    let project = HierarchyNode::new(HierarchyLevel::Project, "Project Harbour", Some(category.id));
    let complex = HierarchyNode::new(HierarchyLevel::Complex, "Complex North", Some(project.id));
    let object = HierarchyNode::new(HierarchyLevel::Object, "Block A", Some(complex.id));

    for node in [&organization, &entity, &category, &project, &complex, &object] {
        repo.insert_node(node).await.unwrap();
    }

    SeededChain {
        organization,
        entity,
        category,
        project,
        complex,
        object,
    }
}

pub async fn seeded_chain_with_org_rate(
    org_rate: Option<i64>,
) -> (Arc<MemoryRepository>, SeededChain) {
    let repo = Arc::new(MemoryRepository::new());
    let chain = seed_chain(&repo, org_rate).await;
    (repo, chain)
}

pub async fn seeded_chain_in_memory() -> (Arc<MemoryRepository>, SeededChain) {
    seeded_chain_with_org_rate(Some(ORG_MONTHLY_RATE_CENTS)).await
}

/// Same as `seeded_chain_in_memory`, typed as the trait object
pub async fn seeded_chain() -> (Arc<dyn Repository>, SeededChain) {
    let (repo, chain) = seeded_chain_in_memory().await;
    (repo as Arc<dyn Repository>, chain)
}

/// Two independent chains in one repository
pub async fn seeded_two_chains() -> (Arc<MemoryRepository>, SeededChain, SeededChain) {
    let repo = Arc::new(MemoryRepository::new());
    let first = seed_chain(&repo, Some(ORG_MONTHLY_RATE_CENTS)).await;
    let second = seed_chain(&repo, None).await;
    (repo, first, second)
}

/// A Concept connection under `object_id`
pub async fn seed_connection<R: Repository + ?Sized>(repo: &Arc<R>, object_id: Uuid) -> Connection {
    let connection = Connection::new(
        object_id,
        "Main supply",
        UtilityKind::Electricity,
        Some("3x25A".into()),
        Some("Stedin".into()),
    );
    repo.commit(WriteBatch::new().insert_connection(connection.clone()))
        .await
        .unwrap();
    connection
}

/// An Active, subscribed connection with an EAN, activated at `activated_at`
pub async fn seed_active_connection(
    repo: &Arc<MemoryRepository>,
    object_id: Uuid,
    activated_at: DateTime<Utc>,
) -> Connection {
    let mut connection = Connection::new(
        object_id,
        "Live supply",
        UtilityKind::Electricity,
        None,
        None,
    );
    connection.status = ConnectionStatus::Active;
    connection.ean = Some(
        EanGenerator::new(&EanSettings::default())
            .unwrap()
            .generate(),
    );
    connection.connected_date = Some(activated_at);
    connection.activation_date = Some(activated_at);
    connection.is_active_subscription = true;
    repo.commit(WriteBatch::new().insert_connection(connection.clone()))
        .await
        .unwrap();
    connection
}

// ============================================================================
// Interleaving
// ============================================================================

/// Builds the competing write from the batch about to be committed
pub type CompetingWrite = Box<dyn FnOnce(&WriteBatch) -> WriteBatch + Send>;

/// Repository that lets another writer commit first, once, right before
/// the next `delete_node` or `commit` reaches the wrapped store.
pub struct InterleavedRepository {
    inner: Arc<MemoryRepository>,
    before_delete: Mutex<Option<WriteBatch>>,
    before_commit: Mutex<Option<CompetingWrite>>,
}

impl InterleavedRepository {
    pub fn new(inner: Arc<MemoryRepository>) -> Self {
        Self {
            inner,
            before_delete: Mutex::new(None),
            before_commit: Mutex::new(None),
        }
    }

    pub fn before_next_delete(&self, batch: WriteBatch) {
        *self.before_delete.lock().unwrap() = Some(batch);
    }

    pub fn before_next_commit(&self, write: CompetingWrite) {
        *self.before_commit.lock().unwrap() = Some(write);
    }
}

#[async_trait]
impl Repository for InterleavedRepository {
    async fn get_node(&self, level: HierarchyLevel, id: Uuid) -> StoreResult<Option<HierarchyNode>> {
        self.inner.get_node(level, id).await
    }

    async fn list_children(
        &self,
        level: HierarchyLevel,
        parent_id: Uuid,
    ) -> StoreResult<Vec<HierarchyNode>> {
        self.inner.list_children(level, parent_id).await
    }

    async fn update_node(
        &self,
        level: HierarchyLevel,
        id: Uuid,
        patch: &NodePatch,
    ) -> StoreResult<()> {
        self.inner.update_node(level, id, patch).await
    }

    async fn delete_node(&self, level: HierarchyLevel, id: Uuid) -> StoreResult<()> {
        let competing = self.before_delete.lock().unwrap().take();
        if let Some(batch) = competing {
            self.inner.commit(batch).await.unwrap();
        }
        self.inner.delete_node(level, id).await
    }

    async fn get_connection(&self, id: Uuid) -> StoreResult<Option<Connection>> {
        self.inner.get_connection(id).await
    }

    async fn find_connection_by_ean(&self, ean: &str) -> StoreResult<Option<Connection>> {
        self.inner.find_connection_by_ean(ean).await
    }

    async fn list_active_subscriptions(&self) -> StoreResult<Vec<Connection>> {
        self.inner.list_active_subscriptions().await
    }

    async fn find_billing_item(&self, key: &BillingKey) -> StoreResult<Option<BillingItem>> {
        self.inner.find_billing_item(key).await
    }

    async fn list_billing_items(&self, reference_id: Uuid) -> StoreResult<Vec<BillingItem>> {
        self.inner.list_billing_items(reference_id).await
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        let competing = self.before_commit.lock().unwrap().take();
        if let Some(write) = competing {
            self.inner.commit(write(&batch)).await.unwrap();
        }
        self.inner.commit(batch).await
    }
}
