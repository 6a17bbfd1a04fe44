//! In-memory implementation of Repository.
//!
//! All collections live behind one `tokio::sync::RwLock` so that
//! `commit` can check and apply a whole batch atomically.

use crate::billing::models::{BillingItem, BillingKey};
use crate::connection::models::Connection;
use crate::error::{StoreError, StoreResult};
use crate::hierarchy::models::{HierarchyLevel, HierarchyNode};
use crate::store::traits::{NodePatch, Repository, WriteBatch};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct MemoryState {
    nodes: HashMap<Uuid, HierarchyNode>,
    connections: HashMap<Uuid, Connection>,
    billing: HashMap<BillingKey, BillingItem>,
}

impl MemoryState {
    fn contains(&self, level: HierarchyLevel, id: Uuid) -> bool {
        match level {
            HierarchyLevel::Connection => self.connections.contains_key(&id),
            _ => self.nodes.get(&id).is_some_and(|n| n.level == level),
        }
    }

    /// Nodes and connections whose parent is `id`
    fn child_count(&self, id: Uuid) -> usize {
        let nodes = self
            .nodes
            .values()
            .filter(|n| n.parent_id == Some(id))
            .count();
        let connections = self
            .connections
            .values()
            .filter(|c| c.object_id == id)
            .count();
        nodes + connections
    }

    fn ean_taken_by_other(&self, ean: &str, id: Uuid) -> bool {
        self.connections
            .values()
            .any(|c| c.id != id && c.ean.as_deref() == Some(ean))
    }

    fn check_ean_invariant(conn: &Connection) -> StoreResult<()> {
        if conn.status.requires_ean() && conn.ean.is_none() {
            return Err(StoreError::Invariant(format!(
                "connection {} is {} without an EAN",
                conn.id, conn.status
            )));
        }
        Ok(())
    }

    /// Check every constraint of `batch` without mutating anything
    fn check(&self, batch: &WriteBatch) -> StoreResult<()> {
        let mut pending: HashSet<(HierarchyLevel, Uuid)> = HashSet::new();
        let exists = |pending: &HashSet<(HierarchyLevel, Uuid)>, level, id| {
            self.contains(level, id) || pending.contains(&(level, id))
        };

        for node in &batch.node_inserts {
            if self.nodes.contains_key(&node.id) || !pending.insert((node.level, node.id)) {
                return Err(StoreError::DuplicateKey(format!("{}:{}", node.level, node.id)));
            }
            if let Some(parent_level) = node.level.parent() {
                let parent_id = node.parent_id.unwrap_or_default();
                if !exists(&pending, parent_level, parent_id) {
                    return Err(StoreError::ParentMissing {
                        level: parent_level,
                        id: parent_id,
                    });
                }
            }
        }

        for mv in &batch.node_moves {
            if !self.contains(mv.level, mv.id) {
                return Err(StoreError::Missing {
                    level: mv.level,
                    id: mv.id,
                });
            }
            if let Some(parent_level) = mv.level.parent() {
                if !exists(&pending, parent_level, mv.new_parent_id) {
                    return Err(StoreError::ParentMissing {
                        level: parent_level,
                        id: mv.new_parent_id,
                    });
                }
            }
        }

        if let Some(conn) = &batch.connection_insert {
            if self.connections.contains_key(&conn.id) {
                return Err(StoreError::DuplicateKey(format!("connection:{}", conn.id)));
            }
            Self::check_ean_invariant(conn)?;
            if !exists(&pending, HierarchyLevel::Object, conn.object_id) {
                return Err(StoreError::ParentMissing {
                    level: HierarchyLevel::Object,
                    id: conn.object_id,
                });
            }
            if let Some(ean) = &conn.ean {
                if self.ean_taken_by_other(ean, conn.id) {
                    return Err(StoreError::DuplicateKey(format!("ean:{}", ean)));
                }
            }
        }

        if let Some(write) = &batch.connection_update {
            let stored = self
                .connections
                .get(&write.record.id)
                .ok_or(StoreError::Missing {
                    level: HierarchyLevel::Connection,
                    id: write.record.id,
                })?;
            Self::check_ean_invariant(&write.record)?;
            if stored.version != write.expected_version {
                return Err(StoreError::VersionConflict {
                    id: stored.id,
                    expected: write.expected_version,
                    found: stored.version,
                });
            }
            if !exists(&pending, HierarchyLevel::Object, write.record.object_id) {
                return Err(StoreError::ParentMissing {
                    level: HierarchyLevel::Object,
                    id: write.record.object_id,
                });
            }
            if let Some(ean) = &write.record.ean {
                if self.ean_taken_by_other(ean, write.record.id) {
                    return Err(StoreError::DuplicateKey(format!("ean:{}", ean)));
                }
            }
        }

        let mut keys = HashSet::new();
        for item in &batch.billing_inserts {
            if item.billing_type.is_recurring() != item.billed_month.is_some() {
                return Err(StoreError::Invariant(format!(
                    "{} item {} needs a billed month exactly when recurring",
                    item.billing_type, item.id
                )));
            }
            let key = item.key();
            if self.billing.contains_key(&key) || !keys.insert(key) {
                return Err(StoreError::DuplicateKey(format!("billing:{}", key)));
            }
        }

        Ok(())
    }

    fn apply(&mut self, batch: WriteBatch) {
        for node in batch.node_inserts {
            self.nodes.insert(node.id, node);
        }
        for mv in batch.node_moves {
            if mv.level == HierarchyLevel::Connection {
                if let Some(conn) = self.connections.get_mut(&mv.id) {
                    conn.object_id = mv.new_parent_id;
                    conn.version += 1;
                    conn.updated_at = Some(Utc::now());
                }
            } else if let Some(node) = self.nodes.get_mut(&mv.id) {
                node.parent_id = Some(mv.new_parent_id);
            }
        }
        if let Some(conn) = batch.connection_insert {
            self.connections.insert(conn.id, conn);
        }
        if let Some(write) = batch.connection_update {
            let mut record = write.record;
            record.version = write.expected_version + 1;
            record.updated_at = Some(Utc::now());
            self.connections.insert(record.id, record);
        }
        for item in batch.billing_inserts {
            self.billing.insert(item.key(), item);
        }
    }
}

/// In-memory Repository backend.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: RwLock<MemoryState>,
    /// Fault injection: reject any commit carrying billing inserts
    fail_billing: AtomicBool,
}

impl MemoryRepository {
    /// Create a new empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Builder / seeding methods
    // ========================================================================

    /// Seed a node without constraint checks.
    pub async fn with_node(self, node: HierarchyNode) -> Self {
        self.state.write().await.nodes.insert(node.id, node);
        self
    }

    /// Seed a connection without constraint checks.
    pub async fn with_connection(self, connection: Connection) -> Self {
        self.state
            .write()
            .await
            .connections
            .insert(connection.id, connection);
        self
    }

    /// Make every commit that inserts billing items fail as unavailable.
    pub fn fail_billing_writes(&self, fail: bool) {
        self.fail_billing.store(fail, Ordering::SeqCst);
    }

    /// Remove a node bypassing all checks, leaving its children dangling.
    pub async fn remove_raw(&self, id: Uuid) {
        let mut state = self.state.write().await;
        state.nodes.remove(&id);
        state.connections.remove(&id);
    }

    /// Number of stored billing items
    pub async fn billing_count(&self) -> usize {
        self.state.read().await.billing.len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_node(&self, level: HierarchyLevel, id: Uuid) -> StoreResult<Option<HierarchyNode>> {
        let state = self.state.read().await;
        if level == HierarchyLevel::Connection {
            return Ok(state.connections.get(&id).map(Connection::as_node));
        }
        Ok(state.nodes.get(&id).filter(|n| n.level == level).cloned())
    }

    async fn list_children(
        &self,
        level: HierarchyLevel,
        parent_id: Uuid,
    ) -> StoreResult<Vec<HierarchyNode>> {
        let state = self.state.read().await;
        let mut children: Vec<HierarchyNode> = if level == HierarchyLevel::Connection {
            state
                .connections
                .values()
                .filter(|c| c.object_id == parent_id)
                .map(Connection::as_node)
                .collect()
        } else {
            state
                .nodes
                .values()
                .filter(|n| n.level == level && n.parent_id == Some(parent_id))
                .cloned()
                .collect()
        };
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn update_node(
        &self,
        level: HierarchyLevel,
        id: Uuid,
        patch: &NodePatch,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if level == HierarchyLevel::Connection {
            let conn = state
                .connections
                .get_mut(&id)
                .ok_or(StoreError::Missing { level, id })?;
            if let Some(name) = &patch.name {
                conn.name = name.clone();
                conn.version += 1;
                conn.updated_at = Some(Utc::now());
            }
            return Ok(());
        }
        let node = state
            .nodes
            .get_mut(&id)
            .filter(|n| n.level == level)
            .ok_or(StoreError::Missing { level, id })?;
        if let Some(name) = &patch.name {
            node.name = name.clone();
        }
        if let Some(rate) = patch.monthly_ean_rate_cents {
            node.monthly_ean_rate_cents = rate;
        }
        Ok(())
    }

    async fn delete_node(&self, level: HierarchyLevel, id: Uuid) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if !state.contains(level, id) {
            return Err(StoreError::Missing { level, id });
        }
        let children = state.child_count(id);
        if children > 0 {
            return Err(StoreError::HasChildren {
                level,
                id,
                children,
            });
        }
        if level == HierarchyLevel::Connection {
            state.connections.remove(&id);
        } else {
            state.nodes.remove(&id);
        }
        Ok(())
    }

    async fn get_connection(&self, id: Uuid) -> StoreResult<Option<Connection>> {
        Ok(self.state.read().await.connections.get(&id).cloned())
    }

    async fn find_connection_by_ean(&self, ean: &str) -> StoreResult<Option<Connection>> {
        Ok(self
            .state
            .read()
            .await
            .connections
            .values()
            .find(|c| c.ean.as_deref() == Some(ean))
            .cloned())
    }

    async fn list_active_subscriptions(&self) -> StoreResult<Vec<Connection>> {
        let state = self.state.read().await;
        let mut active: Vec<Connection> = state
            .connections
            .values()
            .filter(|c| c.is_active_subscription)
            .cloned()
            .collect();
        active.sort_by_key(|c| c.created_at);
        Ok(active)
    }

    async fn find_billing_item(&self, key: &BillingKey) -> StoreResult<Option<BillingItem>> {
        Ok(self.state.read().await.billing.get(key).cloned())
    }

    async fn list_billing_items(&self, reference_id: Uuid) -> StoreResult<Vec<BillingItem>> {
        let state = self.state.read().await;
        let mut items: Vec<BillingItem> = state
            .billing
            .values()
            .filter(|i| i.reference_id == reference_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| (i.billable_from, i.created_at));
        Ok(items)
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if !batch.billing_inserts.is_empty() && self.fail_billing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("billing table unavailable".into()));
        }
        let mut state = self.state.write().await;
        state.check(&batch)?;
        state.apply(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::models::{BillingRequest, BillingType};
    use crate::connection::models::UtilityKind;

    fn fee(reference_id: Uuid) -> BillingItem {
        BillingRequest {
            reference_id,
            billing_type: BillingType::ConnectionFee,
            amount_cents: 10_000,
            name: "Connection fee".into(),
            billable_from: Utc::now(),
            billed_month: None,
        }
        .into_item()
    }

    #[tokio::test]
    async fn test_insert_requires_parent() {
        let repo = MemoryRepository::new();
        let orphan = HierarchyNode::new(HierarchyLevel::Entity, "Orphan", Some(Uuid::new_v4()));
        let err = repo.insert_node(&orphan).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::ParentMissing {
                level: HierarchyLevel::Organization,
                ..
            }
        ));

        let org = HierarchyNode::organization("Acme", None);
        repo.insert_node(&org).await.unwrap();
        let entity = HierarchyNode::new(HierarchyLevel::Entity, "Housing", Some(org.id));
        repo.insert_node(&entity).await.unwrap();
        assert_eq!(
            repo.list_children(HierarchyLevel::Entity, org.id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_get_node_checks_level() {
        let org = HierarchyNode::organization("Acme", None);
        let org_id = org.id;
        let repo = MemoryRepository::new().with_node(org).await;
        assert!(repo
            .get_node(HierarchyLevel::Organization, org_id)
            .await
            .unwrap()
            .is_some());
        assert!(repo
            .get_node(HierarchyLevel::Entity, org_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let object = HierarchyNode::new(HierarchyLevel::Object, "Block A", Some(Uuid::new_v4()));
        let conn = Connection::new(object.id, "C1", UtilityKind::Heat, None, None);
        let repo = MemoryRepository::new()
            .with_node(object)
            .await
            .with_connection(conn.clone())
            .await;

        let existing = fee(conn.id);
        repo.insert_billing_item(&existing).await.unwrap();

        let mut updated = conn.clone();
        updated.name = "renamed".into();
        let batch = WriteBatch::new()
            .update_connection(updated, conn.version)
            .insert_billing(fee(conn.id));
        let err = repo.commit(batch).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));

        let stored = repo.get_connection(conn.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "C1");
        assert_eq!(stored.version, 0);
        assert_eq!(repo.billing_count().await, 1);
    }

    #[tokio::test]
    async fn test_version_conflict() {
        let object = HierarchyNode::new(HierarchyLevel::Object, "Block A", Some(Uuid::new_v4()));
        let conn = Connection::new(object.id, "C1", UtilityKind::Water, None, None);
        let repo = MemoryRepository::new()
            .with_node(object)
            .await
            .with_connection(conn.clone())
            .await;

        repo.commit(WriteBatch::new().update_connection(conn.clone(), 0))
            .await
            .unwrap();
        let err = repo
            .commit(WriteBatch::new().update_connection(conn.clone(), 0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 0,
                found: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_ean_uniqueness() {
        let object = HierarchyNode::new(HierarchyLevel::Object, "Block A", Some(Uuid::new_v4()));
        let mut first = Connection::new(object.id, "C1", UtilityKind::Electricity, None, None);
        first.ean = Some("871687120000000019".into());
        let second = Connection::new(object.id, "C2", UtilityKind::Electricity, None, None);
        let repo = MemoryRepository::new()
            .with_node(object)
            .await
            .with_connection(first)
            .await
            .with_connection(second.clone())
            .await;

        let mut clash = second.clone();
        clash.ean = Some("871687120000000019".into());
        let err = repo
            .commit(WriteBatch::new().update_connection(clash, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(k) if k.starts_with("ean:")));
        assert!(repo
            .find_connection_by_ean("871687120000000019")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_fault_injection_only_hits_billing() {
        let repo = MemoryRepository::new();
        repo.fail_billing_writes(true);
        let org = HierarchyNode::organization("Acme", None);
        repo.insert_node(&org).await.unwrap();
        let err = repo.insert_billing_item(&fee(org.id)).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(repo.billing_count().await, 0);
    }

    #[tokio::test]
    async fn test_delete_refuses_node_with_children() {
        let repo = MemoryRepository::new();
        let org = HierarchyNode::organization("Acme", None);
        let entity = HierarchyNode::new(HierarchyLevel::Entity, "Housing", Some(org.id));
        repo.insert_node(&org).await.unwrap();
        repo.insert_node(&entity).await.unwrap();

        let err = repo
            .delete_node(HierarchyLevel::Organization, org.id)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::HasChildren { children: 1, .. }));
        assert!(repo
            .get_node(HierarchyLevel::Organization, org.id)
            .await
            .unwrap()
            .is_some());

        repo.delete_node(HierarchyLevel::Entity, entity.id).await.unwrap();
        repo.delete_node(HierarchyLevel::Organization, org.id)
            .await
            .unwrap();
        assert!(matches!(
            repo.delete_node(HierarchyLevel::Organization, org.id).await,
            Err(StoreError::Missing { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_counts_connections_under_object() {
        let object = HierarchyNode::new(HierarchyLevel::Object, "Block A", Some(Uuid::new_v4()));
        let conn = Connection::new(object.id, "C1", UtilityKind::Gas, None, None);
        let repo = MemoryRepository::new()
            .with_node(object.clone())
            .await
            .with_connection(conn)
            .await;
        let err = repo
            .delete_node(HierarchyLevel::Object, object.id)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::HasChildren { level: HierarchyLevel::Object, .. }));
    }

    #[tokio::test]
    async fn test_billed_month_must_match_recurrence() {
        let repo = MemoryRepository::new();
        let mut one_time = fee(Uuid::new_v4());
        one_time.billed_month = Some("2025-01".parse().unwrap());
        let err = repo.insert_billing_item(&one_time).await.unwrap_err();
        assert!(matches!(err, StoreError::Invariant(_)));

        let mut monthly = fee(Uuid::new_v4());
        monthly.billing_type = BillingType::MonthlyEanFee;
        let err = repo.insert_billing_item(&monthly).await.unwrap_err();
        assert!(matches!(err, StoreError::Invariant(_)));
        assert_eq!(repo.billing_count().await, 0);
    }
}
