//! Repository trait definition
//!
//! Defines the abstract persistence interface consumed by the engines.
//! Backends: `MemoryRepository` (in-process) and `Neo4jRepository`.

use crate::billing::models::{BillingItem, BillingKey};
use crate::connection::models::Connection;
use crate::error::StoreResult;
use crate::hierarchy::models::{HierarchyLevel, HierarchyNode};
use async_trait::async_trait;
use uuid::Uuid;

/// Field changes for an existing hierarchy node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePatch {
    pub name: Option<String>,
    /// Organization only
    pub monthly_ean_rate_cents: Option<Option<i64>>,
}

/// Re-parenting of an existing node or connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeMove {
    pub level: HierarchyLevel,
    pub id: Uuid,
    pub new_parent_id: Uuid,
}

/// Versioned overwrite of a connection record
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionWrite {
    pub record: Connection,
    /// Version the writer read; the commit fails if the stored one differs
    pub expected_version: u64,
}

/// A set of writes that must be applied atomically.
///
/// Backends check every constraint before applying anything: parent
/// existence, id/EAN/billing-key uniqueness and the connection version.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub node_inserts: Vec<HierarchyNode>,
    pub node_moves: Vec<NodeMove>,
    pub connection_insert: Option<Connection>,
    pub connection_update: Option<ConnectionWrite>,
    pub billing_inserts: Vec<BillingItem>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_node(mut self, node: HierarchyNode) -> Self {
        self.node_inserts.push(node);
        self
    }

    pub fn move_node(mut self, level: HierarchyLevel, id: Uuid, new_parent_id: Uuid) -> Self {
        self.node_moves.push(NodeMove {
            level,
            id,
            new_parent_id,
        });
        self
    }

    pub fn insert_connection(mut self, connection: Connection) -> Self {
        self.connection_insert = Some(connection);
        self
    }

    pub fn update_connection(mut self, record: Connection, expected_version: u64) -> Self {
        self.connection_update = Some(ConnectionWrite {
            record,
            expected_version,
        });
        self
    }

    pub fn insert_billing(mut self, item: BillingItem) -> Self {
        self.billing_inserts.push(item);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.node_inserts.is_empty()
            && self.node_moves.is_empty()
            && self.connection_insert.is_none()
            && self.connection_update.is_none()
            && self.billing_inserts.is_empty()
    }
}

/// Abstract interface over hierarchy, connection and billing storage.
///
/// `get_node` and `list_children` also answer for `HierarchyLevel::Connection`
/// by projecting connections into nodes.
#[async_trait]
pub trait Repository: Send + Sync {
    // ========================================================================
    // Hierarchy nodes
    // ========================================================================

    /// Get a node of the given level by id
    async fn get_node(&self, level: HierarchyLevel, id: Uuid) -> StoreResult<Option<HierarchyNode>>;

    /// List the nodes of `level` whose parent is `parent_id`
    async fn list_children(
        &self,
        level: HierarchyLevel,
        parent_id: Uuid,
    ) -> StoreResult<Vec<HierarchyNode>>;

    /// Insert a node, failing if its parent does not exist
    async fn insert_node(&self, node: &HierarchyNode) -> StoreResult<()> {
        self.commit(WriteBatch::new().insert_node(node.clone())).await
    }

    /// Update name / rate fields of a node
    async fn update_node(&self, level: HierarchyLevel, id: Uuid, patch: &NodePatch)
        -> StoreResult<()>;

    /// Delete a node (or connection) by id
    async fn delete_node(&self, level: HierarchyLevel, id: Uuid) -> StoreResult<()>;

    // ========================================================================
    // Connections
    // ========================================================================

    async fn get_connection(&self, id: Uuid) -> StoreResult<Option<Connection>>;

    async fn find_connection_by_ean(&self, ean: &str) -> StoreResult<Option<Connection>>;

    /// Connections flagged as active subscriptions
    async fn list_active_subscriptions(&self) -> StoreResult<Vec<Connection>>;

    // ========================================================================
    // Billing
    // ========================================================================

    async fn find_billing_item(&self, key: &BillingKey) -> StoreResult<Option<BillingItem>>;

    async fn list_billing_items(&self, reference_id: Uuid) -> StoreResult<Vec<BillingItem>>;

    /// Insert one billing item, failing with `DuplicateKey` if its key exists
    async fn insert_billing_item(&self, item: &BillingItem) -> StoreResult<()> {
        self.commit(WriteBatch::new().insert_billing(item.clone())).await
    }

    // ========================================================================
    // Atomic writes
    // ========================================================================

    /// Apply every write in `batch`, or none of them
    async fn commit(&self, batch: WriteBatch) -> StoreResult<()>;
}
