//! Neo4j implementation of Repository.
//!
//! Each hierarchy level is a node label; parents link to children through
//! `:CONTAINS` relationships and the child also stores the parent id under
//! its level's parent field. Uniqueness (ids, EANs, billing keys) is enforced
//! by schema constraints, and `commit` runs in one transaction.

use crate::billing::models::{BillingItem, BillingKey};
use crate::connection::models::Connection;
use crate::error::{StoreError, StoreResult};
use crate::hierarchy::models::{HierarchyLevel, HierarchyNode, LEVELS};
use crate::store::traits::{NodePatch, Repository, WriteBatch};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use neo4rs::{query, Graph, Query, Txn};
use std::sync::Arc;
use uuid::Uuid;

/// Neo4j-backed repository
pub struct Neo4jRepository {
    graph: Arc<Graph>,
}

/// Map a driver error onto the store taxonomy
fn classify(e: neo4rs::Error) -> StoreError {
    match e {
        neo4rs::Error::IOError { .. } | neo4rs::Error::ConnectionError => {
            StoreError::Unavailable(e.to_string())
        }
        neo4rs::Error::Neo4j(ref server) => classify_code(server.code(), e.to_string()),
        other => StoreError::Backend(anyhow::Error::from(other)),
    }
}

/// Server status codes read `Neo.<Classification>.<Category>.<Title>`
fn classify_code(code: &str, message: String) -> StoreError {
    if code.starts_with("Neo.TransientError.") || code == "Neo.ClientError.Cluster.NotALeader" {
        StoreError::Unavailable(message)
    } else if code == "Neo.ClientError.Schema.ConstraintValidationFailed" {
        StoreError::DuplicateKey(message)
    } else {
        StoreError::Backend(anyhow::anyhow!(message))
    }
}

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value.filter(|s| !s.is_empty()).and_then(|s| s.parse().ok())
}

fn time_param(value: Option<DateTime<Utc>>) -> String {
    value.map(|t| t.to_rfc3339()).unwrap_or_default()
}

/// Run a query inside a transaction and report whether it returned a row
async fn returns_row(txn: &mut Txn, q: Query) -> StoreResult<bool> {
    let mut stream = txn.execute(q).await.map_err(classify)?;
    let mut found = false;
    // Drain the stream so the next statement starts on a clean connection
    while stream.next(txn.handle()).await.map_err(classify)?.is_some() {
        found = true;
    }
    Ok(found)
}

impl Neo4jRepository {
    /// Connect and initialize the schema
    pub async fn new(uri: &str, user: &str, password: &str) -> anyhow::Result<Self> {
        let graph = Graph::new(uri, user, password)
            .await
            .context("Failed to connect to Neo4j")?;

        let repo = Self {
            graph: Arc::new(graph),
        };

        repo.init_schema().await?;

        Ok(repo)
    }

    /// Create uniqueness constraints and lookup indexes
    async fn init_schema(&self) -> anyhow::Result<()> {
        let mut statements: Vec<String> = LEVELS
            .iter()
            .map(|meta| {
                let label = meta.level.label();
                format!(
                    "CREATE CONSTRAINT {}_id IF NOT EXISTS FOR (n:{}) REQUIRE n.id IS UNIQUE",
                    meta.level, label
                )
            })
            .collect();

        statements.extend(LEVELS.iter().filter_map(|meta| {
            meta.parent_field.map(|field| {
                format!(
                    "CREATE INDEX {}_parent IF NOT EXISTS FOR (n:{}) ON (n.{})",
                    meta.level,
                    meta.level.label(),
                    field
                )
            })
        }));

        statements.extend(
            [
                "CREATE CONSTRAINT connection_ean IF NOT EXISTS FOR (c:Connection) REQUIRE c.ean IS UNIQUE",
                "CREATE CONSTRAINT billing_key IF NOT EXISTS FOR (b:BillingItem) REQUIRE b.billing_key IS UNIQUE",
                "CREATE INDEX connection_status IF NOT EXISTS FOR (c:Connection) ON (c.status)",
                "CREATE INDEX connection_subscription IF NOT EXISTS FOR (c:Connection) ON (c.is_active_subscription)",
                "CREATE INDEX billing_reference IF NOT EXISTS FOR (b:BillingItem) ON (b.reference_id)",
            ]
            .into_iter()
            .map(String::from),
        );

        for statement in statements {
            if let Err(e) = self.graph.run(query(&statement)).await {
                tracing::warn!("Schema statement may already exist: {}", e);
            }
        }

        Ok(())
    }

    async fn fetch_rows(&self, q: Query) -> StoreResult<Vec<neo4rs::Row>> {
        let mut result = self.graph.execute(q).await.map_err(classify)?;
        let mut rows = Vec::new();
        while let Some(row) = result.next().await.map_err(classify)? {
            rows.push(row);
        }
        Ok(rows)
    }

    fn node_to_hierarchy(level: HierarchyLevel, node: &neo4rs::Node) -> anyhow::Result<HierarchyNode> {
        let parent_id = match level.parent_field() {
            Some(field) => Some(node.get::<String>(field)?.parse()?),
            None => None,
        };
        Ok(HierarchyNode {
            id: node.get::<String>("id")?.parse()?,
            level,
            name: node.get("name")?,
            parent_id,
            monthly_ean_rate_cents: node.get::<i64>("monthly_ean_rate_cents").ok(),
            created_at: parse_time(node.get::<String>("created_at").ok()).unwrap_or_else(Utc::now),
        })
    }

    fn node_to_connection(node: &neo4rs::Node) -> anyhow::Result<Connection> {
        let time = |key: &str| parse_time(node.get::<String>(key).ok());
        Ok(Connection {
            id: node.get::<String>("id")?.parse()?,
            name: node.get("name")?,
            object_id: node.get::<String>("object_id")?.parse()?,
            utility: node
                .get::<String>("utility")?
                .parse()
                .map_err(anyhow::Error::msg)?,
            status: node
                .get::<String>("status")?
                .parse()
                .map_err(anyhow::Error::msg)?,
            ean: node.get::<String>("ean").ok().filter(|s| !s.is_empty()),
            capacity: node.get::<String>("capacity").ok().filter(|s| !s.is_empty()),
            grid_operator: node
                .get::<String>("grid_operator")
                .ok()
                .filter(|s| !s.is_empty()),
            request_date: time("request_date"),
            in_progress_date: time("in_progress_date"),
            planned_connection_date: time("planned_connection_date"),
            connected_date: time("connected_date"),
            activation_date: time("activation_date"),
            deregistration_date: time("deregistration_date"),
            end_date: time("end_date"),
            cancelled_date: time("cancelled_date"),
            is_active_subscription: node.get("is_active_subscription").unwrap_or(false),
            version: node.get::<i64>("version").unwrap_or(0) as u64,
            created_at: time("created_at").unwrap_or_else(Utc::now),
            updated_at: time("updated_at"),
        })
    }

    fn node_to_billing(node: &neo4rs::Node) -> anyhow::Result<BillingItem> {
        Ok(BillingItem {
            id: node.get::<String>("id")?.parse()?,
            reference_id: node.get::<String>("reference_id")?.parse()?,
            billing_type: node
                .get::<String>("billing_type")?
                .parse()
                .map_err(anyhow::Error::msg)?,
            name: node.get("name")?,
            amount_cents: node.get("amount_cents")?,
            billable_from: parse_time(node.get::<String>("billable_from").ok())
                .context("billing item without billable_from")?,
            billed_month: node
                .get::<String>("billed_month")
                .ok()
                .filter(|s| !s.is_empty())
                .map(|s| s.parse())
                .transpose()
                .map_err(anyhow::Error::msg)?,
            created_at: parse_time(node.get::<String>("created_at").ok()).unwrap_or_else(Utc::now),
        })
    }

    /// Bind every connection property on `q`
    fn connection_params(q: Query, c: &Connection) -> Query {
        q.param("id", c.id.to_string())
            .param("name", c.name.clone())
            .param("object_id", c.object_id.to_string())
            .param("utility", c.utility.to_string())
            .param("status", c.status.to_string())
            .param("ean", c.ean.clone().unwrap_or_default())
            .param("capacity", c.capacity.clone().unwrap_or_default())
            .param("grid_operator", c.grid_operator.clone().unwrap_or_default())
            .param("request_date", time_param(c.request_date))
            .param("in_progress_date", time_param(c.in_progress_date))
            .param("planned_connection_date", time_param(c.planned_connection_date))
            .param("connected_date", time_param(c.connected_date))
            .param("activation_date", time_param(c.activation_date))
            .param("deregistration_date", time_param(c.deregistration_date))
            .param("end_date", time_param(c.end_date))
            .param("cancelled_date", time_param(c.cancelled_date))
            .param("is_active_subscription", c.is_active_subscription)
            .param("created_at", c.created_at.to_rfc3339())
    }

    const CONNECTION_SET: &'static str = r#"
        c.name = $name,
        c.utility = $utility,
        c.status = $status,
        c.ean = CASE WHEN $ean = '' THEN null ELSE $ean END,
        c.capacity = $capacity,
        c.grid_operator = $grid_operator,
        c.request_date = $request_date,
        c.in_progress_date = $in_progress_date,
        c.planned_connection_date = $planned_connection_date,
        c.connected_date = $connected_date,
        c.activation_date = $activation_date,
        c.deregistration_date = $deregistration_date,
        c.end_date = $end_date,
        c.cancelled_date = $cancelled_date,
        c.is_active_subscription = $is_active_subscription
    "#;

    async fn apply_batch(&self, txn: &mut Txn, batch: WriteBatch) -> StoreResult<()> {
        for node in &batch.node_inserts {
            let label = node.level.label();
            let created = match (node.level.parent(), node.level.parent_field()) {
                (Some(parent_level), Some(field)) => {
                    let parent_id = node.parent_id.unwrap_or_default();
                    let cypher = format!(
                        r#"
                        MATCH (p:{parent} {{id: $parent_id}})
                        CREATE (p)-[:CONTAINS]->(n:{label} {{
                            id: $id, name: $name, level: $level,
                            {field}: $parent_id, created_at: $created_at
                        }})
                        RETURN n.id AS id
                        "#,
                        parent = parent_level.label(),
                    );
                    let q = query(&cypher)
                        .param("parent_id", parent_id.to_string())
                        .param("id", node.id.to_string())
                        .param("name", node.name.clone())
                        .param("level", node.level.to_string())
                        .param("created_at", node.created_at.to_rfc3339());
                    if !returns_row(txn, q).await? {
                        return Err(StoreError::ParentMissing {
                            level: parent_level,
                            id: parent_id,
                        });
                    }
                    true
                }
                _ => {
                    let cypher = format!(
                        r#"
                        CREATE (n:{label} {{
                            id: $id, name: $name, level: $level, created_at: $created_at,
                            monthly_ean_rate_cents: CASE WHEN $rate < 0 THEN null ELSE $rate END
                        }})
                        RETURN n.id AS id
                        "#
                    );
                    let q = query(&cypher)
                        .param("id", node.id.to_string())
                        .param("name", node.name.clone())
                        .param("level", node.level.to_string())
                        .param("created_at", node.created_at.to_rfc3339())
                        .param("rate", node.monthly_ean_rate_cents.unwrap_or(-1));
                    returns_row(txn, q).await?
                }
            };
            tracing::debug!(level = %node.level, id = %node.id, created, "Node inserted");
        }

        for mv in &batch.node_moves {
            let label = mv.level.label();
            let exists_q = query(&format!("MATCH (n:{label} {{id: $id}}) RETURN n.id AS id"))
                .param("id", mv.id.to_string());
            if !returns_row(txn, exists_q).await? {
                return Err(StoreError::Missing {
                    level: mv.level,
                    id: mv.id,
                });
            }
            let (Some(parent_level), Some(field)) = (mv.level.parent(), mv.level.parent_field())
            else {
                continue;
            };
            let bump = if mv.level == HierarchyLevel::Connection {
                ", n.version = coalesce(n.version, 0) + 1, n.updated_at = $now"
            } else {
                ""
            };
            let cypher = format!(
                r#"
                MATCH (n:{label} {{id: $id}})
                MATCH (p:{parent} {{id: $parent_id}})
                OPTIONAL MATCH (:{parent})-[old:CONTAINS]->(n)
                DELETE old
                CREATE (p)-[:CONTAINS]->(n)
                SET n.{field} = $parent_id{bump}
                RETURN n.id AS id
                "#,
                parent = parent_level.label(),
            );
            let q = query(&cypher)
                .param("id", mv.id.to_string())
                .param("parent_id", mv.new_parent_id.to_string())
                .param("now", Utc::now().to_rfc3339());
            if !returns_row(txn, q).await? {
                return Err(StoreError::ParentMissing {
                    level: parent_level,
                    id: mv.new_parent_id,
                });
            }
        }

        if let Some(conn) = &batch.connection_insert {
            let cypher = format!(
                r#"
                MATCH (o:HierarchyObject {{id: $object_id}})
                CREATE (o)-[:CONTAINS]->(c:Connection {{id: $id, object_id: $object_id,
                    version: 0, created_at: $created_at}})
                SET {}
                RETURN c.id AS id
                "#,
                Self::CONNECTION_SET
            );
            let q = Self::connection_params(query(&cypher), conn);
            if !returns_row(txn, q).await? {
                return Err(StoreError::ParentMissing {
                    level: HierarchyLevel::Object,
                    id: conn.object_id,
                });
            }
        }

        if let Some(write) = &batch.connection_update {
            let cypher = format!(
                r#"
                MATCH (c:Connection {{id: $id}})
                WHERE coalesce(c.version, 0) = $expected
                MATCH (o:HierarchyObject {{id: $object_id}})
                OPTIONAL MATCH (:HierarchyObject)-[old:CONTAINS]->(c)
                DELETE old
                CREATE (o)-[:CONTAINS]->(c)
                SET {}, c.object_id = $object_id, c.version = $expected + 1, c.updated_at = $now
                RETURN c.id AS id
                "#,
                Self::CONNECTION_SET
            );
            let q = Self::connection_params(query(&cypher), &write.record)
                .param("expected", write.expected_version as i64)
                .param("now", Utc::now().to_rfc3339());
            if !returns_row(txn, q).await? {
                let mut stream = txn
                    .execute(
                        query("MATCH (c:Connection {id: $id}) RETURN coalesce(c.version, 0) AS version")
                            .param("id", write.record.id.to_string()),
                    )
                    .await
                    .map_err(classify)?;
                let mut found = None;
                while let Some(row) = stream.next(txn.handle()).await.map_err(classify)? {
                    found = Some(row);
                }
                let found = found.map(|row| row.get::<i64>("version").unwrap_or(0) as u64);
                return Err(match found {
                    Some(version) if version == write.expected_version => {
                        StoreError::ParentMissing {
                            level: HierarchyLevel::Object,
                            id: write.record.object_id,
                        }
                    }
                    Some(version) => StoreError::VersionConflict {
                        id: write.record.id,
                        expected: write.expected_version,
                        found: version,
                    },
                    None => StoreError::Missing {
                        level: HierarchyLevel::Connection,
                        id: write.record.id,
                    },
                });
            }
        }

        for item in &batch.billing_inserts {
            let q = query(
                r#"
                CREATE (b:BillingItem {
                    id: $id,
                    billing_key: $billing_key,
                    reference_id: $reference_id,
                    billing_type: $billing_type,
                    name: $name,
                    amount_cents: $amount_cents,
                    billable_from: $billable_from,
                    billed_month: $billed_month,
                    created_at: $created_at
                })
                "#,
            )
            .param("id", item.id.to_string())
            .param("billing_key", item.key().to_string())
            .param("reference_id", item.reference_id.to_string())
            .param("billing_type", item.billing_type.to_string())
            .param("name", item.name.clone())
            .param("amount_cents", item.amount_cents)
            .param("billable_from", item.billable_from.to_rfc3339())
            .param(
                "billed_month",
                item.billed_month.map(|m| m.to_string()).unwrap_or_default(),
            )
            .param("created_at", item.created_at.to_rfc3339());
            txn.run(q).await.map_err(classify)?;
        }

        Ok(())
    }
}

#[async_trait]
impl Repository for Neo4jRepository {
    async fn get_node(&self, level: HierarchyLevel, id: Uuid) -> StoreResult<Option<HierarchyNode>> {
        if level == HierarchyLevel::Connection {
            return Ok(self.get_connection(id).await?.map(|c| c.as_node()));
        }
        let q = query(&format!("MATCH (n:{} {{id: $id}}) RETURN n", level.label()))
            .param("id", id.to_string());
        match self.fetch_rows(q).await?.first() {
            Some(row) => {
                let node: neo4rs::Node = row.get("n").map_err(anyhow::Error::from)?;
                Ok(Some(Self::node_to_hierarchy(level, &node)?))
            }
            None => Ok(None),
        }
    }

    async fn list_children(
        &self,
        level: HierarchyLevel,
        parent_id: Uuid,
    ) -> StoreResult<Vec<HierarchyNode>> {
        let Some(field) = level.parent_field() else {
            return Ok(Vec::new());
        };
        let q = query(&format!(
            "MATCH (n:{} {{{}: $parent_id}}) RETURN n ORDER BY n.name",
            level.label(),
            field
        ))
        .param("parent_id", parent_id.to_string());

        let mut children = Vec::new();
        for row in self.fetch_rows(q).await? {
            let node: neo4rs::Node = row.get("n").map_err(anyhow::Error::from)?;
            let child = if level == HierarchyLevel::Connection {
                Self::node_to_connection(&node)?.as_node()
            } else {
                Self::node_to_hierarchy(level, &node)?
            };
            children.push(child);
        }
        Ok(children)
    }

    async fn update_node(
        &self,
        level: HierarchyLevel,
        id: Uuid,
        patch: &NodePatch,
    ) -> StoreResult<()> {
        let mut set_clauses = vec![];
        if patch.name.is_some() {
            set_clauses.push("n.name = $name");
        }
        if patch.monthly_ean_rate_cents.is_some() {
            set_clauses.push("n.monthly_ean_rate_cents = CASE WHEN $rate < 0 THEN null ELSE $rate END");
        }
        if set_clauses.is_empty() {
            return Ok(());
        }

        let cypher = format!(
            "MATCH (n:{} {{id: $id}}) SET {} RETURN n.id AS id",
            level.label(),
            set_clauses.join(", ")
        );
        let mut q = query(&cypher).param("id", id.to_string());
        if let Some(name) = &patch.name {
            q = q.param("name", name.clone());
        }
        if let Some(rate) = patch.monthly_ean_rate_cents {
            q = q.param("rate", rate.unwrap_or(-1));
        }

        if self.fetch_rows(q).await?.is_empty() {
            return Err(StoreError::Missing { level, id });
        }
        Ok(())
    }

    async fn delete_node(&self, level: HierarchyLevel, id: Uuid) -> StoreResult<()> {
        // The no-op SET takes the node's write lock before children are
        // counted, so a child created concurrently waits for this statement
        let q = query(&format!(
            r#"
            MATCH (n:{} {{id: $id}})
            SET n.id = n.id
            WITH n
            OPTIONAL MATCH (n)-[:CONTAINS]->(child)
            WITH n, count(child) AS children
            FOREACH (_ IN CASE WHEN children = 0 THEN [1] ELSE [] END | DETACH DELETE n)
            RETURN children
            "#,
            level.label()
        ))
        .param("id", id.to_string());
        let rows = self.fetch_rows(q).await?;
        let Some(row) = rows.first() else {
            return Err(StoreError::Missing { level, id });
        };
        let children = row.get::<i64>("children").map_err(anyhow::Error::from)?;
        if children > 0 {
            return Err(StoreError::HasChildren {
                level,
                id,
                children: children as usize,
            });
        }
        Ok(())
    }

    async fn get_connection(&self, id: Uuid) -> StoreResult<Option<Connection>> {
        let q = query("MATCH (c:Connection {id: $id}) RETURN c").param("id", id.to_string());
        match self.fetch_rows(q).await?.first() {
            Some(row) => {
                let node: neo4rs::Node = row.get("c").map_err(anyhow::Error::from)?;
                Ok(Some(Self::node_to_connection(&node)?))
            }
            None => Ok(None),
        }
    }

    async fn find_connection_by_ean(&self, ean: &str) -> StoreResult<Option<Connection>> {
        let q = query("MATCH (c:Connection {ean: $ean}) RETURN c").param("ean", ean);
        match self.fetch_rows(q).await?.first() {
            Some(row) => {
                let node: neo4rs::Node = row.get("c").map_err(anyhow::Error::from)?;
                Ok(Some(Self::node_to_connection(&node)?))
            }
            None => Ok(None),
        }
    }

    async fn list_active_subscriptions(&self) -> StoreResult<Vec<Connection>> {
        let q = query(
            r#"
            MATCH (c:Connection)
            WHERE c.is_active_subscription = true
            RETURN c
            ORDER BY c.created_at
            "#,
        );
        let mut connections = Vec::new();
        for row in self.fetch_rows(q).await? {
            let node: neo4rs::Node = row.get("c").map_err(anyhow::Error::from)?;
            connections.push(Self::node_to_connection(&node)?);
        }
        Ok(connections)
    }

    async fn find_billing_item(&self, key: &BillingKey) -> StoreResult<Option<BillingItem>> {
        let q = query("MATCH (b:BillingItem {billing_key: $key}) RETURN b")
            .param("key", key.to_string());
        match self.fetch_rows(q).await?.first() {
            Some(row) => {
                let node: neo4rs::Node = row.get("b").map_err(anyhow::Error::from)?;
                Ok(Some(Self::node_to_billing(&node)?))
            }
            None => Ok(None),
        }
    }

    async fn list_billing_items(&self, reference_id: Uuid) -> StoreResult<Vec<BillingItem>> {
        let q = query(
            r#"
            MATCH (b:BillingItem {reference_id: $reference_id})
            RETURN b
            ORDER BY b.billable_from, b.created_at
            "#,
        )
        .param("reference_id", reference_id.to_string());
        let mut items = Vec::new();
        for row in self.fetch_rows(q).await? {
            let node: neo4rs::Node = row.get("b").map_err(anyhow::Error::from)?;
            items.push(Self::node_to_billing(&node)?);
        }
        Ok(items)
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut txn = self.graph.start_txn().await.map_err(classify)?;
        match self.apply_batch(&mut txn, batch).await {
            Ok(()) => txn.commit().await.map_err(classify),
            Err(e) => {
                if let Err(rollback) = txn.rollback().await {
                    tracing::warn!("Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }
}
