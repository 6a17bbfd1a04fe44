//! Upward path resolution.
//!
//! One table-driven walker serves every level: each step reads the parent
//! level from `LEVELS` and looks the parent up by the stored parent id.
//! A missing parent is a broken link and fails the whole resolution.

use super::models::{HierarchyLevel, HierarchyNode, Path, PathSegment};
use crate::error::{DomainError, Result};
use crate::store::resilience::{read_with_retry, CallPolicy};
use crate::store::traits::Repository;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Resolves nodes to their full ancestor chain
#[derive(Clone)]
pub struct PathResolver {
    repo: Arc<dyn Repository>,
    policy: CallPolicy,
}

impl PathResolver {
    pub fn new(repo: Arc<dyn Repository>, policy: CallPolicy) -> Self {
        Self { repo, policy }
    }

    /// Look up one node, retrying transient failures
    pub async fn find(&self, level: HierarchyLevel, id: Uuid) -> Result<Option<HierarchyNode>> {
        let repo = &self.repo;
        read_with_retry(&self.policy, "get_node", move || repo.get_node(level, id)).await
    }

    /// Look up one node, failing with `NotFound` if it does not exist
    pub async fn lookup(&self, level: HierarchyLevel, id: Uuid) -> Result<HierarchyNode> {
        self.find(level, id)
            .await?
            .ok_or(DomainError::NotFound { level, id })
    }

    /// Every node from `id` up to its Organization, starting node first
    pub async fn ancestors(&self, id: Uuid, level: HierarchyLevel) -> Result<Vec<HierarchyNode>> {
        let start = self.lookup(level, id).await?;
        let mut chain = vec![start];

        loop {
            let current = &chain[chain.len() - 1];
            let Some(parent_level) = current.level.parent() else {
                break;
            };
            let Some(parent_id) = current.parent_id else {
                warn!(
                    level = %current.level,
                    id = %current.id,
                    "Node has no parent reference"
                );
                return Err(DomainError::NotFound {
                    level: parent_level,
                    id: Uuid::nil(),
                });
            };
            match self.find(parent_level, parent_id).await? {
                Some(parent) => chain.push(parent),
                None => {
                    warn!(
                        level = %current.level,
                        id = %current.id,
                        missing_level = %parent_level,
                        missing_id = %parent_id,
                        "Broken hierarchy link"
                    );
                    return Err(DomainError::NotFound {
                        level: parent_level,
                        id: parent_id,
                    });
                }
            }
        }

        debug!(%id, %level, depth = chain.len(), "Resolved ancestors");
        Ok(chain)
    }

    /// Resolve ids and names for every level from `id` up to Organization
    pub async fn resolve_path(&self, id: Uuid, level: HierarchyLevel) -> Result<Path> {
        let chain = self.ancestors(id, level).await?;
        Ok(Path {
            segments: chain
                .into_iter()
                .map(|node| PathSegment {
                    level: node.level,
                    id: node.id,
                    name: node.name,
                })
                .collect(),
        })
    }

    /// The Organization node at the top of `id`'s chain
    pub async fn organization_of(&self, id: Uuid, level: HierarchyLevel) -> Result<HierarchyNode> {
        let mut chain = self.ancestors(id, level).await?;
        chain
            .pop()
            .filter(|n| n.level == HierarchyLevel::Organization)
            .ok_or(DomainError::NotFound {
                level: HierarchyLevel::Organization,
                id: Uuid::nil(),
            })
    }

    /// Resolve several paths concurrently; results keep the input order
    pub async fn resolve_many(&self, targets: &[(Uuid, HierarchyLevel)]) -> Vec<Result<Path>> {
        join_all(
            targets
                .iter()
                .map(|(id, level)| self.resolve_path(*id, *level)),
        )
        .await
    }
}
