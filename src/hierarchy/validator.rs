//! Pairwise placement validation.
//!
//! A placement is consistent when no two adjacent levels supplied by the
//! caller disagree. Absent levels are skipped, never treated as failures.

use super::models::{HierarchyLevel, PartialHierarchy};
use super::resolver::PathResolver;
use crate::error::{DomainError, Result};
use futures::future::try_join_all;
use tracing::debug;
use uuid::Uuid;

/// One adjacent (child, parent) pair taken from a partial placement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AdjacentPair {
    child_level: HierarchyLevel,
    child_id: Uuid,
    parent_level: HierarchyLevel,
    parent_id: Uuid,
}

/// Every adjacent pair present in `partial`, lowest level first
fn adjacent_pairs(partial: &PartialHierarchy) -> Vec<AdjacentPair> {
    HierarchyLevel::CHAIN
        .windows(2)
        .rev()
        .filter_map(|window| {
            let (parent_level, child_level) = (window[0], window[1]);
            Some(AdjacentPair {
                child_level,
                child_id: partial.get(child_level)?,
                parent_level,
                parent_id: partial.get(parent_level)?,
            })
        })
        .collect()
}

#[derive(Clone)]
pub struct HierarchyValidator {
    resolver: PathResolver,
}

impl HierarchyValidator {
    pub fn new(resolver: PathResolver) -> Self {
        Self { resolver }
    }

    /// True iff the child's stored parent reference equals `parent_id`.
    ///
    /// A child that does not exist belongs to nothing.
    pub async fn validate_child_belongs_to_parent(
        &self,
        child_id: Uuid,
        child_level: HierarchyLevel,
        parent_id: Uuid,
    ) -> Result<bool> {
        let stored = self.stored_parent(child_level, child_id).await?;
        Ok(stored == Some(parent_id))
    }

    async fn stored_parent(&self, level: HierarchyLevel, id: Uuid) -> Result<Option<Uuid>> {
        Ok(self
            .resolver
            .find(level, id)
            .await?
            .and_then(|node| node.parent_id))
    }

    /// Bool form of `check_full_hierarchy`. Store failures still propagate.
    pub async fn validate_full_hierarchy(&self, partial: &PartialHierarchy) -> Result<bool> {
        match self.check_full_hierarchy(partial).await {
            Ok(()) => Ok(true),
            Err(DomainError::Validation { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Check every adjacent pair in `partial`, failing with `Validation`
    /// naming the first (lowest) pair that disagrees.
    pub async fn check_full_hierarchy(&self, partial: &PartialHierarchy) -> Result<()> {
        let pairs = adjacent_pairs(partial);
        if pairs.is_empty() {
            return Ok(());
        }

        // Lookups are independent; verdicts are still taken in pair order.
        let stored = try_join_all(
            pairs
                .iter()
                .map(|pair| self.stored_parent(pair.child_level, pair.child_id)),
        )
        .await?;

        for (pair, actual_parent_id) in pairs.iter().zip(stored) {
            if actual_parent_id != Some(pair.parent_id) {
                debug!(
                    child_level = %pair.child_level,
                    child_id = %pair.child_id,
                    expected = %pair.parent_id,
                    actual = ?actual_parent_id,
                    "Placement pair disagrees"
                );
                return Err(DomainError::Validation {
                    child_level: pair.child_level,
                    child_id: pair.child_id,
                    expected_parent_level: pair.parent_level,
                    expected_parent_id: pair.parent_id,
                    actual_parent_id,
                });
            }
        }
        Ok(())
    }

    /// Gate for writing a node of `level` with id `child_id` under
    /// `parent_id`: the parent must exist at the mandated level, a caller
    /// supplied id for that level must agree with it, and the rest of the
    /// placement must be consistent.
    pub async fn check_placement(
        &self,
        level: HierarchyLevel,
        child_id: Uuid,
        parent_id: Option<Uuid>,
        placement: &PartialHierarchy,
    ) -> Result<()> {
        let Some(parent_level) = level.parent() else {
            if parent_id.is_some() {
                return Err(DomainError::InvalidRequest(format!(
                    "{} nodes have no parent",
                    level
                )));
            }
            return Ok(());
        };
        let parent_id = parent_id.ok_or_else(|| {
            DomainError::InvalidRequest(format!("{} requires a {} parent", level, parent_level))
        })?;

        // Existence of the parent itself
        self.resolver.lookup(parent_level, parent_id).await?;

        if let Some(supplied) = placement.get(parent_level) {
            if supplied != parent_id {
                return Err(DomainError::Validation {
                    child_level: level,
                    child_id,
                    expected_parent_level: parent_level,
                    expected_parent_id: supplied,
                    actual_parent_id: Some(parent_id),
                });
            }
        }

        self.check_full_hierarchy(&placement.with_default(parent_level, parent_id))
            .await
    }
}
