//! Domain and store error types

use crate::connection::models::ConnectionStatus;
use crate::hierarchy::models::HierarchyLevel;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by repository backends.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write (EAN, billing key, id)
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// The referenced parent disappeared before the write committed
    #[error("Parent {level} {id} does not exist")]
    ParentMissing { level: HierarchyLevel, id: Uuid },

    /// The record was not found at write time
    #[error("{level} {id} does not exist")]
    Missing { level: HierarchyLevel, id: Uuid },

    /// Deletion refused because children still reference the node
    #[error("{level} {id} still has {children} child node(s)")]
    HasChildren {
        level: HierarchyLevel,
        id: Uuid,
        children: usize,
    },

    /// The record breaks an invariant the store enforces on every write
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Optimistic version check failed
    #[error("Version conflict on connection {id}: expected {expected}, found {found}")]
    VersionConflict { id: Uuid, expected: u64, found: u64 },

    /// Transient infrastructure failure, safe to retry
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors returned by the hierarchy, lifecycle and billing engines.
#[derive(Error, Debug)]
pub enum DomainError {
    /// A node or one of its ancestors could not be found
    #[error("{level} {id} not found")]
    NotFound { level: HierarchyLevel, id: Uuid },

    /// Two adjacent levels of a placement disagree
    #[error(
        "{child_level} {child_id} does not belong to {expected_parent_level} {expected_parent_id} (stored parent: {actual_parent_id:?})"
    )]
    Validation {
        child_level: HierarchyLevel,
        child_id: Uuid,
        expected_parent_level: HierarchyLevel,
        expected_parent_id: Uuid,
        actual_parent_id: Option<Uuid>,
    },

    /// The requested edge is not in the lifecycle transition table
    #[error("Illegal transition for connection {connection_id}: {from} -> {to}")]
    IllegalTransition {
        connection_id: Uuid,
        from: ConnectionStatus,
        to: ConnectionStatus,
    },

    /// The edge is legal but its guard rejected it
    #[error("Guard failed for connection {connection_id} -> {target}: {reason}")]
    GuardFailed {
        connection_id: Uuid,
        target: ConnectionStatus,
        reason: String,
    },

    /// A uniqueness collision that could not be resolved internally
    #[error("Duplicate key: {key}")]
    DuplicateKey { key: String },

    /// Deletion blocked while the node still has children
    #[error("{level} {id} still has {children} child node(s)")]
    HasChildren {
        level: HierarchyLevel,
        id: Uuid,
        children: usize,
    },

    /// Another writer advanced the connection first
    #[error("Connection {connection_id} was modified concurrently")]
    Conflict { connection_id: Uuid },

    /// A mandated billing side effect could not be recorded
    #[error("Billing for connection {connection_id} failed: {reason}")]
    BillingFailed { connection_id: Uuid, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DomainError {
    /// Transient failures may be retried; validation and guard failures never.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Conflict { .. } => true,
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Give constraint failures raised by a commit their domain meaning
    pub(crate) fn lift_commit(self) -> Self {
        match self {
            Self::Store(StoreError::ParentMissing { level, id })
            | Self::Store(StoreError::Missing { level, id }) => Self::NotFound { level, id },
            Self::Store(StoreError::VersionConflict { id, .. }) => Self::Conflict { connection_id: id },
            Self::Store(StoreError::DuplicateKey(key)) => Self::DuplicateKey { key },
            Self::Store(StoreError::HasChildren { level, id, children }) => Self::HasChildren {
                level,
                id,
                children,
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;
