//! Connection records and the lifecycle status enum

use crate::hierarchy::models::{HierarchyLevel, HierarchyNode, PartialHierarchy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle status of a connection request
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Draft, not yet sent to the grid operator
    #[default]
    Concept,
    Submitted,
    InProgress,
    Planned,
    /// Physically connected, EAN assigned
    Connected,
    /// Live subscription, billed monthly
    Active,
    Deregistering,
    Ended,
    Cancelled,
}

impl ConnectionStatus {
    /// The forward path, in order. Cancelled is reachable from any
    /// non-terminal status and is not part of it.
    pub const FORWARD: [ConnectionStatus; 8] = [
        Self::Concept,
        Self::Submitted,
        Self::InProgress,
        Self::Planned,
        Self::Connected,
        Self::Active,
        Self::Deregistering,
        Self::Ended,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Cancelled)
    }

    /// The single legal forward successor, if any
    pub fn next(self) -> Option<ConnectionStatus> {
        let pos = Self::FORWARD.iter().position(|s| *s == self)?;
        Self::FORWARD.get(pos + 1).copied()
    }

    /// Whether `self -> target` is an edge of the transition table
    pub fn can_transition_to(self, target: ConnectionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        target == Self::Cancelled || self.next() == Some(target)
    }

    /// Every status reachable in one step
    pub fn available_transitions(self) -> Vec<ConnectionStatus> {
        if self.is_terminal() {
            return Vec::new();
        }
        let mut targets: Vec<ConnectionStatus> = self.next().into_iter().collect();
        targets.push(Self::Cancelled);
        targets
    }

    /// Whether an EAN must be present in this status
    pub fn requires_ean(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Active | Self::Deregistering | Self::Ended
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concept => write!(f, "concept"),
            Self::Submitted => write!(f, "submitted"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Planned => write!(f, "planned"),
            Self::Connected => write!(f, "connected"),
            Self::Active => write!(f, "active"),
            Self::Deregistering => write!(f, "deregistering"),
            Self::Ended => write!(f, "ended"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "concept" => Ok(Self::Concept),
            "submitted" => Ok(Self::Submitted),
            "in_progress" | "inprogress" => Ok(Self::InProgress),
            "planned" => Ok(Self::Planned),
            "connected" => Ok(Self::Connected),
            "active" => Ok(Self::Active),
            "deregistering" => Ok(Self::Deregistering),
            "ended" => Ok(Self::Ended),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown connection status: {}", s)),
        }
    }
}

/// Kind of utility delivered by a connection
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UtilityKind {
    #[default]
    Electricity,
    Gas,
    Heat,
    Water,
}

impl fmt::Display for UtilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Electricity => write!(f, "electricity"),
            Self::Gas => write!(f, "gas"),
            Self::Heat => write!(f, "heat"),
            Self::Water => write!(f, "water"),
        }
    }
}

impl FromStr for UtilityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "electricity" => Ok(Self::Electricity),
            "gas" => Ok(Self::Gas),
            "heat" => Ok(Self::Heat),
            "water" => Ok(Self::Water),
            _ => Err(format!("Unknown utility kind: {}", s)),
        }
    }
}

/// A utility connection request, a leaf under an Object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    pub id: Uuid,
    pub name: String,
    pub object_id: Uuid,
    pub utility: UtilityKind,
    pub status: ConnectionStatus,
    /// Grid identifier, assigned on reaching Connected
    pub ean: Option<String>,
    /// Requested capacity (e.g. "3x25A")
    pub capacity: Option<String>,
    pub grid_operator: Option<String>,
    pub request_date: Option<DateTime<Utc>>,
    pub in_progress_date: Option<DateTime<Utc>>,
    pub planned_connection_date: Option<DateTime<Utc>>,
    pub connected_date: Option<DateTime<Utc>>,
    pub activation_date: Option<DateTime<Utc>>,
    pub deregistration_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub cancelled_date: Option<DateTime<Utc>>,
    pub is_active_subscription: bool,
    /// Bumped on every committed write; used for optimistic concurrency
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Connection {
    /// New connection in Concept under the given object
    pub fn new(
        object_id: Uuid,
        name: impl Into<String>,
        utility: UtilityKind,
        capacity: Option<String>,
        grid_operator: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            object_id,
            utility,
            status: ConnectionStatus::Concept,
            ean: None,
            capacity,
            grid_operator,
            request_date: None,
            in_progress_date: None,
            planned_connection_date: None,
            connected_date: None,
            activation_date: None,
            deregistration_date: None,
            end_date: None,
            cancelled_date: None,
            is_active_subscription: false,
            version: 0,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// Project into a hierarchy node so generic walkers can start here
    pub fn as_node(&self) -> HierarchyNode {
        HierarchyNode {
            id: self.id,
            level: HierarchyLevel::Connection,
            name: self.name.clone(),
            parent_id: Some(self.object_id),
            monthly_ean_rate_cents: None,
            created_at: self.created_at,
        }
    }

    /// Record the milestone timestamp belonging to `status`
    pub fn stamp_milestone(&mut self, status: ConnectionStatus, at: DateTime<Utc>) {
        let slot = match status {
            ConnectionStatus::Concept => return,
            ConnectionStatus::Submitted => &mut self.request_date,
            ConnectionStatus::InProgress => &mut self.in_progress_date,
            ConnectionStatus::Planned => &mut self.planned_connection_date,
            ConnectionStatus::Connected => &mut self.connected_date,
            ConnectionStatus::Active => &mut self.activation_date,
            ConnectionStatus::Deregistering => &mut self.deregistration_date,
            ConnectionStatus::Ended => &mut self.end_date,
            ConnectionStatus::Cancelled => &mut self.cancelled_date,
        };
        // The planned date may be set ahead of time by the operator
        if slot.is_none() {
            *slot = Some(at);
        }
    }

    /// Eligible for the monthly EAN fee sweep
    pub fn is_billable_subscription(&self) -> bool {
        self.is_active_subscription
            && self.status == ConnectionStatus::Active
            && self.ean.is_some()
    }
}

/// Request to create a connection under an object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConnectionRequest {
    pub object_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub utility: UtilityKind,
    pub capacity: Option<String>,
    pub grid_operator: Option<String>,
    #[serde(default)]
    pub placement: PartialHierarchy,
}
