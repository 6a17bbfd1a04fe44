//! Hierarchy levels, level metadata and node models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Levels
// ============================================================================

/// One level of the ownership hierarchy, top to bottom.
///
/// Connection, Meter and Document are co-equal leaves under Object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum HierarchyLevel {
    Organization,
    Entity,
    Category,
    Project,
    Complex,
    Object,
    Connection,
    Meter,
    Document,
}

/// Static description of how a level links to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelMeta {
    pub level: HierarchyLevel,
    /// Name of the foreign-key field holding the parent id
    pub parent_field: Option<&'static str>,
    pub parent_level: Option<HierarchyLevel>,
}

/// Level metadata table shared by every walker and validator.
pub const LEVELS: [LevelMeta; 9] = [
    LevelMeta {
        level: HierarchyLevel::Organization,
        parent_field: None,
        parent_level: None,
    },
    LevelMeta {
        level: HierarchyLevel::Entity,
        parent_field: Some("organization_id"),
        parent_level: Some(HierarchyLevel::Organization),
    },
    LevelMeta {
        level: HierarchyLevel::Category,
        parent_field: Some("entity_id"),
        parent_level: Some(HierarchyLevel::Entity),
    },
    LevelMeta {
        level: HierarchyLevel::Project,
        parent_field: Some("category_id"),
        parent_level: Some(HierarchyLevel::Category),
    },
    LevelMeta {
        level: HierarchyLevel::Complex,
        parent_field: Some("project_id"),
        parent_level: Some(HierarchyLevel::Project),
    },
    LevelMeta {
        level: HierarchyLevel::Object,
        parent_field: Some("complex_id"),
        parent_level: Some(HierarchyLevel::Complex),
    },
    LevelMeta {
        level: HierarchyLevel::Connection,
        parent_field: Some("object_id"),
        parent_level: Some(HierarchyLevel::Object),
    },
    LevelMeta {
        level: HierarchyLevel::Meter,
        parent_field: Some("object_id"),
        parent_level: Some(HierarchyLevel::Object),
    },
    LevelMeta {
        level: HierarchyLevel::Document,
        parent_field: Some("object_id"),
        parent_level: Some(HierarchyLevel::Object),
    },
];

impl HierarchyLevel {
    /// The six structural levels, top to bottom (leaves excluded).
    pub const CHAIN: [HierarchyLevel; 6] = [
        Self::Organization,
        Self::Entity,
        Self::Category,
        Self::Project,
        Self::Complex,
        Self::Object,
    ];

    pub fn meta(self) -> &'static LevelMeta {
        // LEVELS is declared in variant order
        &LEVELS[self as usize]
    }

    pub fn parent(self) -> Option<HierarchyLevel> {
        self.meta().parent_level
    }

    pub fn parent_field(self) -> Option<&'static str> {
        self.meta().parent_field
    }

    /// Whether this level is a leaf hanging under an Object
    pub fn is_leaf(self) -> bool {
        matches!(self, Self::Connection | Self::Meter | Self::Document)
    }

    /// Graph label used by the Neo4j backend
    pub fn label(self) -> &'static str {
        match self {
            Self::Organization => "Organization",
            Self::Entity => "Entity",
            Self::Category => "Category",
            Self::Project => "Project",
            Self::Complex => "Complex",
            Self::Object => "HierarchyObject",
            Self::Connection => "Connection",
            Self::Meter => "Meter",
            Self::Document => "Document",
        }
    }
}

impl fmt::Display for HierarchyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Organization => write!(f, "organization"),
            Self::Entity => write!(f, "entity"),
            Self::Category => write!(f, "category"),
            Self::Project => write!(f, "project"),
            Self::Complex => write!(f, "complex"),
            Self::Object => write!(f, "object"),
            Self::Connection => write!(f, "connection"),
            Self::Meter => write!(f, "meter"),
            Self::Document => write!(f, "document"),
        }
    }
}

impl FromStr for HierarchyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "organization" => Ok(Self::Organization),
            "entity" => Ok(Self::Entity),
            "category" => Ok(Self::Category),
            "project" => Ok(Self::Project),
            "complex" => Ok(Self::Complex),
            "object" | "hierarchy_object" => Ok(Self::Object),
            "connection" => Ok(Self::Connection),
            "meter" => Ok(Self::Meter),
            "document" => Ok(Self::Document),
            _ => Err(format!("Unknown hierarchy level: {}", s)),
        }
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// A node of the ownership tree.
///
/// Connections are stored as their own record type; repositories project
/// them into a `HierarchyNode` so one walker covers every level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HierarchyNode {
    pub id: Uuid,
    pub level: HierarchyLevel,
    pub name: String,
    /// None only for Organization
    pub parent_id: Option<Uuid>,
    /// Monthly EAN rate in cents (Organization only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_ean_rate_cents: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl HierarchyNode {
    pub fn new(level: HierarchyLevel, name: impl Into<String>, parent_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            name: name.into(),
            parent_id,
            monthly_ean_rate_cents: None,
            created_at: Utc::now(),
        }
    }

    /// Create an organization root
    pub fn organization(name: impl Into<String>, monthly_ean_rate_cents: Option<i64>) -> Self {
        let mut node = Self::new(HierarchyLevel::Organization, name, None);
        node.monthly_ean_rate_cents = monthly_ean_rate_cents;
        node
    }
}

/// Id and display name of one level in a resolved path
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathSegment {
    pub level: HierarchyLevel,
    pub id: Uuid,
    pub name: String,
}

/// Full chain from a starting node up to its Organization.
///
/// Levels below the starting node are absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Path {
    /// Segments ordered from the starting node up to the Organization
    pub segments: Vec<PathSegment>,
}

impl Path {
    pub fn get(&self, level: HierarchyLevel) -> Option<&PathSegment> {
        self.segments.iter().find(|s| s.level == level)
    }

    pub fn id(&self, level: HierarchyLevel) -> Option<Uuid> {
        self.get(level).map(|s| s.id)
    }

    pub fn name(&self, level: HierarchyLevel) -> Option<&str> {
        self.get(level).map(|s| s.name.as_str())
    }

    pub fn organization_id(&self) -> Option<Uuid> {
        self.id(HierarchyLevel::Organization)
    }

    /// Human-readable breadcrumb, root first (e.g. "Acme / Utilities / ...")
    pub fn display_names(&self) -> String {
        self.segments
            .iter()
            .rev()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(" / ")
    }
}

/// A subset of ancestor ids supplied by a caller before a write
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartialHierarchy {
    #[serde(default)]
    pub object_id: Option<Uuid>,
    #[serde(default)]
    pub complex_id: Option<Uuid>,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub category_id: Option<Uuid>,
    #[serde(default)]
    pub entity_id: Option<Uuid>,
    #[serde(default)]
    pub organization_id: Option<Uuid>,
}

impl PartialHierarchy {
    pub fn get(&self, level: HierarchyLevel) -> Option<Uuid> {
        match level {
            HierarchyLevel::Organization => self.organization_id,
            HierarchyLevel::Entity => self.entity_id,
            HierarchyLevel::Category => self.category_id,
            HierarchyLevel::Project => self.project_id,
            HierarchyLevel::Complex => self.complex_id,
            HierarchyLevel::Object => self.object_id,
            _ => None,
        }
    }

    /// Set the id for a structural level; leaves are ignored
    pub fn set(&mut self, level: HierarchyLevel, id: Uuid) {
        match level {
            HierarchyLevel::Organization => self.organization_id = Some(id),
            HierarchyLevel::Entity => self.entity_id = Some(id),
            HierarchyLevel::Category => self.category_id = Some(id),
            HierarchyLevel::Project => self.project_id = Some(id),
            HierarchyLevel::Complex => self.complex_id = Some(id),
            HierarchyLevel::Object => self.object_id = Some(id),
            _ => {}
        }
    }

    /// Copy of `self` with `level` set to `id`, unless the caller already
    /// supplied a value for it
    pub fn with_default(mut self, level: HierarchyLevel, id: Uuid) -> Self {
        if self.get(level).is_none() {
            self.set(level, id);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        HierarchyLevel::CHAIN.iter().all(|l| self.get(*l).is_none())
    }
}

/// Request to create a hierarchy node (any level except Connection)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateNodeRequest {
    pub level: HierarchyLevel,
    pub name: String,
    pub parent_id: Option<Uuid>,
    /// Ancestor ids known to the caller, checked for consistency
    #[serde(default)]
    pub placement: PartialHierarchy,
    /// Organization only
    #[serde(default)]
    pub monthly_ean_rate_cents: Option<i64>,
}
