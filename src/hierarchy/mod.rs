//! Ownership hierarchy: level metadata, path resolution, placement
//! validation and node administration

pub mod models;
pub mod resolver;
pub mod service;
pub mod validator;

pub use models::{
    CreateNodeRequest, HierarchyLevel, HierarchyNode, LevelMeta, PartialHierarchy, Path,
    PathSegment, LEVELS,
};
pub use resolver::PathResolver;
pub use service::{CreatedNode, HierarchyService};
pub use validator::HierarchyValidator;
