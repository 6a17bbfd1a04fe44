//! Persistence seam: the Repository trait and its backends

pub mod memory;
pub mod neo4j;
pub mod resilience;
pub mod traits;

pub use memory::MemoryRepository;
pub use neo4j::Neo4jRepository;
pub use resilience::{CallPolicy, StoreSettings};
pub use traits::{NodePatch, Repository, WriteBatch};
