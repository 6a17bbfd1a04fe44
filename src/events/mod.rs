//! Mutation events
//!
//! - `CrudEvent`: typed events emitted after every committed mutation
//! - `EventBus`: broadcast channel, optionally filtered per organization

mod bus;
mod types;

pub use bus::{EventBus, OrganizationEvents};
pub use types::{CrudAction, CrudEvent, EntityType, EventEmitter, NoopEmitter};
