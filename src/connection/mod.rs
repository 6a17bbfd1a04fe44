//! Connection records, EAN generation and the lifecycle state machine

pub mod ean;
pub mod lifecycle;
pub mod models;

pub use ean::{EanGenerator, EanSettings};
pub use lifecycle::{ConnectionLifecycle, TransitionOutcome};
pub use models::{Connection, ConnectionStatus, CreateConnectionRequest, UtilityKind};
